// Environment file rendering.
//
// Pure: `render` never touches the filesystem. Values are written in the dotenv
// dialect the Node runtime reads (`--env-file`, `util.parseEnv`), which has no
// escape sequences: single-, double- and backtick-quoted values are taken
// literally, double quotes only turning `\n` into a line break.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

use crate::models::requests::InstallationRequest;

const HEADER: &str = "# Generated by the installer. Contains secrets: keep this file private.";

/// Key written only when a timestamp is supplied.
pub const GENERATED_AT_KEY: &str = "INSTALLER_GENERATED_AT";

/// A value the dotenv dialect has no literal spelling for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{key} cannot be written to the environment file")]
pub struct UnrepresentableValue {
    pub key: String,
}

/// Quote a value so the runtime reads back exactly `value`.
///
/// Prefers single quotes; falls back to double quotes (no `"`, `$` or `\`) and
/// then backticks. `None` when the value holds a line break, a NUL, or all
/// three quote characters.
pub fn quote_value(value: &str) -> Option<String> {
    if value.contains(['\n', '\r', '\0']) {
        return None;
    }
    if !value.contains('\'') {
        return Some(format!("'{}'", value));
    }
    if !value.contains(['"', '$', '\\']) {
        return Some(format!("\"{}\"", value));
    }
    if !value.contains('`') {
        return Some(format!("`{}`", value));
    }
    None
}

/// Validation hook for request fields that end up in the environment file.
pub fn check_representable(label: &str, value: &str) -> Result<(), String> {
    match quote_value(value) {
        Some(_) => Ok(()),
        None => Err(format!(
            "{} must be a single line and must not contain all of ', \" and ` together.",
            label
        )),
    }
}

/// Ordered key/value pairs for a request.
pub fn entries(request: &InstallationRequest) -> Vec<(&'static str, String)> {
    let db = request.database();
    let cfg = request.config();

    let mut out = vec![
        ("NODE_ENV", cfg.environment.clone()),
        ("APP_URL", cfg.app_url.clone()),
    ];
    if let Some(email) = &cfg.admin_email {
        out.push(("ADMIN_EMAIL", email.clone()));
    }
    out.extend([
        ("DB_HOST", db.host.clone()),
        ("DB_PORT", db.port.to_string()),
        ("DB_NAME", db.name.clone()),
        ("DB_USER", db.username.clone()),
        ("DB_PASSWORD", db.password.clone()),
        ("JWT_SECRET", cfg.secrets.jwt_secret.clone()),
        ("STRIPE_SECRET_KEY", cfg.secrets.payment_secret_key.clone()),
        ("STRIPE_PUBLISHABLE_KEY", cfg.secrets.payment_public_key.clone()),
    ]);
    out
}

/// Render the environment file for `request`.
///
/// Deterministic: identical inputs give byte-identical output.
pub fn render(
    request: &InstallationRequest,
    generated_at: Option<DateTime<Utc>>,
) -> Result<String, UnrepresentableValue> {
    let mut lines = entries(request);
    if let Some(ts) = generated_at {
        lines.push((GENERATED_AT_KEY, ts.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }

    let mut text = String::new();
    text.push_str(HEADER);
    text.push('\n');
    for (key, value) in lines {
        let quoted = quote_value(&value).ok_or_else(|| UnrepresentableValue {
            key: key.to_string(),
        })?;
        text.push_str(key);
        text.push('=');
        text.push_str(&quoted);
        text.push('\n');
    }
    Ok(text)
}

/// Read back a file produced by [`render`], with the runtime's reading of
/// quotes. Comments and blank lines are skipped.
pub fn parse(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        out.insert(key.trim().to_string(), unquote(raw.trim()));
    }
    out
}

fn unquote(raw: &str) -> String {
    for q in ['\'', '"', '`'] {
        if let Some(inner) = raw.strip_prefix(q).and_then(|s| s.strip_suffix(q)) {
            if q == '"' {
                return inner.replace("\\n", "\n");
            }
            return inner.to_string();
        }
    }
    raw.to_string()
}
