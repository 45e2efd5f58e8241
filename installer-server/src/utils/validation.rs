// Input validation utilities

use regex::Regex;
use url::Url;

/// Validate a database host name or address.
pub fn validate_host(host: &str) -> Result<(), String> {
    let h = host.trim();
    if h.is_empty() {
        return Err("Database host is required.".to_string());
    }
    if h.len() > 255 {
        return Err("Database host must be 255 characters or fewer.".to_string());
    }
    if h.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("Database host must not contain whitespace.".to_string());
    }
    Ok(())
}

/// Validate a TCP port (0 is rejected).
pub fn validate_port(port: u16) -> Result<(), String> {
    if port == 0 {
        return Err("Database port must be between 1 and 65535.".to_string());
    }
    Ok(())
}

/// Validate the public application URL (absolute http/https with a host).
pub fn validate_app_url(raw: &str) -> Result<(), String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("Application URL is required.".to_string());
    }
    let parsed = Url::parse(s).map_err(|e| format!("Application URL is invalid: {}", e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(format!(
                "Application URL must use http or https (got '{}').",
                other
            ))
        }
    }
    if parsed.host_str().map(|h| h.is_empty()).unwrap_or(true) {
        return Err("Application URL must include a host.".to_string());
    }
    Ok(())
}

/// Validate an administrator e-mail address (shape check only).
pub fn validate_email(raw: &str) -> Result<(), String> {
    let s = raw.trim();
    let re = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .map_err(|e| format!("Internal error: failed to compile e-mail regex: {}", e))?;
    if !re.is_match(s) {
        return Err("Admin e-mail address is invalid.".to_string());
    }
    Ok(())
}

/// Validate the runtime environment name.
pub fn validate_environment(raw: &str) -> Result<(), String> {
    match raw.trim() {
        "production" | "development" | "staging" | "test" => Ok(()),
        "" => Err("Environment is required.".to_string()),
        other => Err(format!(
            "Environment '{}' is not supported (use production, staging, development or test).",
            other
        )),
    }
}

/// Validate a secret value supplied by the client (non-empty, single line).
pub fn validate_secret(label: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is required.", label));
    }
    if value.contains('\n') || value.contains('\r') || value.contains('\0') {
        return Err(format!("{} must be a single line.", label));
    }
    Ok(())
}
