// API request models
//
// Wire DTOs posted by the setup wizard plus the validated, immutable
// `InstallationRequest` the orchestrator consumes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::provisioning::validate_db_name;
use crate::installation::env_file::check_representable;
use crate::security::crypto::generate_secret;
use crate::utils::logging::mask_sensitive;
use crate::utils::validation::{
    validate_app_url, validate_email, validate_environment, validate_host, validate_port,
    validate_secret,
};

fn default_db_port() -> u16 {
    3306
}

fn default_environment() -> String {
    "production".to_string()
}

/// A required field is missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

fn check(field: &str, res: Result<(), String>) -> Result<(), ValidationError> {
    res.map_err(|m| ValidationError::new(field, m))
}

// =========================
// Database
// =========================

/// Database endpoint + credentials (`/test-database` body, `database` part of `/install`).
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCredentials {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default, alias = "database")]
    pub name: String,
    #[serde(default, alias = "user")]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl DatabaseCredentials {
    /// Fields needed to open a server-level connection (no database selected).
    pub fn validate_for_connection(&self) -> Result<(), ValidationError> {
        check("database.host", validate_host(&self.host))?;
        check("database.port", validate_port(self.port))?;
        if self.username.trim().is_empty() {
            return Err(ValidationError::new(
                "database.username",
                "Database username is required.",
            ));
        }
        Ok(())
    }

    /// Connection fields plus a database name that is safe to create.
    pub fn validate_for_install(&self) -> Result<(), ValidationError> {
        self.validate_for_connection()?;
        check("database.name", validate_db_name(&self.name))
    }
}

// =========================
// Application config
// =========================

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsInput {
    /// Optional: generated server-side when absent or blank.
    #[serde(default, skip_serializing)]
    pub jwt_secret: Option<String>,
    #[serde(default, skip_serializing)]
    pub payment_secret_key: String,
    #[serde(default)]
    pub payment_public_key: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfigInput {
    #[serde(default)]
    pub app_url: String,
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(flatten)]
    pub secrets: SecretsInput,
}

impl fmt::Debug for ApplicationConfigInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationConfigInput")
            .field("app_url", &self.app_url)
            .field("admin_email", &self.admin_email)
            .field("environment", &self.environment)
            .field("jwt_secret_supplied", &self.secrets.jwt_secret.is_some())
            .field(
                "payment_public_key",
                &mask_sensitive(&self.secrets.payment_public_key),
            )
            .finish()
    }
}

/// `POST /install` body: `{ database: {...}, config: {...} }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPayload {
    #[serde(default)]
    pub database: DatabaseCredentials,
    #[serde(default)]
    pub config: ApplicationConfigInput,
}

/// `POST /test-payment` body.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentKeysRequest {
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub public_key: String,
}

impl fmt::Debug for PaymentKeysRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentKeysRequest")
            .field("secret_key", &"***")
            .field("public_key", &mask_sensitive(&self.public_key))
            .finish()
    }
}

// =========================
// Validated request
// =========================

/// Resolved secrets; the signing secret is always present here.
#[derive(Clone)]
pub struct Secrets {
    pub jwt_secret: String,
    pub payment_secret_key: String,
    pub payment_public_key: String,
}

#[derive(Clone)]
pub struct ApplicationConfig {
    pub app_url: String,
    pub admin_email: Option<String>,
    pub environment: String,
    pub secrets: Secrets,
}

/// Validated installation input. Only obtainable through [`InstallationRequest::from_payload`].
#[derive(Clone)]
pub struct InstallationRequest {
    database: DatabaseCredentials,
    config: ApplicationConfig,
    jwt_secret_generated: bool,
}

impl fmt::Debug for InstallationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationRequest")
            .field("database", &self.database)
            .field("app_url", &self.config.app_url)
            .field("environment", &self.config.environment)
            .field("jwt_secret_generated", &self.jwt_secret_generated)
            .finish()
    }
}

impl InstallationRequest {
    /// Validate every required field and resolve the signing secret.
    ///
    /// Pure apart from reading the OS random source.
    pub fn from_payload(payload: InstallPayload) -> Result<Self, ValidationError> {
        let InstallPayload { database, config } = payload;

        database.validate_for_install()?;
        check("config.appUrl", validate_app_url(&config.app_url))?;
        check("config.environment", validate_environment(&config.environment))?;

        let admin_email = match config.admin_email.as_deref().map(str::trim) {
            Some(e) if !e.is_empty() => {
                check("config.adminEmail", validate_email(e))?;
                Some(e.to_string())
            }
            _ => None,
        };

        let secrets = config.secrets;
        check(
            "config.paymentSecretKey",
            validate_secret("Payment secret key", &secrets.payment_secret_key),
        )?;
        check(
            "config.paymentPublicKey",
            validate_secret("Payment public key", &secrets.payment_public_key),
        )?;
        if database.password.contains('\n') || database.password.contains('\0') {
            return Err(ValidationError::new(
                "database.password",
                "Database password must be a single line.",
            ));
        }

        let (jwt_secret, jwt_secret_generated) = match secrets.jwt_secret {
            Some(s) if !s.trim().is_empty() => {
                check("config.jwtSecret", validate_secret("JWT secret", &s))?;
                (s, false)
            }
            _ => {
                let generated = generate_secret().map_err(|e| {
                    ValidationError::new("config.jwtSecret", format!("{:#}", e))
                })?;
                (generated, true)
            }
        };

        // Everything below is written verbatim into the environment file.
        for (field, label, value) in [
            ("database.username", "Database username", database.username.trim()),
            ("database.password", "Database password", database.password.as_str()),
            ("config.appUrl", "Application URL", config.app_url.trim()),
            ("config.adminEmail", "Admin email", admin_email.as_deref().unwrap_or_default()),
            ("config.jwtSecret", "JWT secret", jwt_secret.as_str()),
            ("config.paymentSecretKey", "Payment secret key", secrets.payment_secret_key.trim()),
            ("config.paymentPublicKey", "Payment public key", secrets.payment_public_key.trim()),
        ] {
            check(field, check_representable(label, value))?;
        }

        Ok(Self {
            database: DatabaseCredentials {
                host: database.host.trim().to_string(),
                port: database.port,
                name: database.name.trim().to_string(),
                username: database.username.trim().to_string(),
                password: database.password,
            },
            config: ApplicationConfig {
                app_url: config.app_url.trim().to_string(),
                admin_email,
                environment: config.environment.trim().to_string(),
                secrets: Secrets {
                    jwt_secret,
                    payment_secret_key: secrets.payment_secret_key.trim().to_string(),
                    payment_public_key: secrets.payment_public_key.trim().to_string(),
                },
            },
            jwt_secret_generated,
        })
    }

    pub fn database(&self) -> &DatabaseCredentials {
        &self.database
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    pub fn jwt_secret_generated(&self) -> bool {
        self.jwt_secret_generated
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn sample_payload_is_valid() {
        let req = sample_request();
        assert_eq!(req.database().name, "app_db");
        assert_eq!(req.database().port, 3306);
        assert_eq!(req.config().secrets.jwt_secret, "abc123");
        assert!(!req.jwt_secret_generated());
        assert!(req.config().admin_email.is_none());
    }

    #[test]
    fn missing_jwt_secret_is_generated() {
        let mut payload = sample_payload();
        payload.config.secrets.jwt_secret = None;
        let req = InstallationRequest::from_payload(payload).expect("valid");
        assert!(req.jwt_secret_generated());
        assert_eq!(req.config().secrets.jwt_secret.len(), 64);

        let mut blank = sample_payload();
        blank.config.secrets.jwt_secret = Some("   ".to_string());
        let req = InstallationRequest::from_payload(blank).expect("valid");
        assert!(req.jwt_secret_generated());
    }

    #[test]
    fn required_fields_are_enforced() {
        let cases: Vec<(&str, Box<dyn Fn(&mut InstallPayload)>)> = vec![
            ("database.host", Box::new(|p| p.database.host.clear())),
            ("database.port", Box::new(|p| p.database.port = 0)),
            ("database.username", Box::new(|p| p.database.username.clear())),
            ("database.name", Box::new(|p| p.database.name.clear())),
            ("config.appUrl", Box::new(|p| p.config.app_url.clear())),
            (
                "config.environment",
                Box::new(|p| p.config.environment = "qa\nX=1".to_string()),
            ),
            (
                "config.paymentSecretKey",
                Box::new(|p| p.config.secrets.payment_secret_key.clear()),
            ),
            (
                "config.paymentPublicKey",
                Box::new(|p| p.config.secrets.payment_public_key.clear()),
            ),
            (
                "config.adminEmail",
                Box::new(|p| p.config.admin_email = Some("nope".to_string())),
            ),
        ];

        for (field, mutate) in cases {
            let mut payload = sample_payload();
            mutate(&mut payload);
            let err = InstallationRequest::from_payload(payload).unwrap_err();
            assert_eq!(err.field, field, "unexpected error: {}", err);
        }
    }

    #[test]
    fn database_name_must_be_a_safe_identifier() {
        let mut payload = sample_payload();
        payload.database.name = "app`; DROP DATABASE x; --".to_string();
        let err = InstallationRequest::from_payload(payload).unwrap_err();
        assert_eq!(err.field, "database.name");
    }

    #[test]
    fn values_without_a_literal_dotenv_spelling_are_rejected() {
        let mut payload = sample_payload();
        payload.database.password = "a'b\"c`d".to_string();
        let err = InstallationRequest::from_payload(payload).unwrap_err();
        assert_eq!(err.field, "database.password");

        let mut payload = sample_payload();
        payload.database.password = "carriage\rreturn".to_string();
        let err = InstallationRequest::from_payload(payload).unwrap_err();
        assert_eq!(err.field, "database.password");

        let mut payload = sample_payload();
        payload.config.secrets.jwt_secret = Some("'\"`".to_string());
        let err = InstallationRequest::from_payload(payload).unwrap_err();
        assert_eq!(err.field, "config.jwtSecret");

        let mut payload = sample_payload();
        payload.database.password = "pa$$w\"rd\\1".to_string();
        assert!(InstallationRequest::from_payload(payload).is_ok());
    }

    #[test]
    fn database_alias_is_accepted_for_name() {
        let creds: DatabaseCredentials = serde_json::from_value(serde_json::json!({
            "host": "db",
            "database": "shop",
            "username": "u",
            "password": "p"
        }))
        .expect("parse");
        assert_eq!(creds.name, "shop");
        assert_eq!(creds.port, 3306, "port defaults to 3306");
    }

    #[test]
    fn debug_output_never_contains_secrets() {
        let mut payload = sample_payload();
        payload.database.password = "PASSWORD_SHOULD_BE_REDACTED".to_string();
        payload.config.secrets.payment_secret_key = "sk_test_SHOULD_BE_REDACTED".to_string();
        let dbg = format!("{:?}", payload);
        assert!(!dbg.contains("PASSWORD_SHOULD_BE_REDACTED"), "{}", dbg);
        assert!(!dbg.contains("sk_test_SHOULD_BE_REDACTED"), "{}", dbg);

        let req = InstallationRequest::from_payload(payload).expect("valid");
        let dbg = format!("{:?}", req);
        assert!(!dbg.contains("PASSWORD_SHOULD_BE_REDACTED"), "{}", dbg);
        assert!(!dbg.contains("abc123"), "{}", dbg);
    }

    #[test]
    fn payload_serialization_skips_secrets() {
        let json = serde_json::to_string(&sample_payload()).expect("serialize");
        assert!(!json.contains("sk_test"), "{}", json);
        assert!(!json.contains("abc123"), "{}", json);
        assert!(json.contains("pk_test"));
    }
}
