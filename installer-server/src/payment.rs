// Payment gateway credential check
//
// One authenticated, read-only call (`GET /v1/balance`) tells a rejected key
// (HTTP 401) apart from an unreachable gateway.

use log::{info, warn};
use reqwest::StatusCode;
use std::time::{Duration, Instant};

use crate::utils::logging::mask_sensitive;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentGatewayError {
    #[error("invalid key")]
    InvalidKey,
    #[error("{0}")]
    KeyFormat(String),
    #[error("Payment gateway returned HTTP {0}")]
    UnexpectedStatus(u16),
    #[error("Payment gateway unreachable: {0}")]
    Transport(String),
}

impl PaymentGatewayError {
    /// True when the gateway itself rejected the key.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMode {
    Test,
    Live,
}

fn key_mode(rest: &str) -> Option<KeyMode> {
    if rest.starts_with("test") {
        Some(KeyMode::Test)
    } else if rest.starts_with("live") {
        Some(KeyMode::Live)
    } else {
        None
    }
}

/// Prefix and mode checks that need no network.
pub fn check_key_format(secret_key: &str, public_key: &str) -> Result<(), PaymentGatewayError> {
    let secret_key = secret_key.trim();
    let public_key = public_key.trim();

    let secret_rest = secret_key
        .strip_prefix("sk_")
        .or_else(|| secret_key.strip_prefix("rk_"))
        .ok_or_else(|| {
            PaymentGatewayError::KeyFormat(
                "Secret key must start with 'sk_' or 'rk_'.".to_string(),
            )
        })?;
    let public_rest = public_key.strip_prefix("pk_").ok_or_else(|| {
        PaymentGatewayError::KeyFormat("Publishable key must start with 'pk_'.".to_string())
    })?;

    if let (Some(a), Some(b)) = (key_mode(secret_rest), key_mode(public_rest)) {
        if a != b {
            return Err(PaymentGatewayError::KeyFormat(
                "Secret and publishable keys must both be test keys or both be live keys."
                    .to_string(),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PaymentGatewayValidator {
    client: reqwest::Client,
    api_base: String,
}

impl PaymentGatewayValidator {
    pub fn new(api_base: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Validate a key pair with a single read-only API call.
    pub async fn validate(
        &self,
        secret_key: &str,
        public_key: &str,
    ) -> Result<(), PaymentGatewayError> {
        let started = Instant::now();
        info!(
            "[PHASE: payment] [STEP: validate] validate entered (api_base={}, public_key={})",
            self.api_base,
            mask_sensitive(public_key)
        );

        check_key_format(secret_key, public_key)?;

        let url = format!("{}/v1/balance", self.api_base);
        let resp = self
            .client
            .get(&url)
            .basic_auth(secret_key.trim(), None::<&str>)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    "[PHASE: payment] [STEP: validate] Transport failure (duration_ms={}): {}",
                    started.elapsed().as_millis(),
                    e
                );
                PaymentGatewayError::Transport(e.without_url().to_string())
            })?;

        let status = resp.status();
        info!(
            "[PHASE: payment] [STEP: validate] Gateway answered (status={}, duration_ms={})",
            status.as_u16(),
            started.elapsed().as_millis()
        );
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(PaymentGatewayError::InvalidKey),
            other => Err(PaymentGatewayError::UnexpectedStatus(other.as_u16())),
        }
    }
}
