// API response models
//
// Flat JSON bodies consumed by the setup wizard. Field names are camelCase.

use serde::{Deserialize, Serialize};

use crate::api::installer::{InstallationOutcome, ProgressPayload, StepErrorKind};
use crate::api::preflight::SystemCheckResult;

/// One row of the system-check matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheckDto {
    pub name: String,
    /// "Pass" | "Warn" | "Fail"
    pub status: String,
    pub detail: String,
}

impl PreflightCheckDto {
    pub fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: "Pass".to_string(),
            detail: detail.into(),
        }
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: "Fail".to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheckResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: SystemCheckResult,
}

/// `{ success, error? , invalidKey? }` used by the credential test endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_key: Option<bool>,
}

impl ActionResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            invalid_key: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            invalid_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<InstallationOutcome>,
}

impl From<InstallationOutcome> for InstallResponse {
    fn from(outcome: InstallationOutcome) -> Self {
        Self {
            success: outcome.is_success(),
            error: outcome.error_message.clone(),
            error_kind: outcome.error_kind,
            outcome: Some(outcome),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressLogResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub lines: Vec<String>,
    pub entries: Vec<ProgressPayload>,
}
