// HTTP surface for the setup wizard
//
//   GET  /status          -> { installed }
//   POST /system-check    -> capability matrix
//   POST /test-database   -> live connection test, nothing persisted
//   POST /test-payment    -> single read-only gateway call
//   POST /install         -> full orchestration run (caller waits)
//   GET  /install/log     -> progress lines of the current/last run

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::api::installer::{InstallationOutcome, StepErrorKind};
use crate::database::connection::validate_database;
use crate::models::requests::{DatabaseCredentials, InstallPayload, PaymentKeysRequest};
use crate::models::responses::{
    ActionResponse, InstallResponse, ProgressLogResponse, StatusResponse, SystemCheckResponse,
};
use crate::models::state::AppState;
use crate::payment::PaymentGatewayError;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status))
        .route("/system-check", post(system_check))
        .route("/test-database", post(test_database))
        .route("/test-payment", post(test_payment))
        .route("/install", post(install))
        .route("/install/log", get(install_log))
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
        .with_state(state)
}

async fn log_requests(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let resp = next.run(req).await;
    info!(
        "[PHASE: http] [STEP: request] {} {} -> {} (duration_ms={})",
        method,
        path,
        resp.status().as_u16(),
        started.elapsed().as_millis()
    );
    resp
}

fn bad_json(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ActionResponse::fail(format!(
            "Invalid request body: {}",
            rejection.body_text()
        ))),
    )
        .into_response()
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let store = state.orchestrator.state_store();
    let installed = store.exists().await;
    let completed_at = if installed {
        store.read().await.and_then(|m| m.completed_at)
    } else {
        None
    };
    Json(StatusResponse {
        installed,
        completed_at,
    })
}

async fn system_check(State(state): State<AppState>) -> Response {
    let prober = Arc::clone(&state.prober);
    match tokio::spawn(async move { prober.probe().await }).await {
        Ok(result) => Json(SystemCheckResponse {
            success: true,
            result,
        })
        .into_response(),
        Err(e) => {
            error!("[PHASE: preflight] [STEP: system_check] probe task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ActionResponse::fail("System check failed. Please check logs.")),
            )
                .into_response()
        }
    }
}

async fn test_database(
    State(state): State<AppState>,
    body: Result<Json<DatabaseCredentials>, JsonRejection>,
) -> Response {
    let creds = match body {
        Ok(Json(c)) => c,
        Err(rejection) => return bad_json(rejection),
    };
    if let Err(e) = creds.validate_for_connection() {
        return (StatusCode::BAD_REQUEST, Json(ActionResponse::fail(e.to_string()))).into_response();
    }

    match validate_database(state.connector.as_ref(), &creds).await {
        Ok(()) => Json(ActionResponse::ok()).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ActionResponse::fail(e.to_string()))).into_response(),
    }
}

async fn test_payment(
    State(state): State<AppState>,
    body: Result<Json<PaymentKeysRequest>, JsonRejection>,
) -> Response {
    let keys = match body {
        Ok(Json(k)) => k,
        Err(rejection) => return bad_json(rejection),
    };

    match state.payment.validate(&keys.secret_key, &keys.public_key).await {
        Ok(()) => Json(ActionResponse::ok()).into_response(),
        Err(e) => {
            let code = match e {
                PaymentGatewayError::InvalidKey | PaymentGatewayError::KeyFormat(_) => {
                    StatusCode::BAD_REQUEST
                }
                PaymentGatewayError::UnexpectedStatus(_) | PaymentGatewayError::Transport(_) => {
                    StatusCode::BAD_GATEWAY
                }
            };
            let mut body = ActionResponse::fail(e.to_string());
            body.invalid_key = Some(e.is_invalid_key());
            (code, Json(body)).into_response()
        }
    }
}

fn install_status_code(outcome: &InstallationOutcome) -> StatusCode {
    match outcome.error_kind {
        None => StatusCode::OK,
        Some(StepErrorKind::AlreadyInstalled) | Some(StepErrorKind::Validation) => {
            StatusCode::BAD_REQUEST
        }
        Some(StepErrorKind::InProgress) => StatusCode::CONFLICT,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn install(
    State(state): State<AppState>,
    body: Result<Json<InstallPayload>, JsonRejection>,
) -> Response {
    let payload = match body {
        Ok(Json(p)) => p,
        Err(rejection) => return bad_json(rejection),
    };

    // Detached so a client disconnect does not cancel running commands.
    let orchestrator = Arc::clone(&state.orchestrator);
    let joined = tokio::spawn(async move { orchestrator.run(payload).await }).await;

    match joined {
        Ok(outcome) => {
            let code = install_status_code(&outcome);
            (code, Json(InstallResponse::from(outcome))).into_response()
        }
        Err(e) => {
            error!("[PHASE: installation] [STEP: error] orchestration task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(InstallResponse {
                    success: false,
                    error: Some("Installation failed unexpectedly. Please check logs.".to_string()),
                    error_kind: Some(StepErrorKind::Internal),
                    outcome: None,
                }),
            )
                .into_response()
        }
    }
}

async fn install_log(State(state): State<AppState>) -> Json<ProgressLogResponse> {
    Json(ProgressLogResponse {
        correlation_id: state.progress.correlation_id(),
        lines: state.progress.lines(),
        entries: state.progress.entries(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::installer::Orchestrator;
    use crate::api::preflight::EnvironmentProber;
    use crate::database::connection::stubs::StubConnector;
    use crate::installation::{CommandOutput, CommandRunner, CommandSpec};
    use crate::models::state::ProgressLog;
    use crate::payment::PaymentGatewayValidator;
    use crate::settings::Settings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct OkRunner;

    #[async_trait]
    impl CommandRunner for OkRunner {
        async fn run(&self, _spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: "v20.11.1\n".to_string(),
                stderr: String::new(),
                duration_ms: 1,
            })
        }
    }

    fn app(root: &std::path::Path, connector: StubConnector) -> Router {
        let mut settings = Settings {
            app_root: root.to_path_buf(),
            ..Settings::default()
        };
        settings.log_dir.path = Some(root.join("logs"));
        settings.database.probe_port = 1;
        settings.database.connect_timeout_secs = 1;
        let settings = Arc::new(settings);

        let runner: Arc<dyn CommandRunner> = Arc::new(OkRunner);
        let connector = Arc::new(connector);
        let progress = Arc::new(ProgressLog::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&settings),
            Arc::clone(&runner),
            connector.clone(),
            progress.emitter(),
        ));
        let state = AppState {
            settings: Arc::clone(&settings),
            orchestrator,
            prober: Arc::new(EnvironmentProber::new(Arc::clone(&settings), runner)),
            connector,
            payment: PaymentGatewayValidator::new("http://127.0.0.1:9", Duration::from_secs(1))
                .expect("client"),
            progress,
        };
        router(state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        let code = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (code, value)
    }

    fn install_body() -> Value {
        json!({
            "database": {
                "host": "localhost",
                "port": 3306,
                "name": "app_db",
                "username": "root",
                "password": ""
            },
            "config": {
                "appUrl": "https://example.org",
                "environment": "production",
                "jwtSecret": "abc123",
                "paymentSecretKey": "sk_test",
                "paymentPublicKey": "pk_test"
            }
        })
    }

    #[tokio::test]
    async fn install_then_status_then_second_install() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(dir.path(), StubConnector::ok());

        let (code, v) = call(&app, "GET", "/status", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(v["installed"], false);

        let (code, v) = call(&app, "POST", "/install", Some(install_body())).await;
        assert_eq!(code, StatusCode::OK, "{}", v);
        assert_eq!(v["success"], true);
        assert_eq!(v["outcome"]["overallStatus"], "success");
        assert_eq!(v["outcome"]["steps"].as_array().map(Vec::len), Some(7));

        let (code, v) = call(&app, "GET", "/status", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(v["installed"], true);
        assert!(v["completedAt"].is_string());

        let (code, v) = call(&app, "POST", "/install", Some(install_body())).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "already installed");
        assert_eq!(v["errorKind"], "alreadyInstalled");
    }

    #[tokio::test]
    async fn install_step_failure_is_500_with_first_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(dir.path(), StubConnector::unreachable("Connection refused"));

        let (code, v) = call(&app, "POST", "/install", Some(install_body())).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(v["success"], false);
        assert_eq!(v["errorKind"], "databaseSetup");
        assert!(v["error"].as_str().unwrap_or_default().contains("Database setup failed"));

        let (_, log) = call(&app, "GET", "/install/log", None).await;
        let lines = log["lines"].as_array().expect("lines");
        assert!(lines.iter().any(|l| l.as_str().unwrap_or_default().contains("provision_database")));
        assert_eq!(log["correlationId"], v["outcome"]["correlationId"]);
    }

    #[tokio::test]
    async fn install_validation_error_is_400() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(dir.path(), StubConnector::ok());
        let mut body = install_body();
        body["config"]["paymentSecretKey"] = json!("");

        let (code, v) = call(&app, "POST", "/install", Some(body)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(v["errorKind"], "validation");
    }

    #[tokio::test]
    async fn malformed_json_is_400_with_error_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(dir.path(), StubConnector::ok());
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/install")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_database_maps_success_and_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = json!({
            "host": "localhost",
            "port": 3306,
            "database": "app_db",
            "username": "root",
            "password": "secret"
        });

        let ok = app(dir.path(), StubConnector::ok());
        let (code, v) = call(&ok, "POST", "/test-database", Some(body.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(v, json!({ "success": true }));

        let bad = app(dir.path(), StubConnector::unreachable("Access denied for user 'root'"));
        let (code, v) = call(&bad, "POST", "/test-database", Some(body)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "Access denied for user 'root'");

        let (code, v) = call(&ok, "POST", "/test-database", Some(json!({ "host": "" }))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(v["success"], false);
    }

    #[tokio::test]
    async fn test_payment_rejects_malformed_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(dir.path(), StubConnector::ok());
        let (code, v) = call(
            &app,
            "POST",
            "/test-payment",
            Some(json!({ "secretKey": "pk_test_x", "publicKey": "pk_test_y" })),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(v["invalidKey"], false);
    }

    #[tokio::test]
    async fn system_check_always_answers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(dir.path(), StubConnector::ok());
        let (code, v) = call(&app, "POST", "/system-check", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(v["success"], true);
        assert_eq!(v["databaseReachable"], false);
        assert_eq!(v["filesystemWritable"], true);
        assert!(v["nodejsOk"].is_boolean());
        assert_eq!(v["checks"].as_array().map(Vec::len), Some(3));
    }
}
