// Installation orchestrator service
// Library entry point: logging, state wiring and the HTTP server loop

pub mod api;
pub mod database;
pub mod installation;
pub mod models;
pub mod payment;
pub mod security;
pub mod settings;
pub mod utils;

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::api::installer::Orchestrator;
use crate::api::preflight::EnvironmentProber;
use crate::database::connection::{DbConnector, MySqlConnector};
use crate::installation::{CommandRunner, SystemCommandRunner};
use crate::models::state::{AppState, ProgressLog};
use crate::payment::PaymentGatewayValidator;
use crate::settings::Settings;

/// Initialize logging with dual format (JSON `.log` + human-readable `.txt`),
/// optionally mirrored to stdout. Returns the log directory.
pub fn init_logging(settings: &Settings, with_stdout: bool) -> Result<PathBuf> {
    let log_dir = utils::path_resolver::resolve_log_folder(
        settings.installer_log_dir.as_deref(),
        &settings.app_root,
    )?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("installer-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("installer-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .level_for("sqlx", log::LevelFilter::Warn)
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let line = human_line(&message.to_string(), record);
                    out.finish(format_args!("{}", line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = message.to_string();
                    let (phase, step, cleaned) = utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", json_line));
                })
                .chain(
                    fern::log_file(&json_log_file)
                        .with_context(|| format!("Failed to open {:?}", json_log_file))?,
                ),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let line = human_line(&message.to_string(), record);
                    out.finish(format_args!("{}", line));
                })
                .chain(
                    fern::log_file(&txt_log_file)
                        .with_context(|| format!("Failed to open {:?}", txt_log_file))?,
                ),
        );

    dispatch.apply().context("Logger already initialized")?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir)
}

fn human_line(message: &str, record: &log::Record) -> String {
    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let (phase, step, cleaned) = utils::logging::parse_log_metadata(message);
    utils::logging::format_human_readable_log(
        &timestamp_local.to_string(),
        record.level(),
        record.target(),
        &cleaned,
        phase.as_deref(),
        step.as_deref(),
    )
}

/// Wire the production collaborators (system command runner, MySQL connector,
/// payment gateway client) into handler state.
pub fn build_state(settings: Settings) -> Result<AppState> {
    let settings = Arc::new(settings);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
    let connector: Arc<dyn DbConnector> =
        Arc::new(MySqlConnector::new(settings.db_connect_timeout()));
    let progress = Arc::new(ProgressLog::new());

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&settings),
        Arc::clone(&runner),
        Arc::clone(&connector),
        progress.emitter(),
    ));
    let prober = Arc::new(EnvironmentProber::new(Arc::clone(&settings), runner));
    let payment = PaymentGatewayValidator::new(
        &settings.payment.api_base,
        Duration::from_secs(settings.payment.timeout_secs.max(1)),
    )?;

    Ok(AppState {
        settings,
        orchestrator,
        prober,
        connector,
        payment,
        progress,
    })
}

/// Bind and serve until ctrl-c.
pub async fn run_server(settings: Settings) -> Result<()> {
    let bind_addr = settings.bind_addr.clone();
    let app_root = settings.app_root.clone();
    warn_if_app_root_missing(&app_root);

    let state = build_state(settings)?;
    let installed = state.orchestrator.state_store().exists().await;
    let app = api::routes::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(
        "[PHASE: initialization] [STEP: serve] Listening on {} (app_root={:?}, installed={})",
        bind_addr, app_root, installed
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("[PHASE: shutdown] Server stopped");
    Ok(())
}

fn warn_if_app_root_missing(app_root: &Path) {
    if !app_root.is_dir() {
        warn!(
            "[PHASE: initialization] app_root {:?} is not a directory; installs will fail until it exists",
            app_root
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[PHASE: shutdown] Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("[PHASE: shutdown] Shutdown signal received");
}
