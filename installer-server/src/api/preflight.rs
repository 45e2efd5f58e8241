// Environment prober
//
// Read-only capability checks run by the wizard before installation is offered:
// runtime version, database reachability, filesystem write access. Every check
// captures its own failure; `probe` always returns a complete result.

use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::installation::parsers::parse_runtime_version;
use crate::installation::{CommandRunner, CommandSpec};
use crate::models::responses::PreflightCheckDto;
use crate::settings::Settings;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_BYTES: &[u8] = b"installer write probe\n";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheckResult {
    #[serde(rename = "nodejsOk")]
    pub runtime_version_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    pub database_reachable: bool,
    pub filesystem_writable: bool,
    pub checks: Vec<PreflightCheckDto>,
}

impl SystemCheckResult {
    pub fn all_ok(&self) -> bool {
        self.runtime_version_ok && self.database_reachable && self.filesystem_writable
    }
}

struct CheckOutcome {
    ok: bool,
    check: PreflightCheckDto,
}

impl CheckOutcome {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            check: PreflightCheckDto::pass(name, detail),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            check: PreflightCheckDto::fail(name, detail),
        }
    }
}

pub struct EnvironmentProber {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
}

impl EnvironmentProber {
    pub fn new(settings: Arc<Settings>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    /// Run all checks concurrently. Never fails.
    pub async fn probe(&self) -> SystemCheckResult {
        let started = Instant::now();
        info!("[PHASE: preflight] [STEP: system_check] probe entered");

        let ((runtime, version), database, filesystem) = tokio::join!(
            self.check_runtime(),
            self.check_database(),
            self.check_filesystem()
        );

        let result = SystemCheckResult {
            runtime_version_ok: runtime.ok,
            runtime_version: version,
            database_reachable: database.ok,
            filesystem_writable: filesystem.ok,
            checks: vec![runtime.check, database.check, filesystem.check],
        };

        info!(
            "[PHASE: preflight] [STEP: system_check] probe exit (all_ok={}, runtime_ok={}, database_reachable={}, filesystem_writable={}, duration_ms={})",
            result.all_ok(),
            result.runtime_version_ok,
            result.database_reachable,
            result.filesystem_writable,
            started.elapsed().as_millis()
        );
        result
    }

    async fn check_runtime(&self) -> (CheckOutcome, Option<String>) {
        const NAME: &str = "Runtime Version";
        let program = self.settings.runtime.program.as_str();
        let min_major = self.settings.runtime.min_major;

        let resolved = match which::which(program) {
            Ok(p) => p,
            Err(_) => {
                return (
                    CheckOutcome::fail(NAME, format!("'{}' was not found on PATH", program)),
                    None,
                )
            }
        };

        let spec = CommandSpec {
            program: resolved.to_string_lossy().to_string(),
            args: vec!["--version".to_string()],
            cwd: None,
            env: Vec::new(),
            timeout: VERSION_TIMEOUT,
            operation: "runtime_version".to_string(),
        };
        let out = match self.runner.run(&spec).await {
            Ok(out) if out.success() => out,
            Ok(out) => {
                warn!(
                    "[PHASE: preflight] [STEP: runtime] version command failed: {}",
                    out.error_detail()
                );
                return (CheckOutcome::fail(NAME, "check failed"), None);
            }
            Err(e) => {
                warn!(
                    "[PHASE: preflight] [STEP: runtime] version command error: {:#}",
                    e
                );
                return (CheckOutcome::fail(NAME, "check failed"), None);
            }
        };

        match parse_runtime_version(&out.stdout) {
            Some(v) if v.major >= min_major => (
                CheckOutcome::pass(NAME, format!("{} {} (requires {}+)", program, v, min_major)),
                Some(v.to_string()),
            ),
            Some(v) => (
                CheckOutcome::fail(
                    NAME,
                    format!("{} {} is too old (requires {}+)", program, v, min_major),
                ),
                Some(v.to_string()),
            ),
            None => (
                CheckOutcome::fail(NAME, "Unrecognized version output"),
                None,
            ),
        }
    }

    async fn check_database(&self) -> CheckOutcome {
        const NAME: &str = "Database Reachable";
        let host = self.settings.database.probe_host.clone();
        let port = self.settings.database.probe_port;
        let budget = self.settings.db_connect_timeout();

        match timeout(budget, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_stream)) => CheckOutcome::pass(NAME, format!("{}:{} accepts connections", host, port)),
            Ok(Err(e)) => {
                warn!(
                    "[PHASE: preflight] [STEP: database] {}:{} unreachable: {}",
                    host, port, e
                );
                CheckOutcome::fail(NAME, "connection error")
            }
            Err(_) => CheckOutcome::fail(NAME, "connection timed out"),
        }
    }

    async fn check_filesystem(&self) -> CheckOutcome {
        const NAME: &str = "Filesystem Writable";
        let dir = self.settings.app_root.clone();
        let res = tokio::task::spawn_blocking(move || write_probe(dir)).await;
        match res {
            Ok(Ok(())) => CheckOutcome::pass(NAME, "Application directory is writable"),
            Ok(Err(e)) => {
                warn!("[PHASE: preflight] [STEP: filesystem] write probe failed: {}", e);
                CheckOutcome::fail(NAME, format!("not writable: {}", e))
            }
            Err(e) => {
                warn!("[PHASE: preflight] [STEP: filesystem] write probe task failed: {}", e);
                CheckOutcome::fail(NAME, "check failed")
            }
        }
    }
}

/// Create, write and delete one temp file. The file is removed on every path
/// (NamedTempFile deletes on drop).
fn write_probe(dir: PathBuf) -> std::io::Result<()> {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(PROBE_BYTES)?;
    tmp.as_file().sync_all()?;
    tmp.close()
}
