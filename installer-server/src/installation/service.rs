// Process supervisor helpers
//
// - Descriptor rendering (pure function, testable on all platforms)
// - Log directory provisioning (best-effort; callers treat failure as a warning)

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use tokio::time::Duration;

use crate::installation::{CommandRunner, CommandSpec};
use crate::settings::ProcessSettings;

const CHOWN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Process-manager descriptor (PM2 ecosystem file)
// ============================================================================

#[derive(Debug, Serialize)]
struct EcosystemFile {
    apps: Vec<EcosystemApp>,
}

#[derive(Debug, Serialize)]
struct EcosystemApp {
    name: String,
    script: String,
    cwd: String,
    instances: u32,
    exec_mode: &'static str,
    autorestart: bool,
    max_restarts: u32,
    restart_delay: u64,
    error_file: String,
    out_file: String,
    merge_logs: bool,
    env: EcosystemEnv,
}

#[derive(Debug, Serialize)]
struct EcosystemEnv {
    #[serde(rename = "NODE_ENV")]
    node_env: String,
}

/// Render the process supervisor descriptor.
///
/// Pure: the same inputs always give the same text. Contains no secrets; the
/// application reads those from its environment file.
pub fn build_process_descriptor(
    process: &ProcessSettings,
    app_root: &Path,
    log_dir: &Path,
    environment: &str,
) -> Result<String> {
    let file = EcosystemFile {
        apps: vec![EcosystemApp {
            name: process.name.clone(),
            script: process.script.clone(),
            cwd: app_root.to_string_lossy().to_string(),
            instances: process.instances,
            exec_mode: if process.instances > 1 { "cluster" } else { "fork" },
            autorestart: true,
            max_restarts: process.max_restarts,
            restart_delay: process.restart_delay_ms,
            error_file: log_dir.join("error.log").to_string_lossy().to_string(),
            out_file: log_dir.join("out.log").to_string_lossy().to_string(),
            merge_logs: true,
            env: EcosystemEnv {
                node_env: environment.to_string(),
            },
        }],
    };
    let mut text =
        serde_json::to_string_pretty(&file).context("Failed to serialize process descriptor")?;
    text.push('\n');
    Ok(text)
}

// ============================================================================
// Log directory
// ============================================================================

#[cfg(unix)]
fn is_running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_running_as_root() -> bool {
    false
}

/// Wrap a privileged command in `sudo -n` unless already root.
fn privileged(program: &str, args: &[String], operation: &str) -> CommandSpec {
    let (program, mut argv) = if is_running_as_root() {
        (program.to_string(), Vec::new())
    } else {
        ("sudo".to_string(), vec!["-n".to_string(), program.to_string()])
    };
    argv.extend(args.iter().cloned());
    CommandSpec {
        program,
        args: argv,
        cwd: None,
        env: Vec::new(),
        timeout: CHOWN_TIMEOUT,
        operation: operation.to_string(),
    }
}

async fn run_privileged(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<()> {
    let out = runner.run(spec).await?;
    if !out.success() {
        anyhow::bail!("{} failed ({})", spec.operation, out.error_detail());
    }
    Ok(())
}

/// Create the application log directory and hand it to `owner`.
///
/// Falls back to `sudo -n mkdir -p` when the plain create is denied. Returns a
/// short description of what was done.
pub async fn provision_log_directory(
    runner: &dyn CommandRunner,
    dir: &Path,
    owner: Option<&str>,
) -> Result<String> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: log_dir] provision_log_directory entered (dir={:?}, owner={:?})",
        dir, owner
    );

    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && !is_running_as_root() => {
            warn!(
                "[PHASE: installation] [STEP: log_dir] create_dir_all denied for {:?}; retrying with sudo -n",
                dir
            );
            let spec = privileged(
                "mkdir",
                &["-p".to_string(), "--".to_string(), path_arg(dir)],
                "mkdir_log_dir",
            );
            run_privileged(runner, &spec)
                .await
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
        }
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to create log directory {:?}", dir));
        }
    }

    let detail = match owner.map(str::trim).filter(|o| !o.is_empty()) {
        Some(owner) => {
            let spec = privileged(
                "chown",
                &[
                    "-R".to_string(),
                    owner.to_string(),
                    "--".to_string(),
                    path_arg(dir),
                ],
                "chown_log_dir",
            );
            run_privileged(runner, &spec)
                .await
                .with_context(|| format!("Failed to set owner of {:?} to {}", dir, owner))?;
            format!("Log directory {} ready (owner {})", dir.display(), owner)
        }
        None => format!("Log directory {} ready", dir.display()),
    };

    info!(
        "[PHASE: installation] [STEP: log_dir] provision_log_directory exit ok (dir={:?}, duration_ms={})",
        dir,
        started.elapsed().as_millis()
    );
    Ok(detail)
}

fn path_arg(dir: &Path) -> String {
    dir.to_string_lossy().to_string()
}
