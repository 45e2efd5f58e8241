// Installation logic
//
// This module contains the side-effecting building blocks the orchestrator drives:
// external commands (argument arrays, never shell strings), staged file writes,
// the environment-file renderer, the process-manager descriptor and the install
// state store.
//
// IMPORTANT:
// - Never log secrets (database passwords, payment keys, signing secrets).
// - Commands are never retried here; a retry is a new orchestration run.

pub mod env_file;
pub mod files;
pub mod parsers;
pub mod service;
pub mod state_store;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Max characters of captured output surfaced as a step's error detail.
const ERROR_DETAIL_MAX_CHARS: usize = 4000;

/// One external command: program + argument array, no shell involved.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Short label used in logs (`npm_install`, `migrate`, ...).
    pub operation: String,
}

impl CommandSpec {
    /// Build a spec from a configured argument array (`["npm", "run", "build"]`).
    pub fn from_argv(argv: &[String], operation: &str, timeout: Duration) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("No program configured for {}", operation))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: None,
            env: Vec::new(),
            timeout,
            operation: operation.to_string(),
        })
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Captured output suitable for an error message: stderr, else stdout, tail-truncated.
    pub fn error_detail(&self) -> String {
        let primary = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let chars: Vec<char> = primary.chars().collect();
        let text: String = if chars.len() > ERROR_DETAIL_MAX_CHARS {
            let tail: String = chars[chars.len() - ERROR_DETAIL_MAX_CHARS..].iter().collect();
            format!("...{}", tail)
        } else {
            primary.to_string()
        };
        match (self.exit_code, text.is_empty()) {
            (Some(code), true) => format!("exit code {}", code),
            (Some(code), false) => format!("exit code {}: {}", code, text),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {}", text),
        }
    }
}

/// Seam for running external commands; tests substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion (or timeout).
    ///
    /// Returns captured output even for a non-zero exit code (caller decides success);
    /// `Err` means the command could not be spawned or timed out.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        run_cmd_with_timeout(spec).await
    }
}

fn mask_arg_for_log(arg: &str) -> String {
    // Heuristic masking: treat anything that looks like a secret as sensitive.
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password")
        || lower.contains("secret")
        || lower.contains("token")
        || lower.starts_with("sk_")
        || lower.starts_with("rk_")
    {
        return "***".to_string();
    }

    if arg.contains("://") && arg.contains('@') {
        return crate::utils::logging::mask_database_url(arg);
    }

    if arg.chars().count() > 32 {
        return crate::utils::logging::mask_sensitive(arg);
    }
    arg.to_string()
}

/// Run an external command with a timeout, capturing stdout/stderr.
///
/// The budget covers both the child's exit and draining its output pipes. The
/// child leads its own process group (Unix), so on timeout any background
/// processes it left holding the pipes are killed with it.
pub async fn run_cmd_with_timeout(spec: &CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();
    let operation = spec.operation.as_str();
    let program = spec.program.as_str();

    info!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args=[{}], cwd={:?}, env_keys=[{}], timeout_ms={})",
        operation,
        program,
        spec.args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        spec.cwd,
        spec.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(", "),
        spec.timeout.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program, operation
        )
    })?;
    // `id()` is gone once the child has been reaped; keep it for the group kill.
    let pgid = child.id();

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let mut stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let mut stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(spec.timeout, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    operation, program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); killing process",
                operation,
                program,
                spec.timeout.as_millis()
            );

            kill_process_group(pgid);
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            error!(
                "[PHASE: installation] [STEP: cmd] Command timed out (operation={}, program={}, duration_ms={})",
                operation,
                program,
                started.elapsed().as_millis()
            );
            return Err(anyhow::anyhow!(
                "Command '{}' timed out after {}s",
                program,
                spec.timeout.as_secs()
            ));
        }
    };

    let remaining = spec.timeout.saturating_sub(started.elapsed());
    let drained = timeout(remaining, async {
        tokio::join!(&mut stdout_task, &mut stderr_task)
    })
    .await;
    let (stdout_res, stderr_res) = match drained {
        Ok(pair) => pair,
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] Output still open after exit (operation={}, program={}, exit_code={:?}); killing process group",
                operation,
                program,
                status.code()
            );
            kill_process_group(pgid);
            stdout_task.abort();
            stderr_task.abort();
            return Err(anyhow::anyhow!(
                "Command '{}' timed out after {}s (background processes kept its output open)",
                program,
                spec.timeout.as_secs()
            ));
        }
    };
    let stdout_str = stdout_res
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_res
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// SIGKILL the process group led by `pgid`.
#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    let Some(pid) = pgid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals that group.
    if unsafe { libc::kill(-pid, libc::SIGKILL) } != 0 {
        debug!(
            "[PHASE: installation] [STEP: cmd] kill(-{}) failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}
