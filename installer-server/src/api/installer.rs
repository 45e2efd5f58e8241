// Installation orchestrator
//
// Runs the fixed provisioning sequence for one request:
//   1. install dependencies      5. process-manager descriptor
//   2. build application         6. log directory (tolerated failure)
//   3. environment file          7. install marker
//   4. database + migrations
//
// - The marker is checked before anything else and re-checked under the run lock
// - Validation happens before any side effect
// - The first failing mandatory step ends the run; nothing is retried
// - Files written by steps 3 and 5 are journaled and restored on failure
//   (`rollback_on_failure`)

use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::database::connection::DbConnector;
use crate::installation::env_file;
use crate::installation::files::{ArtifactJournal, PUBLIC_FILE_MODE, SECRET_FILE_MODE};
use crate::installation::service::{build_process_descriptor, provision_log_directory};
use crate::installation::state_store::InstallStateStore;
use crate::installation::{CommandRunner, CommandSpec};
use crate::models::requests::{InstallPayload, InstallationRequest};
use crate::security::crypto::secret_fingerprint;
use crate::settings::Settings;
use crate::utils::logging::describe_db_target;

pub type ProgressEmitter = Arc<dyn Fn(ProgressPayload) + Send + Sync>;

/// Error message of the entry guard.
pub const ALREADY_INSTALLED: &str = "already installed";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub correlation_id: String,
    pub step: String,
    pub severity: String, // "info" | "warn" | "error"
    pub phase: String,
    pub percent: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u128>,
}

impl ProgressPayload {
    pub fn to_line(&self) -> String {
        format!(
            "[+{}ms] [{}] [{}] {:>3}% {}",
            self.elapsed_ms.unwrap_or(0),
            self.severity.to_ascii_uppercase(),
            self.step,
            self.percent,
            self.message
        )
    }
}

// =============================================================================
// Step / outcome model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    InstallDependencies,
    BuildApplication,
    MaterializeConfiguration,
    ProvisionDatabase,
    GenerateProcessConfig,
    ProvisionLogDirectory,
    CommitMarker,
}

impl StepName {
    pub const ALL: [StepName; 7] = [
        StepName::InstallDependencies,
        StepName::BuildApplication,
        StepName::MaterializeConfiguration,
        StepName::ProvisionDatabase,
        StepName::GenerateProcessConfig,
        StepName::ProvisionLogDirectory,
        StepName::CommitMarker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::InstallDependencies => "install_dependencies",
            StepName::BuildApplication => "build_application",
            StepName::MaterializeConfiguration => "materialize_configuration",
            StepName::ProvisionDatabase => "provision_database",
            StepName::GenerateProcessConfig => "generate_process_config",
            StepName::ProvisionLogDirectory => "provision_log_directory",
            StepName::CommitMarker => "commit_marker",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StepName::InstallDependencies => "Installing dependencies",
            StepName::BuildApplication => "Building application",
            StepName::MaterializeConfiguration => "Writing environment file",
            StepName::ProvisionDatabase => "Setting up database",
            StepName::GenerateProcessConfig => "Writing process manager configuration",
            StepName::ProvisionLogDirectory => "Preparing log directory",
            StepName::CommitMarker => "Recording installation",
        }
    }

    /// 1-based position in the sequence.
    pub fn ordinal(self) -> u8 {
        match self {
            StepName::InstallDependencies => 1,
            StepName::BuildApplication => 2,
            StepName::MaterializeConfiguration => 3,
            StepName::ProvisionDatabase => 4,
            StepName::GenerateProcessConfig => 5,
            StepName::ProvisionLogDirectory => 6,
            StepName::CommitMarker => 7,
        }
    }

    /// Only the log directory may fail without failing the run.
    pub fn is_mandatory(self) -> bool {
        self != StepName::ProvisionLogDirectory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// What went wrong, for callers that branch on the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
pub enum StepErrorKind {
    #[error("validation error")]
    Validation,
    #[error("already installed")]
    AlreadyInstalled,
    #[error("installation in progress")]
    InProgress,
    #[error("command failed")]
    Command,
    #[error("filesystem error")]
    Filesystem,
    #[error("database setup failed")]
    DatabaseSetup,
    #[error("connectivity error")]
    Connectivity,
    #[error("internal error")]
    Internal,
}

/// A failed step: kind plus the caller-facing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepFailure {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStep {
    pub name: StepName,
    pub ordinal: u8,
    pub label: &'static str,
    pub mandatory: bool,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u128>,
}

impl InstallationStep {
    fn pending(name: StepName) -> Self {
        Self {
            name,
            ordinal: name.ordinal(),
            label: name.label(),
            mandatory: name.is_mandatory(),
            status: StepStatus::Pending,
            detail_message: None,
            error_kind: None,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationOutcome {
    pub correlation_id: String,
    pub overall_status: OverallStatus,
    pub steps: Vec<InstallationStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Paths restored or removed after a failure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rolled_back: Vec<String>,
    pub jwt_secret_generated: bool,
    pub duration_ms: u128,
}

impl InstallationOutcome {
    pub fn is_success(&self) -> bool {
        self.overall_status == OverallStatus::Success
    }

    pub fn step(&self, name: StepName) -> Option<&InstallationStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

// =============================================================================
// Run bookkeeping
// =============================================================================

struct RunTracker {
    correlation_id: String,
    started: Instant,
    step_started: Option<Instant>,
    steps: Vec<InstallationStep>,
    warnings: Vec<String>,
    emit: ProgressEmitter,
}

impl RunTracker {
    fn new(emit: ProgressEmitter) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            step_started: None,
            steps: StepName::ALL.iter().copied().map(InstallationStep::pending).collect(),
            warnings: Vec::new(),
            emit,
        }
    }

    fn progress(&self, step: &str, severity: &str, percent: i32, message: String) {
        (self.emit)(ProgressPayload {
            correlation_id: self.correlation_id.clone(),
            step: step.to_string(),
            severity: severity.to_string(),
            phase: "install".to_string(),
            percent,
            message,
            elapsed_ms: Some(self.started.elapsed().as_millis()),
        });
    }

    fn step_mut(&mut self, name: StepName) -> &mut InstallationStep {
        let idx = usize::from(name.ordinal() - 1);
        &mut self.steps[idx]
    }

    fn begin(&mut self, name: StepName) {
        self.step_started = Some(Instant::now());
        self.step_mut(name).status = StepStatus::Running;
        info!(
            "[PHASE: installation] [STEP: {}] {} (step {}/7)",
            name.as_str(),
            name.label(),
            name.ordinal()
        );
        self.progress(
            name.as_str(),
            "info",
            percent_before(name),
            format!("{}...", name.label()),
        );
    }

    fn step_duration(&self) -> Option<u128> {
        self.step_started.map(|s| s.elapsed().as_millis())
    }

    fn succeed(&mut self, name: StepName, detail: String) {
        let duration = self.step_duration();
        let step = self.step_mut(name);
        step.status = StepStatus::Succeeded;
        step.detail_message = Some(detail.clone());
        step.duration_ms = duration;
        info!(
            "[PHASE: installation] [STEP: {}] ok (duration_ms={}): {}",
            name.as_str(),
            duration.unwrap_or(0),
            detail
        );
        self.progress(name.as_str(), "info", percent_after(name), detail);
    }

    fn fail(&mut self, name: StepName, failure: &StepFailure) {
        let duration = self.step_duration();
        let step = self.step_mut(name);
        step.status = StepStatus::Failed;
        step.detail_message = Some(failure.message.clone());
        step.error_kind = Some(failure.kind);
        step.duration_ms = duration;

        if name.is_mandatory() {
            error!(
                "[PHASE: installation] [STEP: {}] failed (kind={:?}): {}",
                name.as_str(),
                failure.kind,
                failure.message
            );
            self.progress(
                name.as_str(),
                "error",
                percent_before(name),
                failure.message.clone(),
            );
        } else {
            warn!(
                "[PHASE: installation] [STEP: {}] failed, continuing (kind={:?}): {}",
                name.as_str(),
                failure.kind,
                failure.message
            );
            self.warnings
                .push(format!("{}: {}", name.label(), failure.message));
            self.progress(
                name.as_str(),
                "warn",
                percent_after(name),
                format!("{} (continuing)", failure.message),
            );
        }
    }

    fn finish(
        self,
        failure: Option<StepFailure>,
        rolled_back: Vec<String>,
        jwt_secret_generated: bool,
    ) -> InstallationOutcome {
        let (overall_status, error_message, error_kind) = match failure {
            None => (OverallStatus::Success, None, None),
            Some(f) => (OverallStatus::Failure, Some(f.message), Some(f.kind)),
        };
        if overall_status == OverallStatus::Success {
            self.progress("complete", "info", 100, "Installation complete.".to_string());
        }
        InstallationOutcome {
            correlation_id: self.correlation_id,
            overall_status,
            steps: self.steps,
            error_message,
            error_kind,
            warnings: self.warnings,
            rolled_back,
            jwt_secret_generated,
            duration_ms: self.started.elapsed().as_millis(),
        }
    }

    /// Refuse before any step ran (no progress lines: another run may own the log).
    fn refuse(self, failure: StepFailure) -> InstallationOutcome {
        warn!(
            "[PHASE: installation] [STEP: guard] Installation refused (kind={:?}): {}",
            failure.kind, failure.message
        );
        InstallationOutcome {
            correlation_id: self.correlation_id,
            overall_status: OverallStatus::Failure,
            steps: self.steps,
            error_message: Some(failure.message),
            error_kind: Some(failure.kind),
            warnings: Vec::new(),
            rolled_back: Vec::new(),
            jwt_secret_generated: false,
            duration_ms: self.started.elapsed().as_millis(),
        }
    }
}

fn percent_before(name: StepName) -> i32 {
    (i32::from(name.ordinal()) - 1) * 100 / 7 + 1
}

fn percent_after(name: StepName) -> i32 {
    i32::from(name.ordinal()) * 100 / 7
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn DbConnector>,
    state: InstallStateStore,
    emit: ProgressEmitter,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn DbConnector>,
        emit: ProgressEmitter,
    ) -> Self {
        let state = InstallStateStore::new(settings.marker_path(), settings.lock_path());
        Self {
            settings,
            runner,
            connector,
            state,
            emit,
        }
    }

    pub fn state_store(&self) -> &InstallStateStore {
        &self.state
    }

    /// Execute one installation run. Always returns an outcome; never panics on
    /// step failure.
    pub async fn run(&self, payload: InstallPayload) -> InstallationOutcome {
        let tracker = RunTracker::new(Arc::clone(&self.emit));
        info!(
            "[PHASE: installation] [STEP: start] Installation requested (correlation_id={}, app_root={:?})",
            tracker.correlation_id, self.settings.app_root
        );

        if self.state.exists().await {
            return tracker.refuse(StepFailure::new(
                StepErrorKind::AlreadyInstalled,
                ALREADY_INSTALLED,
            ));
        }

        let request = match InstallationRequest::from_payload(payload) {
            Ok(r) => r,
            Err(e) => {
                return tracker.refuse(StepFailure::new(StepErrorKind::Validation, e.to_string()))
            }
        };

        let _lock = match self.state.try_lock() {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                return tracker.refuse(StepFailure::new(
                    StepErrorKind::InProgress,
                    "Installation is already running.",
                ))
            }
            Err(e) => {
                return tracker.refuse(StepFailure::new(
                    StepErrorKind::Filesystem,
                    format!("Could not acquire install lock: {:#}", e),
                ))
            }
        };

        // A concurrent run may have finished between the first check and the lock.
        if self.state.exists().await {
            return tracker.refuse(StepFailure::new(
                StepErrorKind::AlreadyInstalled,
                ALREADY_INSTALLED,
            ));
        }

        self.run_steps(tracker, &request).await
    }

    async fn run_steps(
        &self,
        mut tracker: RunTracker,
        request: &InstallationRequest,
    ) -> InstallationOutcome {
        tracker.progress("start", "info", 0, "Starting installation...".to_string());
        let mut journal = ArtifactJournal::new();

        for name in StepName::ALL {
            tracker.begin(name);
            match self.execute(name, request, &mut journal).await {
                Ok(detail) => tracker.succeed(name, detail),
                Err(failure) if !name.is_mandatory() => tracker.fail(name, &failure),
                Err(failure) => {
                    tracker.fail(name, &failure);
                    let rolled_back = if self.settings.rollback_on_failure {
                        self.rollback(&mut journal, &tracker).await
                    } else {
                        let kept = journal.paths();
                        if !kept.is_empty() {
                            warn!(
                                "[PHASE: installation] [STEP: rollback] rollback_on_failure=false; leaving {:?} in place",
                                kept
                            );
                        }
                        journal.commit();
                        Vec::new()
                    };
                    return tracker.finish(Some(failure), rolled_back, request.jwt_secret_generated());
                }
            }
        }

        journal.commit();
        info!(
            "[PHASE: installation] [STEP: complete] Installation complete (correlation_id={}, duration_ms={})",
            tracker.correlation_id,
            tracker.started.elapsed().as_millis()
        );
        tracker.finish(None, Vec::new(), request.jwt_secret_generated())
    }

    async fn rollback(&self, journal: &mut ArtifactJournal, tracker: &RunTracker) -> Vec<String> {
        let paths: Vec<String> = journal
            .paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        if paths.is_empty() {
            return paths;
        }
        tracker.progress(
            "rollback",
            "warn",
            0,
            format!("Restoring {} file(s) written by this run", paths.len()),
        );
        let failures = journal.rollback().await;
        for f in &failures {
            error!("[PHASE: installation] [STEP: rollback] {}", f);
        }
        paths
    }

    async fn execute(
        &self,
        name: StepName,
        request: &InstallationRequest,
        journal: &mut ArtifactJournal,
    ) -> Result<String, StepFailure> {
        match name {
            StepName::InstallDependencies => {
                self.run_configured(&self.settings.commands.install, name, Vec::new())
                    .await
                    .map_err(|e| StepFailure::new(e.kind, format!("Dependency installation failed: {}", e.message)))
            }
            StepName::BuildApplication => {
                self.run_configured(&self.settings.commands.build, name, Vec::new())
                    .await
                    .map_err(|e| StepFailure::new(e.kind, format!("Build failed: {}", e.message)))
            }
            StepName::MaterializeConfiguration => {
                let path = self.settings.env_file_path();
                let text = env_file::render(request, Some(Utc::now()))
                    .map_err(|e| StepFailure::new(StepErrorKind::Internal, e.to_string()))?;
                journal
                    .write(&path, text.as_bytes(), SECRET_FILE_MODE, "environment file")
                    .await
                    .map_err(|e| fs_failure("Could not write environment file", &e))?;
                info!(
                    "[PHASE: installation] [STEP: materialize_configuration] Environment file written (path={:?}, jwt_secret={}, generated={})",
                    path,
                    secret_fingerprint(&request.config().secrets.jwt_secret),
                    request.jwt_secret_generated()
                );
                Ok(format!("Wrote {}", path.display()))
            }
            StepName::ProvisionDatabase => self.provision_database(request).await,
            StepName::GenerateProcessConfig => {
                let path = self.settings.process_manager_path();
                let text = build_process_descriptor(
                    &self.settings.process,
                    &self.settings.app_root,
                    &self.settings.app_log_dir(),
                    &request.config().environment,
                )
                .map_err(|e| StepFailure::new(StepErrorKind::Internal, format!("{:#}", e)))?;
                journal
                    .write(&path, text.as_bytes(), PUBLIC_FILE_MODE, "process descriptor")
                    .await
                    .map_err(|e| fs_failure("Could not write process manager configuration", &e))?;
                Ok(format!("Wrote {}", path.display()))
            }
            StepName::ProvisionLogDirectory => provision_log_directory(
                self.runner.as_ref(),
                &self.settings.app_log_dir(),
                self.settings.log_dir.owner.as_deref(),
            )
            .await
            .map_err(|e| fs_failure("Could not prepare log directory", &e)),
            StepName::CommitMarker => {
                self.state
                    .commit(Utc::now())
                    .await
                    .map_err(|e| fs_failure("Could not record installation", &e))?;
                Ok(format!("Marker written to {}", self.state.marker_path().display()))
            }
        }
    }

    async fn provision_database(&self, request: &InstallationRequest) -> Result<String, StepFailure> {
        let db = request.database();
        info!(
            "[PHASE: installation] [STEP: provision_database] target={}",
            describe_db_target(&db.host, db.port, &db.username, Some(&db.name))
        );

        let created = self.connector.create_database(db).await.map_err(|e| {
            StepFailure::new(
                StepErrorKind::DatabaseSetup,
                format!("Database setup failed: {}", e),
            )
        })?;

        let env = vec![
            ("NODE_ENV".to_string(), request.config().environment.clone()),
            ("DB_HOST".to_string(), db.host.clone()),
            ("DB_PORT".to_string(), db.port.to_string()),
            ("DB_NAME".to_string(), db.name.clone()),
            ("DB_USER".to_string(), db.username.clone()),
            ("DB_PASSWORD".to_string(), db.password.clone()),
        ];
        self.run_configured(&self.settings.commands.migrate, StepName::ProvisionDatabase, env)
            .await
            .map_err(|e| {
                StepFailure::new(
                    StepErrorKind::DatabaseSetup,
                    format!("Database setup failed: {}", e.message),
                )
            })?;

        Ok(if created.created {
            format!("Created database {} and applied migrations", created.db_name)
        } else {
            format!("Database {} already existed; applied migrations", created.db_name)
        })
    }

    /// Run a configured argument array in the application root.
    async fn run_configured(
        &self,
        argv: &[String],
        name: StepName,
        env: Vec<(String, String)>,
    ) -> Result<String, StepFailure> {
        let spec = CommandSpec::from_argv(argv, name.as_str(), self.settings.command_timeout())
            .map_err(|e| StepFailure::new(StepErrorKind::Internal, format!("{:#}", e)))?
            .in_dir(self.settings.app_root.clone());
        let spec = env.iter().fold(spec, |spec, (k, v)| spec.with_env(k, v));

        let out = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| StepFailure::new(StepErrorKind::Command, format!("{:#}", e)))?;
        if !out.success() {
            return Err(StepFailure::new(StepErrorKind::Command, out.error_detail()));
        }
        Ok(format!("{} finished in {}ms", display_argv(argv), out.duration_ms))
    }
}

fn display_argv(argv: &[String]) -> String {
    argv.join(" ")
}

fn fs_failure(context: &str, e: &anyhow::Error) -> StepFailure {
    StepFailure::new(StepErrorKind::Filesystem, format!("{}: {:#}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connection::stubs::StubConnector;
    use crate::database::connection::ConnectError;
    use crate::installation::CommandOutput;
    use crate::models::requests::fixtures::sample_payload;
    use crate::models::state::ProgressLog;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// Records operations; fails the one named in `fail_on`.
    #[derive(Default)]
    struct ScriptedRunner {
        fail_on: Option<&'static str>,
        calls: Mutex<Vec<String>>,
        envs: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedRunner {
        fn failing(op: &'static str) -> Self {
            Self {
                fail_on: Some(op),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
            self.calls.lock().expect("lock").push(spec.operation.clone());
            self.envs.lock().expect("lock").push(spec.env.clone());
            let failed = self.fail_on == Some(spec.operation.as_str());
            Ok(CommandOutput {
                exit_code: Some(if failed { 1 } else { 0 }),
                stdout: String::new(),
                stderr: if failed {
                    format!("npm ERR! {} exploded", spec.operation)
                } else {
                    String::new()
                },
                duration_ms: 3,
            })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        settings: Arc<Settings>,
        runner: Arc<ScriptedRunner>,
        connector: Arc<StubConnector>,
        progress: Arc<ProgressLog>,
        orchestrator: Orchestrator,
    }

    fn harness_with(
        runner: ScriptedRunner,
        connector: StubConnector,
        tweak: impl FnOnce(&mut Settings, &Path),
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let mut settings = Settings {
            app_root: root.clone(),
            ..Settings::default()
        };
        settings.log_dir.path = Some(root.join("logs"));
        tweak(&mut settings, &root);

        let settings = Arc::new(settings);
        let runner = Arc::new(runner);
        let connector = Arc::new(connector);
        let progress = Arc::new(ProgressLog::new());
        let orchestrator = Orchestrator::new(
            Arc::clone(&settings),
            runner.clone(),
            connector.clone(),
            progress.emitter(),
        );
        Harness {
            _dir: dir,
            root,
            settings,
            runner,
            connector,
            progress,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedRunner::default(), StubConnector::ok(), |_, _| {})
    }

    fn statuses(outcome: &InstallationOutcome) -> Vec<StepStatus> {
        outcome.steps.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn successful_run_provisions_everything_and_commits_marker() {
        let h = harness();
        let outcome = h.orchestrator.run(sample_payload()).await;

        assert!(outcome.is_success(), "{:?}", outcome);
        assert!(outcome.error_message.is_none());
        assert!(statuses(&outcome).iter().all(|s| *s == StepStatus::Succeeded));
        assert!(h.orchestrator.state_store().exists().await);

        let env_text = std::fs::read_to_string(h.settings.env_file_path()).expect("env file");
        let env = env_file::parse(&env_text);
        assert_eq!(env.get("DB_NAME").map(String::as_str), Some("app_db"));
        assert_eq!(env.get("JWT_SECRET").map(String::as_str), Some("abc123"));
        assert_eq!(env.get("STRIPE_SECRET_KEY").map(String::as_str), Some("sk_test"));
        assert!(h.settings.process_manager_path().exists());
        assert!(h.root.join("logs").is_dir());

        assert_eq!(
            h.runner.calls(),
            vec!["install_dependencies", "build_application", "provision_database"]
        );
        assert_eq!(h.connector.creates.load(Ordering::SeqCst), 1);

        // migrations get the database coordinates
        let envs = h.runner.envs.lock().expect("lock").clone();
        assert!(envs[2].iter().any(|(k, v)| k == "DB_NAME" && v == "app_db"));

        let entries = h.progress.entries();
        let last = entries.last().expect("progress");
        assert_eq!(last.percent, 100);
        assert!(entries.iter().all(|p| p.correlation_id == outcome.correlation_id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn environment_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let h = harness();
        assert!(h.orchestrator.run(sample_payload()).await.is_success());
        let mode = std::fs::metadata(h.settings.env_file_path())
            .expect("meta")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn second_run_is_refused_without_side_effects() {
        let h = harness();
        assert!(h.orchestrator.run(sample_payload()).await.is_success());

        let env_before = std::fs::read(h.settings.env_file_path()).expect("env");
        let calls_before = h.runner.calls().len();
        let db_calls_before = h.connector.calls();

        let outcome = h.orchestrator.run(sample_payload()).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.error_message.as_deref(), Some(ALREADY_INSTALLED));
        assert_eq!(outcome.error_kind, Some(StepErrorKind::AlreadyInstalled));
        assert!(statuses(&outcome).iter().all(|s| *s == StepStatus::Pending));

        assert_eq!(std::fs::read(h.settings.env_file_path()).expect("env"), env_before);
        assert_eq!(h.runner.calls().len(), calls_before);
        assert_eq!(h.connector.calls(), db_calls_before);
    }

    #[tokio::test]
    async fn marker_check_precedes_validation() {
        let h = harness();
        std::fs::write(h.settings.marker_path(), "").expect("seed marker");
        let outcome = h.orchestrator.run(InstallPayload::default()).await;
        assert_eq!(outcome.error_kind, Some(StepErrorKind::AlreadyInstalled));
    }

    #[tokio::test]
    async fn invalid_request_has_zero_side_effects() {
        let h = harness();
        let mut payload = sample_payload();
        payload.config.app_url.clear();

        let outcome = h.orchestrator.run(payload).await;
        assert_eq!(outcome.error_kind, Some(StepErrorKind::Validation));
        assert!(outcome.error_message.unwrap_or_default().contains("Application URL"));
        assert!(h.runner.calls().is_empty());
        assert_eq!(h.connector.calls(), 0);
        assert_eq!(
            std::fs::read_dir(&h.root).expect("read_dir").count(),
            0,
            "nothing may be written, not even the lock file"
        );
        assert!(h.progress.entries().is_empty());
    }

    #[tokio::test]
    async fn failing_mandatory_step_stops_the_sequence() {
        type Setup = Box<dyn FnOnce() -> Harness>;
        let cases: Vec<(StepName, StepErrorKind, Setup)> = vec![
            (
                StepName::InstallDependencies,
                StepErrorKind::Command,
                Box::new(|| {
                    harness_with(
                        ScriptedRunner::failing("install_dependencies"),
                        StubConnector::ok(),
                        |_, _| {},
                    )
                }),
            ),
            (
                StepName::BuildApplication,
                StepErrorKind::Command,
                Box::new(|| {
                    harness_with(
                        ScriptedRunner::failing("build_application"),
                        StubConnector::ok(),
                        |_, _| {},
                    )
                }),
            ),
            (
                StepName::MaterializeConfiguration,
                StepErrorKind::Filesystem,
                Box::new(|| {
                    harness_with(ScriptedRunner::default(), StubConnector::ok(), |s, root| {
                        std::fs::write(root.join("blocker"), "file").expect("blocker");
                        s.env_file = Some(root.join("blocker").join(".env"));
                    })
                }),
            ),
            (
                StepName::ProvisionDatabase,
                StepErrorKind::DatabaseSetup,
                Box::new(|| {
                    harness_with(
                        ScriptedRunner::default(),
                        StubConnector::unreachable("Connection refused"),
                        |_, _| {},
                    )
                }),
            ),
            (
                StepName::GenerateProcessConfig,
                StepErrorKind::Filesystem,
                Box::new(|| {
                    harness_with(ScriptedRunner::default(), StubConnector::ok(), |s, root| {
                        std::fs::write(root.join("blocker"), "file").expect("blocker");
                        s.process_manager_file = Some(root.join("blocker").join("pm.json"));
                    })
                }),
            ),
        ];

        for (failing, kind, setup) in cases {
            let h = setup();
            let outcome = h.orchestrator.run(sample_payload()).await;

            assert!(!outcome.is_success(), "{:?} should fail", failing);
            assert_eq!(outcome.error_kind, Some(kind), "{:?}", failing);
            let step = outcome.step(failing).expect("step");
            assert_eq!(step.status, StepStatus::Failed);
            assert_eq!(outcome.error_message, step.detail_message);

            for s in &outcome.steps {
                if s.ordinal < failing.ordinal() {
                    assert_eq!(s.status, StepStatus::Succeeded, "{:?}", s.name);
                } else if s.ordinal > failing.ordinal() {
                    assert_eq!(s.status, StepStatus::Pending, "{:?}", s.name);
                }
            }
            assert!(!h.orchestrator.state_store().exists().await, "{:?}", failing);
        }
    }

    #[tokio::test]
    async fn command_failure_surfaces_captured_output() {
        let h = harness_with(
            ScriptedRunner::failing("build_application"),
            StubConnector::ok(),
            |_, _| {},
        );
        let outcome = h.orchestrator.run(sample_payload()).await;
        let msg = outcome.error_message.expect("message");
        assert!(msg.starts_with("Build failed:"), "{}", msg);
        assert!(msg.contains("npm ERR! build_application exploded"), "{}", msg);
        assert_eq!(h.runner.calls(), vec!["install_dependencies", "build_application"]);
    }

    #[tokio::test]
    async fn database_failure_rolls_back_written_files() {
        let h = harness_with(
            ScriptedRunner::default(),
            StubConnector::unreachable("Can't connect to MySQL server"),
            |_, _| {},
        );
        let outcome = h.orchestrator.run(sample_payload()).await;

        assert_eq!(outcome.error_kind, Some(StepErrorKind::DatabaseSetup));
        let msg = outcome.error_message.clone().expect("message");
        assert!(msg.starts_with("Database setup failed"), "{}", msg);
        assert!(msg.contains("Can't connect"), "{}", msg);
        assert!(!h.settings.env_file_path().exists(), "environment file must be rolled back");
        assert_eq!(outcome.rolled_back.len(), 1);
        assert!(!h.orchestrator.state_store().exists().await);
        // migrations never ran
        assert_eq!(h.runner.calls(), vec!["install_dependencies", "build_application"]);
    }

    #[tokio::test]
    async fn database_failure_without_rollback_leaves_environment_file() {
        let h = harness_with(
            ScriptedRunner::default(),
            StubConnector::unreachable("Can't connect to MySQL server"),
            |s, _| s.rollback_on_failure = false,
        );
        let outcome = h.orchestrator.run(sample_payload()).await;

        assert_eq!(outcome.error_kind, Some(StepErrorKind::DatabaseSetup));
        assert!(h.settings.env_file_path().exists());
        assert!(outcome.rolled_back.is_empty());
        assert!(!h.orchestrator.state_store().exists().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn marker_commit_failure_rolls_back_every_artifact() {
        // The marker's parent is a dangling symlink: reads see "not installed",
        // but the directory can never be created.
        let h = harness_with(ScriptedRunner::default(), StubConnector::ok(), |s, root| {
            std::os::unix::fs::symlink(root.join("nowhere"), root.join("state"))
                .expect("symlink");
            s.marker_file = Some(root.join("state").join(".installed"));
        });

        let outcome = h.orchestrator.run(sample_payload()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.error_kind, Some(StepErrorKind::Filesystem));
        let commit = outcome.step(StepName::CommitMarker).expect("step");
        assert_eq!(commit.status, StepStatus::Failed);
        assert!(outcome.steps[..5].iter().all(|s| s.status == StepStatus::Succeeded));

        let env_path = h.settings.env_file_path().display().to_string();
        let descriptor_path = h.settings.process_manager_path().display().to_string();
        assert!(outcome.rolled_back.contains(&env_path), "{:?}", outcome.rolled_back);
        assert!(outcome.rolled_back.contains(&descriptor_path), "{:?}", outcome.rolled_back);
        assert!(!h.settings.env_file_path().exists());
        assert!(!h.settings.process_manager_path().exists());
        assert!(!h.orchestrator.state_store().exists().await);
    }

    #[tokio::test]
    async fn rollback_restores_a_previous_environment_file() {
        let h = harness_with(
            ScriptedRunner::failing("provision_database"),
            StubConnector::ok(),
            |_, _| {},
        );
        std::fs::write(h.settings.env_file_path(), "OLD=1\n").expect("seed");

        let outcome = h.orchestrator.run(sample_payload()).await;
        assert_eq!(outcome.error_kind, Some(StepErrorKind::DatabaseSetup));
        assert_eq!(
            std::fs::read_to_string(h.settings.env_file_path()).expect("env"),
            "OLD=1\n"
        );
    }

    #[tokio::test]
    async fn log_directory_failure_is_tolerated() {
        let h = harness_with(ScriptedRunner::default(), StubConnector::ok(), |s, root| {
            std::fs::write(root.join("not-a-dir"), "file").expect("blocker");
            s.log_dir.path = Some(root.join("not-a-dir").join("logs"));
        });
        let outcome = h.orchestrator.run(sample_payload()).await;

        assert!(outcome.is_success(), "{:?}", outcome);
        let step = outcome.step(StepName::ProvisionLogDirectory).expect("step");
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error_kind, Some(StepErrorKind::Filesystem));
        assert_eq!(
            outcome.step(StepName::CommitMarker).map(|s| s.status),
            Some(StepStatus::Succeeded)
        );
        assert_eq!(outcome.warnings.len(), 1);
        assert!(h.orchestrator.state_store().exists().await);
        assert!(h.progress.entries().iter().any(|p| p.severity == "warn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_run_is_refused_while_lock_is_held() {
        let h = harness();
        let held = h
            .orchestrator
            .state_store()
            .try_lock()
            .expect("lock")
            .expect("acquired");

        let outcome = h.orchestrator.run(sample_payload()).await;
        assert_eq!(outcome.error_kind, Some(StepErrorKind::InProgress));
        assert!(h.runner.calls().is_empty());
        assert!(!h.settings.env_file_path().exists());

        drop(held);
        assert!(h.orchestrator.run(sample_payload()).await.is_success());
    }

    #[tokio::test]
    async fn missing_signing_secret_is_generated() {
        let h = harness();
        let mut payload = sample_payload();
        payload.config.secrets.jwt_secret = None;

        let outcome = h.orchestrator.run(payload).await;
        assert!(outcome.is_success());
        assert!(outcome.jwt_secret_generated);

        let env = env_file::parse(
            &std::fs::read_to_string(h.settings.env_file_path()).expect("env"),
        );
        assert_eq!(env.get("JWT_SECRET").map(String::len), Some(64));
    }

    #[tokio::test]
    async fn outcome_serializes_step_trace() {
        let h = harness_with(
            ScriptedRunner::default(),
            StubConnector {
                create_result: Err(ConnectError::Timeout(10)),
                ..StubConnector::ok()
            },
            |_, _| {},
        );
        let outcome = h.orchestrator.run(sample_payload()).await;
        let v = serde_json::to_value(&outcome).expect("json");

        assert_eq!(v["overallStatus"], "failure");
        assert_eq!(v["errorKind"], "databaseSetup");
        assert_eq!(v["steps"].as_array().map(Vec::len), Some(7));
        assert_eq!(v["steps"][3]["name"], "provision_database");
        assert_eq!(v["steps"][3]["status"], "failed");
        assert_eq!(v["steps"][4]["status"], "pending");
        assert!(!v.to_string().contains("abc123"), "secrets must not leak into the trace");
    }

    #[test]
    fn step_sequence_is_fixed() {
        let ordinals: Vec<u8> = StepName::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5, 6, 7]);
        let optional: Vec<StepName> = StepName::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_mandatory())
            .collect();
        assert_eq!(optional, vec![StepName::ProvisionLogDirectory]);
        assert!(percent_after(StepName::CommitMarker) <= 100);
    }
}
