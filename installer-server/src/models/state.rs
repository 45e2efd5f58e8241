// Application state (in-memory)
//
// NOTE: Nothing here is persisted. The progress log only covers the current or
// most recent orchestration run and is lost on restart.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::installer::{Orchestrator, ProgressEmitter, ProgressPayload};
use crate::api::preflight::EnvironmentProber;
use crate::database::connection::DbConnector;
use crate::payment::PaymentGatewayValidator;
use crate::settings::Settings;

/// Append-only progress lines of one run. A payload with a new correlation id
/// starts a fresh run.
#[derive(Debug, Default)]
pub struct ProgressLog {
    inner: Mutex<ProgressLogInner>,
}

#[derive(Debug, Default)]
struct ProgressLogInner {
    correlation_id: Option<String>,
    entries: Vec<ProgressPayload>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressLogInner> {
        // A panicked writer leaves a valid Vec behind; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, payload: ProgressPayload) {
        let mut inner = self.lock();
        if inner.correlation_id.as_deref() != Some(payload.correlation_id.as_str()) {
            inner.correlation_id = Some(payload.correlation_id.clone());
            inner.entries.clear();
        }
        inner.entries.push(payload);
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.lock().correlation_id.clone()
    }

    pub fn entries(&self) -> Vec<ProgressPayload> {
        self.lock().entries.clone()
    }

    /// Human-readable lines, one per entry.
    pub fn lines(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .map(ProgressPayload::to_line)
            .collect()
    }

    /// Emitter that appends into this log.
    pub fn emitter(self: &Arc<Self>) -> ProgressEmitter {
        let log = Arc::clone(self);
        Arc::new(move |payload: ProgressPayload| log.append(payload))
    }
}

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub orchestrator: Arc<Orchestrator>,
    pub prober: Arc<EnvironmentProber>,
    pub connector: Arc<dyn DbConnector>,
    pub payment: PaymentGatewayValidator,
    pub progress: Arc<ProgressLog>,
}
