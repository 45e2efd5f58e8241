// Install state store
//
// The marker file is the durable "installation completed" fact. A sibling lock
// file serializes orchestration runs (advisory `flock`, released on drop).

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::installation::files::{write_file_atomic, PUBLIC_FILE_MODE};

/// Marker file content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallMarker {
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstallStateStore {
    marker_path: PathBuf,
    lock_path: PathBuf,
}

/// Held for the duration of one orchestration run.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
    _file: File,
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock.
        debug!(
            "[PHASE: installation] [STEP: lock] Released install lock {:?}",
            self.path
        );
    }
}

impl InstallStateStore {
    pub fn new(marker_path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            marker_path: marker_path.into(),
            lock_path: lock_path.into(),
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Whether the marker is present. Unreadable metadata counts as present so a
    /// broken filesystem never re-opens the installer.
    pub async fn exists(&self) -> bool {
        match tokio::fs::try_exists(&self.marker_path).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "[PHASE: installation] [STEP: marker] Could not stat marker {:?}: {}; treating as installed",
                    self.marker_path, e
                );
                true
            }
        }
    }

    /// Marker content, if present and parseable. Legacy empty markers read as `completed_at: None`.
    pub async fn read(&self) -> Option<InstallMarker> {
        let bytes = tokio::fs::read(&self.marker_path).await.ok()?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Some(InstallMarker { completed_at: None });
        }
        serde_json::from_slice(&bytes).ok()
    }

    /// Write the marker atomically.
    pub async fn commit(&self, completed_at: DateTime<Utc>) -> Result<()> {
        let marker = InstallMarker {
            completed_at: Some(completed_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        };
        let mut bytes = serde_json::to_vec_pretty(&marker).context("Failed to serialize marker")?;
        bytes.push(b'\n');

        if let Some(parent) = self.marker_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        write_file_atomic(&self.marker_path, &bytes, PUBLIC_FILE_MODE)
            .await
            .with_context(|| format!("Failed to write install marker {:?}", self.marker_path))?;

        info!(
            "[PHASE: installation] [STEP: marker] Install marker committed (path={:?})",
            self.marker_path
        );
        Ok(())
    }

    /// Try to take the exclusive run lock without blocking.
    ///
    /// `Ok(None)` means another run holds it.
    pub fn try_lock(&self) -> Result<Option<InstallLock>> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file {:?}", self.lock_path))?;

        if !try_flock_exclusive(&file)
            .with_context(|| format!("Failed to lock {:?}", self.lock_path))?
        {
            info!(
                "[PHASE: installation] [STEP: lock] Install lock busy (path={:?})",
                self.lock_path
            );
            return Ok(None);
        }

        debug!(
            "[PHASE: installation] [STEP: lock] Acquired install lock {:?}",
            self.lock_path
        );
        Ok(Some(InstallLock {
            path: self.lock_path.clone(),
            _file: file,
        }))
    }
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and valid for this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

// No advisory locking available: runs are not serialized.
#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}
