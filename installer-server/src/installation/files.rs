//! Artifact writes for the installation run.
//!
//! Goals:
//! - Async I/O only (tokio)
//! - Every write is staged to a sibling temp file and renamed into place
//! - Restrictive modes at creation time on Unix (no window with default perms)
//! - Every touched path is journaled so a failed run can restore the prior state

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;

/// Mode for files holding secrets (environment file).
pub const SECRET_FILE_MODE: u32 = 0o600;
/// Mode for non-secret generated files (descriptor, marker).
pub const PUBLIC_FILE_MODE: u32 = 0o644;

fn staging_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let staged = format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(staged),
        None => PathBuf::from(staged),
    }
}

/// Write `bytes` to `path` atomically: stage, fsync, rename.
///
/// The parent directory must exist.
pub async fn write_file_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let staged = staging_path_for(path);

    let res = async {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        let mut f = opts
            .open(&staged)
            .await
            .with_context(|| format!("Failed to create {:?}", staged))?;
        f.write_all(bytes)
            .await
            .with_context(|| format!("Failed to write {:?}", staged))?;
        f.sync_all()
            .await
            .with_context(|| format!("Failed to sync {:?}", staged))?;
        drop(f);

        tokio::fs::rename(&staged, path)
            .await
            .with_context(|| format!("Failed to move {:?} into place at {:?}", staged, path))?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if res.is_err() {
        let _ = tokio::fs::remove_file(&staged).await;
    }
    res
}

#[derive(Debug)]
struct JournalEntry {
    path: PathBuf,
    label: String,
    /// Content and mode before this run touched the path; `None` = did not exist.
    previous: Option<(Vec<u8>, u32)>,
}

/// Records every file written during one orchestration run.
#[derive(Debug, Default)]
pub struct ArtifactJournal {
    entries: Vec<JournalEntry>,
    /// Directories this run created, in creation order.
    created_dirs: Vec<PathBuf>,
}

impl ArtifactJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    /// Write an artifact, remembering what was there before.
    pub async fn write(&mut self, path: &Path, bytes: &[u8], mode: u32, label: &str) -> Result<()> {
        let started = Instant::now();
        debug!(
            "[PHASE: installation] [STEP: files] journal write entered (label={}, path={:?}, bytes={})",
            label,
            path,
            bytes.len()
        );

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.created_dirs.extend(missing_ancestors(parent).await);
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        if !self.entries.iter().any(|e| e.path == path) {
            let previous = read_previous(path).await?;
            self.entries.push(JournalEntry {
                path: path.to_path_buf(),
                label: label.to_string(),
                previous,
            });
        }

        write_file_atomic(path, bytes, mode)
            .await
            .with_context(|| format!("Failed to write {} to {:?}", label, path))?;

        info!(
            "[PHASE: installation] [STEP: files] {} written (path={:?}, bytes={}, duration_ms={})",
            label,
            path,
            bytes.len(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Restore every journaled path to its pre-run state (newest first).
    ///
    /// Best-effort: failures are logged and returned, never raised.
    pub async fn rollback(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some(entry) = self.entries.pop() {
            let res = match &entry.previous {
                Some((bytes, mode)) => write_file_atomic(&entry.path, bytes, *mode).await,
                None => match tokio::fs::remove_file(&entry.path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(anyhow::Error::new(e)),
                },
            };
            match res {
                Ok(()) => info!(
                    "[PHASE: installation] [STEP: rollback] Restored {} (path={:?}, existed_before={})",
                    entry.label,
                    entry.path,
                    entry.previous.is_some()
                ),
                Err(e) => {
                    warn!(
                        "[PHASE: installation] [STEP: rollback] Failed to restore {} (path={:?}): {:#}",
                        entry.label, entry.path, e
                    );
                    failures.push(format!("{}: {:#}", entry.path.display(), e));
                }
            }
        }
        while let Some(dir) = self.created_dirs.pop() {
            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => debug!(
                    "[PHASE: installation] [STEP: rollback] Removed created directory {:?}",
                    dir
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                // Something else now lives there; leave it.
                Err(e) => warn!(
                    "[PHASE: installation] [STEP: rollback] Kept directory {:?}: {}",
                    dir, e
                ),
            }
        }
        failures
    }

    /// Keep everything written so far; the journal forgets the prior state.
    pub fn commit(&mut self) {
        self.entries.clear();
        self.created_dirs.clear();
    }
}

/// Ancestors of `dir` (itself included) that do not exist yet, outermost first.
async fn missing_ancestors(dir: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut cur = Some(dir);
    while let Some(d) = cur.filter(|p| !p.as_os_str().is_empty()) {
        if tokio::fs::try_exists(d).await.unwrap_or(true) {
            break;
        }
        missing.push(d.to_path_buf());
        cur = d.parent();
    }
    missing.reverse();
    missing
}

async fn read_previous(path: &Path) -> Result<Option<(Vec<u8>, u32)>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let mode = file_mode(path).await;
            Ok(Some((bytes, mode)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e))
            .with_context(|| format!("Failed to read existing {:?}", path)),
    }
}

#[cfg(unix)]
async fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(PUBLIC_FILE_MODE)
}

#[cfg(not(unix))]
async fn file_mode(_path: &Path) -> u32 {
    PUBLIC_FILE_MODE
}
