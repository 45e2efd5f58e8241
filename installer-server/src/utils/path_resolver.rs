use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve deployment folder (absolute path)
pub fn resolve_deployment_folder() -> Result<PathBuf> {
    // Prefer the folder where the binary is running from.
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return Ok(dir.to_path_buf());
        }
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    Ok(cwd)
}

/// Resolve the installer's own log folder (absolute path).
///
/// An explicit override wins; otherwise `installer-logs/` next to the application root,
/// falling back to the deployment folder.
pub fn resolve_log_folder(override_dir: Option<&Path>, app_root: &Path) -> Result<PathBuf> {
    let candidate = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None if app_root.is_dir() => app_root.join("installer-logs"),
        None => resolve_deployment_folder()?.join("installer-logs"),
    };

    std::fs::create_dir_all(&candidate)
        .with_context(|| format!("Failed to create log folder: {:?}", candidate))?;
    Ok(candidate)
}

/// Make a possibly relative path absolute against `base`.
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
