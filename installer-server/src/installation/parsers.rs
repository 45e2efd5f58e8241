// Pure parsing helpers (no I/O, testable on any OS).

use std::fmt;

/// Version reported by the application runtime (`node --version` -> `v20.11.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse the first line of a runtime `--version` output.
///
/// Accepts `v20.11.1`, `20.11.1`, `v20` and ignores pre-release/build suffixes
/// (`v21.0.0-nightly2023`).
pub fn parse_runtime_version(output: &str) -> Option<RuntimeVersion> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let raw = line.strip_prefix('v').unwrap_or(line);
    let core = raw.split(['-', '+', ' ']).next()?;

    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u32>().ok()?;
    let minor = match parts.next() {
        Some(p) => p.parse::<u32>().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(p) => p.parse::<u32>().ok()?,
        None => 0,
    };

    Some(RuntimeVersion {
        major,
        minor,
        patch,
    })
}
