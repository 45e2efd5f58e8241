//! Server settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML file,
//! then `INSTALLER__*` environment variables (`INSTALLER__BIND_ADDR`,
//! `INSTALLER__COMMANDS__TIMEOUT_SECS`, ...).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::path_resolver::absolutize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    /// Working directory of the application being provisioned.
    pub app_root: PathBuf,
    pub env_file: Option<PathBuf>,
    pub marker_file: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub process_manager_file: Option<PathBuf>,
    /// Installer's own log folder (defaults to `<app_root>/installer-logs`).
    pub installer_log_dir: Option<PathBuf>,
    /// Restore files written by earlier steps when a mandatory step fails.
    pub rollback_on_failure: bool,
    pub commands: CommandSettings,
    pub runtime: RuntimeSettings,
    pub database: DatabaseSettings,
    pub payment: PaymentSettings,
    pub process: ProcessSettings,
    pub log_dir: LogDirSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub install: Vec<String>,
    pub build: Vec<String>,
    pub migrate: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub program: String,
    pub min_major: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub probe_host: String,
    pub probe_port: u16,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentSettings {
    pub api_base: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub name: String,
    pub script: String,
    pub instances: u32,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogDirSettings {
    pub path: Option<PathBuf>,
    /// `user` or `user:group` handed to `chown`; no ownership change when unset.
    pub owner: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8085".to_string(),
            app_root: PathBuf::from("."),
            env_file: None,
            marker_file: None,
            lock_file: None,
            process_manager_file: None,
            installer_log_dir: None,
            rollback_on_failure: true,
            commands: CommandSettings::default(),
            runtime: RuntimeSettings::default(),
            database: DatabaseSettings::default(),
            payment: PaymentSettings::default(),
            process: ProcessSettings::default(),
            log_dir: LogDirSettings::default(),
        }
    }
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            install: vec!["npm".to_string(), "install".to_string()],
            build: vec!["npm".to_string(), "run".to_string(), "build".to_string()],
            migrate: vec!["npm".to_string(), "run".to_string(), "migrate".to_string()],
            timeout_secs: 900,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            min_major: 18,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            probe_host: "127.0.0.1".to_string(),
            probe_port: 3306,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.stripe.com".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            script: "dist/server.js".to_string(),
            instances: 2,
            max_restarts: 10,
            restart_delay_ms: 5000,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `INSTALLER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p.to_path_buf()).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("INSTALLER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read installer settings")?
            .try_deserialize()
            .context("Invalid installer settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would make every installation fail.
    pub fn validate(&self) -> Result<()> {
        for (label, cmd) in [
            ("commands.install", &self.commands.install),
            ("commands.build", &self.commands.build),
            ("commands.migrate", &self.commands.migrate),
        ] {
            if cmd.first().map(|p| p.trim().is_empty()).unwrap_or(true) {
                anyhow::bail!("{} must name a program", label);
            }
        }
        if self.process.name.trim().is_empty() {
            anyhow::bail!("process.name must not be empty");
        }
        if self.process.instances == 0 {
            anyhow::bail!("process.instances must be at least 1");
        }
        Ok(())
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.resolve(self.env_file.as_deref(), ".env")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.resolve(self.marker_file.as_deref(), ".installed")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.resolve(self.lock_file.as_deref(), ".install.lock")
    }

    pub fn process_manager_path(&self) -> PathBuf {
        self.resolve(
            self.process_manager_file.as_deref(),
            "ecosystem.config.json",
        )
    }

    pub fn app_log_dir(&self) -> PathBuf {
        self.log_dir
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log").join(&self.process.name))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.timeout_secs.max(1))
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs.max(1))
    }

    fn resolve(&self, configured: Option<&Path>, default_name: &str) -> PathBuf {
        match configured {
            Some(p) => absolutize(&self.app_root, p),
            None => self.app_root.join(default_name),
        }
    }
}
