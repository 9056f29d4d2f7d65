//! Configuration loading and validation.
//!
//! Loads from `/etc/session-audit/config.toml` (or `$SESSION_AUDIT_CONFIG`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::host::HostRequirements;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/session-audit/config.toml";

/// Perf buffer size used when the configured page count is zero.
pub const DEFAULT_PERF_BUFFER_PAGE_COUNT: usize = 8;

/// cgroup v2 mount used when the configured path is empty.
pub const DEFAULT_CGROUP_MOUNT_PATH: &str = "/cgroup2";

/// Rejected configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A parameter is outside its allowed range.
    #[error("bad parameter: {0}")]
    BadParameter(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Probe and cgroup settings (`[bpf]`).
    pub bpf: BpfConfig,
    /// Host requirements (`[host]`).
    pub host: HostConfig,
    /// Audit sink settings (`[audit]`).
    pub audit: AuditConfig,
    /// Diagnostic logging (`[logging]`).
    pub logging: LoggingConfig,
}

/// Probe and cgroup settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BpfConfig {
    /// Whether session auditing is enabled at all.
    pub enabled: bool,
    /// Pages per CPU perf buffer. Must be a power of two; zero means default.
    pub perf_buffer_page_count: usize,
    /// Where the cgroup v2 hierarchy is mounted.
    pub cgroup_mount_path: PathBuf,
    /// Directory holding the prebuilt probe objects.
    pub object_dir: PathBuf,
    /// Capacity of each probe's event queue.
    pub queue_capacity: usize,
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            perf_buffer_page_count: DEFAULT_PERF_BUFFER_PAGE_COUNT,
            cgroup_mount_path: PathBuf::from(DEFAULT_CGROUP_MOUNT_PATH),
            object_dir: PathBuf::from("/usr/lib/session-audit/bpf"),
            queue_capacity: 1024,
        }
    }
}

/// Host requirements checked before any probe loads.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// Minimum kernel release, as `major.minor.patch`.
    pub min_kernel: String,
    /// Shared libraries that must be resolvable. Empty disables the check.
    pub required_libraries: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let requirements = HostRequirements::default();
        Self {
            min_kernel: requirements.min_kernel.to_string(),
            required_libraries: requirements.required_libraries,
        }
    }
}

/// Audit sink settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit log written by the binary.
    pub log_path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("/var/log/session-audit/audit.log"),
        }
    }
}

/// Diagnostic logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated daemon logs.
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: PathBuf::from("/var/log/session-audit"),
        }
    }
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, returns defaults.
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let mut config = Self::load_from(Self::config_path_with(env))?;
        config.apply_overrides(env);
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("SESSION_AUDIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Parse a TOML string into config.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SESSION_AUDIT_PERF_PAGES") {
            match v.parse() {
                Ok(n) => self.bpf.perf_buffer_page_count = n,
                Err(_) => tracing::warn!(
                    var = "SESSION_AUDIT_PERF_PAGES",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("SESSION_AUDIT_CGROUP_PATH") {
            self.bpf.cgroup_mount_path = PathBuf::from(v);
        }
        if let Some(v) = env("SESSION_AUDIT_OBJECT_DIR") {
            self.bpf.object_dir = PathBuf::from(v);
        }
        if let Some(v) = env("SESSION_AUDIT_LOG") {
            self.audit.log_path = PathBuf::from(v);
        }
        if let Some(v) = env("SESSION_AUDIT_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Fill in defaults for zero/empty values and reject invalid ones.
    pub fn check_and_set_defaults(&mut self) -> Result<(), ConfigError> {
        if self.bpf.perf_buffer_page_count == 0 {
            self.bpf.perf_buffer_page_count = DEFAULT_PERF_BUFFER_PAGE_COUNT;
        }
        if !self.bpf.perf_buffer_page_count.is_power_of_two() {
            return Err(ConfigError::BadParameter(format!(
                "perf_buffer_page_count must be a power of two, got {}",
                self.bpf.perf_buffer_page_count
            )));
        }
        if self.bpf.cgroup_mount_path.as_os_str().is_empty() {
            self.bpf.cgroup_mount_path = PathBuf::from(DEFAULT_CGROUP_MOUNT_PATH);
        }
        if self.bpf.queue_capacity == 0 {
            return Err(ConfigError::BadParameter(
                "queue_capacity must be at least 1".to_owned(),
            ));
        }
        self.host_requirements()?;
        Ok(())
    }

    /// Host requirements described by the `[host]` section.
    pub fn host_requirements(&self) -> Result<HostRequirements, ConfigError> {
        let min_kernel = semver::Version::parse(&self.host.min_kernel).map_err(|e| {
            ConfigError::BadParameter(format!(
                "min_kernel {:?} is not a version: {e}",
                self.host.min_kernel
            ))
        })?;
        Ok(HostRequirements {
            min_kernel,
            required_libraries: self.host.required_libraries.clone(),
        })
    }
}
