// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Any invalid value results in a HardValidationError.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GoblinError, GoblinResult, HardValidationError};

/// Longest engine run we are willing to wait for: one hour.
const MAX_ENGINE_TIMEOUT_MS: u64 = 3_600_000;

/// Raw engine configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineConfig {
    #[serde(default)]
    criu_path: Option<String>,
    #[serde(default)]
    criu_ns_path: Option<String>,
    #[serde(default)]
    sudo_path: Option<String>,
    #[serde(default = "default_true")]
    use_sudo: bool,
    #[serde(default = "default_true")]
    use_criu_ns: bool,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    kill_grace_ms: u64,
    #[serde(default = "default_verbosity")]
    verbosity: u8,
    #[serde(default = "default_true")]
    shell_job: bool,
    #[serde(default)]
    leave_running: bool,
    #[serde(default)]
    tcp_established: bool,
    #[serde(default)]
    extra_dump_args: Vec<String>,
    #[serde(default)]
    extra_restore_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    120_000 // 2 minutes
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

fn default_verbosity() -> u8 {
    4 // Full detail, the log tail is the main diagnostic
}

impl Default for RawEngineConfig {
    fn default() -> Self {
        Self {
            criu_path: None,
            criu_ns_path: None,
            sudo_path: None,
            use_sudo: true,
            use_criu_ns: true,
            timeout_ms: default_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            verbosity: default_verbosity(),
            shell_job: true,
            leave_running: false,
            tcp_established: false,
            extra_dump_args: Vec::new(),
            extra_restore_args: Vec::new(),
        }
    }
}

/// Raw lifecycle configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLifecycleConfig {
    #[serde(default = "default_root_dir")]
    root_dir: String,
    #[serde(default = "default_log_tail_lines")]
    log_tail_lines: usize,
    #[serde(default = "default_pidfile_timeout_ms")]
    pidfile_timeout_ms: u64,
}

fn default_root_dir() -> String {
    "/tmp/goblins".to_string()
}

fn default_log_tail_lines() -> usize {
    20
}

fn default_pidfile_timeout_ms() -> u64 {
    5_000
}

impl Default for RawLifecycleConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            log_tail_lines: default_log_tail_lines(),
            pidfile_timeout_ms: default_pidfile_timeout_ms(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    engine: RawEngineConfig,
    #[serde(default)]
    goblins: RawLifecycleConfig,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Explicit engine binary; resolved from the environment when `None`.
    pub criu_path: Option<PathBuf>,
    pub criu_ns_path: Option<PathBuf>,
    pub sudo_path: Option<PathBuf>,
    pub use_sudo: bool,
    /// Restore through the `criu-ns` helper when it can be found.
    pub use_criu_ns: bool,
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL on timeout.
    pub kill_grace: Duration,
    pub verbosity: u8,
    pub shell_job: bool,
    pub leave_running: bool,
    pub tcp_established: bool,
    pub extra_dump_args: Vec<String>,
    pub extra_restore_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            criu_path: None,
            criu_ns_path: None,
            sudo_path: None,
            use_sudo: true,
            use_criu_ns: true,
            timeout: Duration::from_millis(default_timeout_ms()),
            kill_grace: Duration::from_millis(default_kill_grace_ms()),
            verbosity: default_verbosity(),
            shell_job: true,
            leave_running: false,
            tcp_established: false,
            extra_dump_args: Vec::new(),
            extra_restore_args: Vec::new(),
        }
    }
}

/// Validated lifecycle configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Root directory holding one sub-directory per goblin.
    pub root_dir: PathBuf,
    pub log_tail_lines: usize,
    /// How long to wait for the restored pid after a successful restore.
    pub pidfile_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(default_root_dir()),
            log_tail_lines: default_log_tail_lines(),
            pidfile_timeout: Duration::from_millis(default_pidfile_timeout_ms()),
        }
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub goblins: LifecycleConfig,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> GoblinResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(GoblinError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| GoblinError::Io {
            context: "reading config file",
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> GoblinResult<Config> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_file(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Config::default())
        }
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> GoblinResult<Config> {
        // serde_yaml rejects an empty document for a struct
        let raw: RawConfig = if content.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| GoblinError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?
        };

        Ok(Config {
            engine: Self::validate_engine(raw.engine)?,
            goblins: Self::validate_lifecycle(raw.goblins)?,
        })
    }

    fn validate_engine(raw: RawEngineConfig) -> Result<EngineConfig, HardValidationError> {
        if raw.timeout_ms == 0 || raw.timeout_ms > MAX_ENGINE_TIMEOUT_MS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.timeout_ms",
                value: raw.timeout_ms.to_string(),
                reason: format!("Must be between 1 and {}", MAX_ENGINE_TIMEOUT_MS),
            });
        }

        if raw.kill_grace_ms > 60_000 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.kill_grace_ms",
                value: raw.kill_grace_ms.to_string(),
                reason: "Must not exceed 60000".to_string(),
            });
        }

        if raw.verbosity > 4 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.verbosity",
                value: raw.verbosity.to_string(),
                reason: "CRIU verbosity ranges from 0 to 4".to_string(),
            });
        }

        let empty_arg = raw
            .extra_dump_args
            .iter()
            .chain(raw.extra_restore_args.iter())
            .any(|a| a.trim().is_empty());
        if empty_arg {
            return Err(HardValidationError::InvalidFieldValue {
                field: "engine.extra_*_args",
                value: "\"\"".to_string(),
                reason: "Extra engine arguments cannot be empty".to_string(),
            });
        }

        Ok(EngineConfig {
            criu_path: non_empty_path(raw.criu_path, "engine.criu_path")?,
            criu_ns_path: non_empty_path(raw.criu_ns_path, "engine.criu_ns_path")?,
            sudo_path: non_empty_path(raw.sudo_path, "engine.sudo_path")?,
            use_sudo: raw.use_sudo,
            use_criu_ns: raw.use_criu_ns,
            timeout: Duration::from_millis(raw.timeout_ms),
            kill_grace: Duration::from_millis(raw.kill_grace_ms),
            verbosity: raw.verbosity,
            shell_job: raw.shell_job,
            leave_running: raw.leave_running,
            tcp_established: raw.tcp_established,
            extra_dump_args: raw.extra_dump_args,
            extra_restore_args: raw.extra_restore_args,
        })
    }

    fn validate_lifecycle(raw: RawLifecycleConfig) -> Result<LifecycleConfig, HardValidationError> {
        if raw.root_dir.trim().is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "goblins.root_dir",
                value: raw.root_dir,
                reason: "Root directory cannot be empty".to_string(),
            });
        }

        if raw.log_tail_lines == 0 || raw.log_tail_lines > 1000 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "goblins.log_tail_lines",
                value: raw.log_tail_lines.to_string(),
                reason: "Must be between 1 and 1000".to_string(),
            });
        }

        if raw.pidfile_timeout_ms == 0 || raw.pidfile_timeout_ms > 60_000 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "goblins.pidfile_timeout_ms",
                value: raw.pidfile_timeout_ms.to_string(),
                reason: "Must be between 1 and 60000".to_string(),
            });
        }

        Ok(LifecycleConfig {
            root_dir: PathBuf::from(raw.root_dir),
            log_tail_lines: raw.log_tail_lines,
            pidfile_timeout: Duration::from_millis(raw.pidfile_timeout_ms),
        })
    }
}

fn non_empty_path(
    value: Option<String>,
    field: &'static str,
) -> Result<Option<PathBuf>, HardValidationError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(HardValidationError::InvalidFieldValue {
            field,
            value: v,
            reason: "Path cannot be empty".to_string(),
        }),
        Some(v) => Ok(Some(PathBuf::from(v))),
        None => Ok(None),
    }
}
