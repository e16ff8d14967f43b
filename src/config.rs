use crate::signals::parse_signal;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Progress ticks faster than this only burn CPU.
pub const MAX_TICK_HZ: u32 = 1000;

/// Top-level configuration loaded from flasher.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct FlasherConfig {
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Working directory for launched tools; relative paths resolve against
    /// the installation root.
    pub tools_dir: PathBuf,
    pub default_timeout_secs: f64,
    /// Progress tick rate.
    pub tick_hz: u32,
    pub kill_signal: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tools_dir: PathBuf::from("tools"),
            default_timeout_secs: 1.0,
            tick_hz: 60,
            kill_signal: "SIGTERM".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secs = self.default_timeout_secs;
        if !(secs.is_finite() && secs > 0.0) || Duration::try_from_secs_f64(secs).is_err() {
            return Err(ConfigError::Invalid {
                field: "runner.default_timeout_secs",
                reason: format!("must be a positive, representable number of seconds, got {secs}"),
            });
        }
        if !(1..=MAX_TICK_HZ).contains(&self.tick_hz) {
            return Err(ConfigError::Invalid {
                field: "runner.tick_hz",
                reason: format!("must be between 1 and {MAX_TICK_HZ}, got {}", self.tick_hz),
            });
        }
        self.kill_signal()?;
        Ok(())
    }

    pub fn kill_signal(&self) -> Result<Signal, ConfigError> {
        parse_signal(&self.kill_signal).map_err(|reason| ConfigError::Invalid {
            field: "runner.kill_signal",
            reason,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.clamp(1, MAX_TICK_HZ)))
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Load and validate config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<FlasherConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(FlasherConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> Result<FlasherConfig, ConfigError> {
    let config: FlasherConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.runner.validate()?;
    Ok(config)
}
