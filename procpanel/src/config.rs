use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::signal::Signal;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/procpanel/procpanel.toml";
pub const CONFIG_ENV: &str = "PROCPANEL_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub query: QueryConfig,
    pub collector: CollectorConfig,
    pub signals: SignalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Window for sampled CPU usage. 0 reports the lifetime average instead
    /// and avoids sleeping during collection.
    pub cpu_sample_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal sent by `kill`. SIGKILL unless set to e.g. `"SIGTERM"`.
    pub kill_signal: Signal,
    /// Refuse terminating signals aimed at this service's own pid.
    pub protect_self: bool,
    /// Pids refused in addition to pid 1.
    pub protected_pids: Vec<u32>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            kill_signal: Signal::Kill,
            protect_self: true,
            protected_pids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Write dispatch outcomes to the `procpanel_audit` log target.
    pub audit: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            audit: true,
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let cfg = Self::from_toml(&content)?;
        log::debug!("[config] loaded {}", path.display());
        Ok(cfg)
    }

    /// Explicit path, then `PROCPANEL_CONFIG`, then the system-wide file if
    /// it exists, then built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV)
            && !path.trim().is_empty()
        {
            return Self::load(&PathBuf::from(path));
        }
        let system = Path::new(DEFAULT_CONFIG_PATH);
        if system.exists() {
            return Self::load(system);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.max_page_size == 0 {
            return Err(Error::Config(
                "query.max_page_size must be at least 1".to_string(),
            ));
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_page_size {
            return Err(Error::Config(format!(
                "query.default_limit must be within [1, {}]",
                self.query.max_page_size
            )));
        }
        Ok(())
    }
}
