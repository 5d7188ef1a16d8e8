//! Configuration types for the PAC proxy.

mod listen;
mod scripting;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use listen::ListenConfig;
pub use scripting::ScriptConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    pub script: ScriptConfig,
}

impl Config {
    /// Configuration for `script_path` with every other setting defaulted.
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            listen: ListenConfig::default(),
            script: ScriptConfig::new(script_path),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.script.path.as_os_str().is_empty() {
            anyhow::bail!("'script.path' must name the routing script");
        }
        if self.script.reload_interval_ms == 0 {
            anyhow::bail!("'script.reload_interval_ms' must be greater than zero");
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Socket address the proxy listens on.
    pub fn listen_addr(&self) -> Result<SocketAddr, anyhow::Error> {
        let host = self
            .listen
            .host
            .trim_start_matches('[')
            .trim_end_matches(']');
        let ip = host
            .parse()
            .with_context(|| format!("'listen.host' is not an IP address: {}", self.listen.host))?;
        Ok(SocketAddr::new(ip, self.listen.port))
    }
}
