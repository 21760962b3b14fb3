use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::tunnel::DEFAULT_BUFFER_SIZE;

/// Upper bound for `update_frequency_hours`, one year.
pub const MAX_UPDATE_FREQUENCY_HOURS: u64 = 24 * 365;

pub const DEFAULT_BLOCKLIST_URL: &str =
    "https://raw.githubusercontent.com/gfwlist/gfwlist/master/gfwlist.txt";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub socks5_addr: String,
    pub update_frequency_hours: u64,
    pub blocklist_url: String,
    pub blocklist_cache: PathBuf,
    pub custom_domains: PathBuf,
    /// Seconds between stats log lines, 0 disables.
    pub stats_interval: u64,
    pub buffer_size: usize,
    /// Seconds allowed for an outbound connect, SOCKS5 handshake included.
    pub connect_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8118".to_string(),
            socks5_addr: "127.0.0.1:1080".to_string(),
            update_frequency_hours: 24,
            blocklist_url: DEFAULT_BLOCKLIST_URL.to_string(),
            blocklist_cache: PathBuf::from("gfwlist.txt"),
            custom_domains: PathBuf::from("domain.txt"),
            stats_interval: 60,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: 10,
        }
    }
}

impl Config {
    /// Reads `path` over the defaults. A missing file is fine, a malformed
    /// one is not.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{:?} not found, using default settings", path);
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path))
            }
        };

        let config = Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_socket_addr()?;

        if self.socks5_addr.trim().is_empty() {
            anyhow::bail!("socks5_addr must not be empty");
        }
        if self.update_frequency_hours == 0 {
            anyhow::bail!("update_frequency_hours must be at least 1");
        }
        if self.update_frequency_hours > MAX_UPDATE_FREQUENCY_HOURS {
            anyhow::bail!(
                "update_frequency_hours must be at most {}",
                MAX_UPDATE_FREQUENCY_HOURS
            );
        }
        if self.connect_timeout == 0 {
            anyhow::bail!("connect_timeout must be at least 1 second");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be positive");
        }

        Ok(())
    }

    /// Listen address; `:8118` is read as `0.0.0.0:8118`.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.listen_addr.trim();
        let addr = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };

        addr.parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {:?}", self.listen_addr))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.update_frequency_hours.saturating_mul(3600))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
