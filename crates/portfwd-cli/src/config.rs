//! Settings: TOML file + CLI overrides.
//!
//! ```toml
//! [forward]
//! local_address = "0.0.0.0"
//! udp_idle_timeout = 30     # seconds
//! udp_sweep_interval = 5
//! tcp_connect_timeout = 10
//! shutdown_grace = 3
//! ```

use anyhow::{bail, Context, Result};
use portfwd_core::config::{
    DEFAULT_SHUTDOWN_GRACE, DEFAULT_TCP_CONNECT_TIMEOUT, DEFAULT_UDP_IDLE_TIMEOUT,
    DEFAULT_UDP_SWEEP_INTERVAL,
};
use portfwd_core::ForwardConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub forward: ForwardSection,
}

/// `[forward]` section of the config TOML. Durations are whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardSection {
    #[serde(default = "default_local_address")]
    pub local_address: IpAddr,
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout: u64,
    #[serde(default = "default_udp_sweep_interval")]
    pub udp_sweep_interval: u64,
    #[serde(default = "default_tcp_connect_timeout")]
    pub tcp_connect_timeout: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            local_address: default_local_address(),
            udp_idle_timeout: default_udp_idle_timeout(),
            udp_sweep_interval: default_udp_sweep_interval(),
            tcp_connect_timeout: default_tcp_connect_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_local_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_udp_idle_timeout() -> u64 {
    DEFAULT_UDP_IDLE_TIMEOUT.as_secs()
}
fn default_udp_sweep_interval() -> u64 {
    DEFAULT_UDP_SWEEP_INTERVAL.as_secs()
}
fn default_tcp_connect_timeout() -> u64 {
    DEFAULT_TCP_CONNECT_TIMEOUT.as_secs()
}
fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE.as_secs()
}

/// Values supplied on the command line; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub local_address: Option<IpAddr>,
    pub udp_idle_timeout: Option<u64>,
    pub shutdown_grace: Option<u64>,
    pub tcp_connect_timeout: Option<u64>,
}

/// Resolved settings (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct Settings {
    pub local_address: IpAddr,
    pub forward: ForwardConfig,
}

impl Settings {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read config {}", expanded.display()))?;
                    toml::from_str::<ConfigFile>(&content)
                        .with_context(|| format!("config parse error in {}", expanded.display()))?
                } else {
                    debug!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let section = file_config.forward;
        let local_address = overrides.local_address.unwrap_or(section.local_address);
        let idle = overrides.udp_idle_timeout.unwrap_or(section.udp_idle_timeout);
        let grace = overrides.shutdown_grace.unwrap_or(section.shutdown_grace);
        let connect = overrides.tcp_connect_timeout.unwrap_or(section.tcp_connect_timeout);
        let sweep = section.udp_sweep_interval;

        if idle == 0 {
            bail!("udp_idle_timeout must be at least 1 second");
        }
        if sweep == 0 {
            bail!("udp_sweep_interval must be at least 1 second");
        }
        if connect == 0 {
            bail!("tcp_connect_timeout must be at least 1 second");
        }

        Ok(Self {
            local_address,
            forward: ForwardConfig {
                udp_idle_timeout: Duration::from_secs(idle),
                // Sweeping less often than the timeout would let sessions
                // outlive it by up to a full interval.
                udp_sweep_interval: Duration::from_secs(sweep.min(idle)),
                tcp_connect_timeout: Duration::from_secs(connect),
                shutdown_grace: Duration::from_secs(grace),
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
