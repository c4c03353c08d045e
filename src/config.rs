//! Configuration loading and validation.
//!
//! Everything the command line does not carry lives in an optional TOML
//! file. All sections and keys are optional; an empty file yields the
//! defaults the tunnel protocol expects (port 8888, 10 s poll timeout,
//! 8 KiB frames, /16 link-local prefix).

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// UDP port shared by both ends of the tunnel.
pub const DEFAULT_PORT: u16 = 8888;

/// Smallest frame buffer accepted; anything below cannot hold a radiotap
/// header plus an 802.11 MAC header.
pub const MIN_FRAME_SIZE: usize = 256;

/// Longest interface name the kernel accepts (`IF_NAMESIZE` minus the NUL).
pub const MAX_INTERFACE_NAME: usize = libc::IF_NAMESIZE - 1;

/// Main configuration for the tunnel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relay tunables.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Monitor interface lifecycle.
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Relay and transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySettings {
    /// UDP port, used both locally and for the peer.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on a single multiplexed wait, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Largest frame read from either descriptor. Longer frames are truncated.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Prefix length of the provisioned link-local address.
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
}

impl RelaySettings {
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            poll_timeout_secs: default_poll_timeout(),
            max_frame_size: default_max_frame_size(),
            prefix_len: default_prefix_len(),
        }
    }
}

/// Monitor interface settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    /// Delete the monitor interface on exit, but only if this run created it.
    #[serde(default)]
    pub remove_on_exit: bool,
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_poll_timeout() -> u64 {
    10
}

const fn default_max_frame_size() -> usize {
    8192
}

const fn default_prefix_len() -> u8 {
    16
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9100))
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<()> {
        let relay = &self.relay;

        if relay.port == 0 {
            return Err(ConfigError::from(ValidationError::ZeroPort).into());
        }

        if relay.poll_timeout_secs == 0 {
            return Err(ConfigError::from(ValidationError::ZeroPollTimeout).into());
        }

        if relay.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::from(ValidationError::FrameSizeTooSmall {
                size: relay.max_frame_size,
                min: MIN_FRAME_SIZE,
            })
            .into());
        }

        if !(1..=32).contains(&relay.prefix_len) {
            return Err(ConfigError::from(ValidationError::InvalidPrefixLength {
                len: relay.prefix_len,
            })
            .into());
        }

        Ok(())
    }
}

/// Check an interface name given on the command line.
pub fn validate_interface_name(role: &'static str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ConfigError::from(ValidationError::EmptyInterfaceName { role }).into());
    }
    if name.len() > MAX_INTERFACE_NAME {
        return Err(ConfigError::from(ValidationError::InterfaceNameTooLong {
            role,
            name: name.to_owned(),
            max: MAX_INTERFACE_NAME,
        })
        .into());
    }
    Ok(())
}
