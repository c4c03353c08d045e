//! Error types for the wcap tunnel.

use std::io;

use thiserror::Error;

/// Main error type for wcap operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("interface directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Whether this error stems from what the operator asked for (bad config,
    /// unknown interface) rather than from the system refusing a request.
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Provision(ProvisionError::NotFound { .. })
        )
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("relay.port must be greater than 0")]
    ZeroPort,

    #[error("relay.poll_timeout_secs must be greater than 0")]
    ZeroPollTimeout,

    #[error("relay.max_frame_size must be at least {min} (got {size})")]
    FrameSizeTooSmall { size: usize, min: usize },

    #[error("relay.prefix_len must be between 1 and 32 (got {len})")]
    InvalidPrefixLength { len: u8 },

    #[error("{role} interface name cannot be empty")]
    EmptyInterfaceName { role: &'static str },

    #[error("{role} interface name {name:?} is longer than {max} bytes")]
    InterfaceNameTooLong {
        role: &'static str,
        name: String,
        max: usize,
    },
}

/// Failures reported by the interface directory (route netlink / nl80211).
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to connect {channel} control channel: {message}")]
    Connect {
        channel: &'static str,
        message: String,
    },

    #[error("{op}: no such device or address")]
    NotFound { op: &'static str },

    #[error("{op}: already exists")]
    AlreadyExists { op: &'static str },

    #[error("{op}: kernel rejected request: {source}")]
    Kernel {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op}: netlink transport failure: {message}")]
    Transport { op: &'static str, message: String },

    #[error("reply is missing attribute {attribute}")]
    MissingAttribute { attribute: &'static str },

    #[error("attribute {attribute} is malformed ({len} bytes)")]
    MalformedAttribute { attribute: &'static str, len: usize },
}

impl DirectoryError {
    /// Map a kernel errno (positive) returned for `op` to a directory error.
    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        match errno {
            libc::ENODEV | libc::ENOENT | libc::EADDRNOTAVAIL => Self::NotFound { op },
            libc::EEXIST => Self::AlreadyExists { op },
            _ => Self::Kernel {
                op,
                source: io::Error::from_raw_os_error(errno),
            },
        }
    }

    pub fn transport(op: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            op,
            message: message.into(),
        }
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Monitor and transport provisioning failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("interface {name:?} not found: {source}")]
    NotFound {
        name: String,
        #[source]
        source: DirectoryError,
    },

    #[error("failed to provision monitor interface {name:?}: {source}")]
    ProvisionFailed {
        name: String,
        #[source]
        source: DirectoryError,
    },

    #[error("failed to bring up interface {name:?}: {source}")]
    ActivationFailed {
        name: String,
        #[source]
        source: DirectoryError,
    },
}

/// Socket fabric failures.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to open {kind} socket: {source}")]
    OpenFailed {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {kind} socket to {target}: {source}")]
    BindFailed {
        kind: &'static str,
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Which relay descriptor a condition was reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Link,
    Udp,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Link => f.write_str("raw link"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Fatal relay loop conditions.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("multiplexed wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("{endpoint} descriptor reported an error condition")]
    Descriptor { endpoint: Endpoint },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_map_missing_device_errno_to_not_found() {
        assert!(DirectoryError::from_errno("get link", libc::ENODEV).is_not_found());
        assert!(DirectoryError::from_errno("del addr", libc::EADDRNOTAVAIL).is_not_found());
        assert!(matches!(
            DirectoryError::from_errno("new addr", libc::EEXIST),
            DirectoryError::AlreadyExists { op: "new addr" }
        ));
        assert!(matches!(
            DirectoryError::from_errno("set link", libc::EPERM),
            DirectoryError::Kernel { .. }
        ));
    }

    #[test]
    fn should_classify_unknown_interface_as_configuration_error() {
        let err: Error = ProvisionError::NotFound {
            name: "wlan9".into(),
            source: DirectoryError::NotFound { op: "get link" },
        }
        .into();
        assert!(err.is_configuration());

        let err: Error = RelayError::Descriptor {
            endpoint: Endpoint::Udp,
        }
        .into();
        assert!(!err.is_configuration());
    }
}
