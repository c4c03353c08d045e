//! Metrics initialization for Prometheus exporter.
//!
//! Counters recorded by the relay:
//! - `wcap_frames_total{direction}` / `wcap_bytes_total{direction}`
//! - `wcap_frames_dropped_total{reason}`
//! - `wcap_io_errors_total{op}`
//! - `wcap_peer_changes_total`

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Direction of a forwarded unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Raw link to UDP peer.
    Uplink,
    /// UDP peer to raw link.
    Downlink,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uplink => "uplink",
            Self::Downlink => "downlink",
        }
    }
}

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape.
///
/// When metrics are disabled, this is a no-op. The `metrics` crate
/// handles unregistered metrics gracefully (they become no-ops).
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| Error::Metrics(e.to_string()))?;

    Ok(())
}

pub fn record_forwarded(direction: Direction, bytes: usize) {
    counter!("wcap_frames_total", "direction" => direction.as_str()).increment(1);
    counter!("wcap_bytes_total", "direction" => direction.as_str()).increment(bytes as u64);
}

pub fn record_dropped(reason: &'static str) {
    counter!("wcap_frames_dropped_total", "reason" => reason).increment(1);
}

pub fn record_io_error(op: &'static str) {
    counter!("wcap_io_errors_total", "op" => op).increment(1);
}

pub fn record_peer_change() {
    counter!("wcap_peer_changes_total").increment(1);
}
