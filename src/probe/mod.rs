//! Probe module for network monitoring.
//!
//! Supports ICMP ping, DNS resolution and traceroute probes, plus the
//! anchor-based pacing shared by the periodic producers.

mod dns;
mod pacer;
mod ping;
mod traceroute;

pub use dns::*;
pub use pacer::*;
pub use ping::*;
pub use traceroute::*;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Outcome of one ping, as consumed by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    pub target: String,
    pub time: DateTime<Utc>,
    pub success: bool,
    pub rtt_ms: f64,
}

/// Outcome of one DNS query. DNS health is host-wide, so no target.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsResult {
    pub time: DateTime<Utc>,
    pub success: bool,
}
