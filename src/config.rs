//! Configuration module for EdgeProbe.
//!
//! Loads a TOML configuration file, applies environment overrides and
//! validates every field, reporting all problems at once.

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgeprobe/config.toml";

/// Upper bound for the detector window and the traceroute cooldown (7 days).
pub const MAX_SPAN_SECS: i64 = 7 * 24 * 3600;
/// Upper bound for probe intervals and timeouts (1 day).
pub const MAX_PERIOD_MS: i64 = 24 * 3600 * 1000;
pub const MAX_HOPS: i64 = 255;
pub const MAX_HOP_TIMEOUT_MS: i64 = 60_000;
pub const MAX_LOG_MB: i64 = 1024 * 1024;
pub const MAX_LOG_FILES: i64 = 1000;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("decode config: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("{}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Full monitor configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub ping: PingConfig,
    pub dns: DnsConfig,
    pub traceroute: TracerouteConfig,
    pub targets: Vec<TargetConfig>,
}

/// Record sink location and rotation limits.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub max_mb: i64,
    pub max_files: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub interval_ms: i64,
    pub timeout_ms: i64,
    /// Sliding window used by the outage detector.
    pub window_secs: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub interval_ms: i64,
    pub timeout_ms: i64,
    pub queries: Vec<String>,
    pub resolvers: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TracerouteConfig {
    pub cooldown_secs: i64,
    pub max_hops: i64,
    /// Per-hop wait.
    pub timeout_ms: i64,
}

/// A monitored target: `name` labels records, `host` is what gets probed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: String,
    pub host: String,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables:
    /// - `EDGEPROBE_LOG_DIR`: overrides `logging.dir`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut cfg = Self::parse(&contents)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Decode configuration text without validating it.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("EDGEPROBE_LOG_DIR") {
            if !dir.trim().is_empty() {
                self.logging.dir = dir;
            }
        }
    }

    /// Check every field, collecting all failures into one error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();

        if self.logging.dir.trim().is_empty() {
            errs.push("logging.dir is required".to_string());
        }
        require_range(&mut errs, "logging.max_mb", self.logging.max_mb, MAX_LOG_MB);
        require_range(&mut errs, "logging.max_files", self.logging.max_files, MAX_LOG_FILES);

        require_range(&mut errs, "ping.interval_ms", self.ping.interval_ms, MAX_PERIOD_MS);
        require_range(&mut errs, "ping.timeout_ms", self.ping.timeout_ms, MAX_PERIOD_MS);
        require_range(&mut errs, "ping.window_secs", self.ping.window_secs, MAX_SPAN_SECS);

        require_range(&mut errs, "dns.interval_ms", self.dns.interval_ms, MAX_PERIOD_MS);
        require_range(&mut errs, "dns.timeout_ms", self.dns.timeout_ms, MAX_PERIOD_MS);
        if self.dns.queries.is_empty() {
            errs.push("dns.queries must not be empty".to_string());
        }
        if self.dns.resolvers.is_empty() {
            errs.push("dns.resolvers must not be empty".to_string());
        }
        if self.dns.queries.iter().any(|q| q.trim().is_empty()) {
            errs.push("dns.queries must not contain blank names".to_string());
        }
        if self.dns.resolvers.iter().any(|r| r.trim().is_empty()) {
            errs.push("dns.resolvers must not contain blank addresses".to_string());
        }

        require_range(&mut errs, "traceroute.cooldown_secs", self.traceroute.cooldown_secs, MAX_SPAN_SECS);
        require_range(&mut errs, "traceroute.max_hops", self.traceroute.max_hops, MAX_HOPS);
        require_range(&mut errs, "traceroute.timeout_ms", self.traceroute.timeout_ms, MAX_HOP_TIMEOUT_MS);

        if self.targets.is_empty() {
            errs.push("targets must not be empty".to_string());
        }
        let mut names = HashSet::new();
        for (i, t) in self.targets.iter().enumerate() {
            if t.name.trim().is_empty() {
                errs.push(format!("targets[{}].name is required", i));
            } else if !names.insert(t.name.trim()) {
                errs.push(format!("targets[{}].name {:?} is already used", i, t.name));
            }
            if t.host.trim().is_empty() {
                errs.push(format!("targets[{}].host is required", i));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errs))
        }
    }
}

fn require_range(errs: &mut Vec<String>, field: &str, value: i64, max: i64) {
    if value <= 0 {
        errs.push(format!("{} must be > 0", field));
    } else if value > max {
        errs.push(format!("{} must be <= {}", field, max));
    }
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

impl PingConfig {
    pub fn interval(&self) -> Duration {
        millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.clamp(0, MAX_SPAN_SECS))
    }
}

impl DnsConfig {
    pub fn interval(&self) -> Duration {
        millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }
}

impl TracerouteConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs.clamp(0, MAX_SPAN_SECS))
    }

    pub fn hop_timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops.clamp(0, u32::MAX as i64) as u32
    }
}

impl LoggingConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_mb.max(0) as u64 * 1024 * 1024
    }

    pub fn max_files(&self) -> usize {
        self.max_files.max(0) as usize
    }
}
