//! Agent configuration.
//!
//! Loaded from a TOML file or assembled from defaults plus `NATLINK_*`
//! environment overrides; always validated before use.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Tunables for the binding agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Log level used when the embedding process initializes tracing.
    pub log_level: String,
    /// How long to wait for a STUN/TURN response before retransmitting.
    pub response_timeout_ms: u64,
    /// Attempt ceiling for discovery, keepalive, and refresh transactions.
    pub discovery_max_attempts: u32,
    /// Attempt ceiling for probes; small so racing candidates fail fast.
    pub probe_max_attempts: u32,
    /// Allocation lifetime requested from TURN servers, in seconds.
    pub turn_lifetime_secs: u32,
    /// Safety margin subtracted from the allocation lifetime when
    /// scheduling a refresh.
    pub turn_refresh_margin_secs: u32,
    /// How long a learned external binding stays valid without refresh.
    pub external_binding_ttl_secs: u64,
    /// Cadence of the expired-external-binding sweep.
    pub sweep_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            response_timeout_ms: 500,
            discovery_max_attempts: 30,
            probe_max_attempts: 3,
            turn_lifetime_secs: 600,
            turn_refresh_margin_secs: 60,
            external_binding_ttl_secs: 60,
            sweep_interval_secs: 15,
        }
    }
}

impl AgentConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg: Self =
            toml::from_str(&data).map_err(|e| Error::config(format!("toml parse error: {e}")))?;
        cfg.validate()?;
        tracing::debug!(path = %path.as_ref().display(), "agent configuration loaded");
        Ok(cfg)
    }

    /// Build a configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("NATLINK_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = std::env::var("NATLINK_RESPONSE_TIMEOUT_MS") {
            cfg.response_timeout_ms = v
                .parse()
                .map_err(|_| Error::config(format!("invalid NATLINK_RESPONSE_TIMEOUT_MS: {v}")))?;
        }
        if let Ok(v) = std::env::var("NATLINK_PROBE_MAX_ATTEMPTS") {
            cfg.probe_max_attempts = v
                .parse()
                .map_err(|_| Error::config(format!("invalid NATLINK_PROBE_MAX_ATTEMPTS: {v}")))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would stall or never retry.
    pub fn validate(&self) -> Result<()> {
        let allowed = ["trace", "debug", "info", "warn", "error"];
        if !allowed.contains(&self.log_level.as_str()) {
            return Err(Error::config(format!("invalid log_level: {}", self.log_level)));
        }
        if self.response_timeout_ms == 0 {
            return Err(Error::config("response_timeout_ms must be positive"));
        }
        if self.probe_max_attempts == 0 || self.discovery_max_attempts == 0 {
            return Err(Error::config("attempt ceilings must be positive"));
        }
        if self.turn_refresh_margin_secs >= self.turn_lifetime_secs {
            return Err(Error::config(
                "turn_refresh_margin_secs must be below turn_lifetime_secs",
            ));
        }
        if self.external_binding_ttl_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(Error::config("external binding ttl and sweep must be positive"));
        }
        Ok(())
    }

    /// Response timeout as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// External binding lifetime as a [`Duration`].
    pub fn external_binding_ttl(&self) -> Duration {
        Duration::from_secs(self.external_binding_ttl_secs)
    }

    /// Sweep cadence as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Delay until the next TURN refresh for an allocation with the given
    /// granted lifetime, honoring an optional caller-requested cadence.
    pub fn refresh_delay(&self, lifetime_secs: u32, keepalive: Option<Duration>) -> Duration {
        let secs = lifetime_secs.saturating_sub(self.turn_refresh_margin_secs).max(1);
        let base = Duration::from_secs(u64::from(secs));
        match keepalive {
            Some(k) if k < base => k,
            _ => base,
        }
    }
}
