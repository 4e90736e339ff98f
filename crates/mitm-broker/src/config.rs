//! Broker configuration

use std::time::Duration;

use mitm_core::env::{env_get, env_get_ms};
use mitm_runtime::ConfigError;

pub mod defaults {
    /// Bound on one interception query.
    pub const QUERY_TIMEOUT_MS: u64 = 100;
    /// Largest session count a registration may ask for.
    pub const MAX_SESSIONS: u32 = 64;
    /// Bound on one relayed request/reply with the original service.
    pub const FORWARD_TIMEOUT_MS: u64 = 5_000;
    /// Per-registration limit of remembered per-process decisions.
    pub const DECISION_CACHE: usize = 256;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub query_timeout: Duration,
    pub max_sessions: u32,
    pub forward_timeout: Duration,
    pub decision_cache: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BrokerConfig {
    /// - `MITM_QUERY_TIMEOUT_MS`
    /// - `MITM_MAX_SESSIONS`
    /// - `MITM_FORWARD_TIMEOUT_MS`
    /// - `MITM_DECISION_CACHE`
    pub fn from_env() -> Self {
        Self {
            query_timeout: env_get_ms(
                "MITM_QUERY_TIMEOUT_MS",
                Duration::from_millis(defaults::QUERY_TIMEOUT_MS),
            ),
            max_sessions: env_get("MITM_MAX_SESSIONS", defaults::MAX_SESSIONS),
            forward_timeout: env_get_ms(
                "MITM_FORWARD_TIMEOUT_MS",
                Duration::from_millis(defaults::FORWARD_TIMEOUT_MS),
            ),
            decision_cache: env_get("MITM_DECISION_CACHE", defaults::DECISION_CACHE),
        }
    }

    pub fn new() -> Self {
        Self {
            query_timeout: Duration::from_millis(defaults::QUERY_TIMEOUT_MS),
            max_sessions: defaults::MAX_SESSIONS,
            forward_timeout: Duration::from_millis(defaults::FORWARD_TIMEOUT_MS),
            decision_cache: defaults::DECISION_CACHE,
        }
    }

    pub fn query_timeout(mut self, d: Duration) -> Self {
        self.query_timeout = d;
        self
    }

    pub fn max_sessions(mut self, n: u32) -> Self {
        self.max_sessions = n;
        self
    }

    pub fn forward_timeout(mut self, d: Duration) -> Self {
        self.forward_timeout = d;
        self
    }

    pub fn decision_cache(mut self, n: usize) -> Self {
        self.decision_cache = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("query_timeout must be > 0"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidValue("max_sessions must be > 0"));
        }
        if self.forward_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("forward_timeout must be > 0"));
        }
        if self.decision_cache == 0 {
            return Err(ConfigError::InvalidValue("decision_cache must be > 0"));
        }
        Ok(())
    }

    pub fn print(&self) {
        eprintln!("Service broker configuration:");
        eprintln!("  query_timeout:    {:?}", self.query_timeout);
        eprintln!("  max_sessions:     {}", self.max_sessions);
        eprintln!("  forward_timeout:  {:?}", self.forward_timeout);
        eprintln!("  decision_cache:   {}", self.decision_cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::new();
        assert_eq!(config.query_timeout, Duration::from_millis(100));
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.forward_timeout, Duration::from_secs(5));
        assert_eq!(config.decision_cache, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(BrokerConfig::new()
            .query_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BrokerConfig::new().max_sessions(0).validate().is_err());
        assert!(BrokerConfig::new()
            .forward_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BrokerConfig::new().decision_cache(0).validate().is_err());
    }
}
