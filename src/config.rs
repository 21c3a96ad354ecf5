use std::time::Duration;

use thiserror::Error;

use crate::protocol::METADATA_READ_TIMEOUT;

/// Timing and threshold knobs of the peer health state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHealthConfig {
    /// A peer not seen for this long is evicted regardless of its failure count.
    pub stale_peer_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_failed_attempts: u32,
    pub backoff_base: Duration,
    /// Ceiling applied to the exponential retry delay.
    pub max_backoff: Duration,
    pub metadata_timeout: Duration,
    /// Descriptors older than this are treated as absent.
    pub max_metadata_age: Duration,
    /// How long a removed peer stays tombstoned before it may be rediscovered.
    pub removal_cooldown: Duration,
}

impl Default for PeerHealthConfig {
    fn default() -> Self {
        Self {
            stale_peer_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            max_failed_attempts: 3,
            backoff_base: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            metadata_timeout: METADATA_READ_TIMEOUT,
            max_metadata_age: Duration::from_secs(3600),
            removal_cooldown: Duration::from_secs(60),
        }
    }
}

/// Node configuration, fixed before `start` and never reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub discovery_interval: Duration,
    pub advertising_interval: Duration,
    pub metadata_update_interval: Duration,
    pub peer_health: PeerHealthConfig,
    /// Maximum number of providers taken from one DHT lookup.
    pub discovery_limit: usize,
    /// Pause before contacting a freshly found provider.
    pub discovery_grace: Duration,
    pub nat_log_interval: Duration,
    pub stats_log_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(10),
            advertising_interval: Duration::from_secs(10),
            metadata_update_interval: Duration::from_secs(30),
            peer_health: PeerHealthConfig::default(),
            discovery_limit: 10,
            discovery_grace: Duration::from_millis(100),
            nat_log_interval: Duration::from_secs(30),
            stats_log_interval: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Short intervals for local meshes and tests.
    pub fn short_intervals() -> Self {
        Self {
            discovery_interval: Duration::from_secs(2),
            advertising_interval: Duration::from_secs(5),
            metadata_update_interval: Duration::from_secs(5),
            peer_health: PeerHealthConfig {
                stale_peer_timeout: Duration::from_secs(30),
                health_check_interval: Duration::from_secs(5),
                max_failed_attempts: 2,
                backoff_base: Duration::from_secs(5),
                max_backoff: Duration::from_secs(30),
                metadata_timeout: Duration::from_secs(2),
                max_metadata_age: Duration::from_secs(30),
                removal_cooldown: Duration::from_secs(10),
            },
            nat_log_interval: Duration::from_secs(10),
            stats_log_interval: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("discovery_interval", self.discovery_interval),
            ("advertising_interval", self.advertising_interval),
            ("metadata_update_interval", self.metadata_update_interval),
            (
                "health_check_interval",
                self.peer_health.health_check_interval,
            ),
            ("nat_log_interval", self.nat_log_interval),
            ("stats_log_interval", self.stats_log_interval),
            ("metadata_timeout", self.peer_health.metadata_timeout),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroPeriod(*name));
        }
        if self.peer_health.max_failed_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.peer_health.max_backoff < self.peer_health.backoff_base {
            return Err(ConfigError::BackoffCeiling);
        }
        if self.discovery_limit == 0 {
            return Err(ConfigError::NoDiscoveryLimit);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroPeriod(&'static str),
    #[error("max_failed_attempts must be at least 1")]
    NoAttempts,
    #[error("max_backoff must not be below backoff_base")]
    BackoffCeiling,
    #[error("discovery_limit must be at least 1")]
    NoDiscoveryLimit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
        assert_eq!(Config::short_intervals().validate(), Ok(()));
    }

    #[test]
    fn short_intervals_keep_discovery_bounds() {
        let config = Config::short_intervals();
        assert_eq!(config.discovery_limit, 10);
        assert_eq!(config.discovery_grace, Duration::from_millis(100));
        assert!(config.discovery_interval < Config::default().discovery_interval);
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut config = Config::default();
        config.peer_health.health_check_interval = Duration::ZERO;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroPeriod("health_check_interval"))
        );
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let mut config = Config::default();
        config.peer_health.max_backoff = Duration::from_secs(1);
        assert_eq!(config.validate(), Err(ConfigError::BackoffCeiling));
    }
}
