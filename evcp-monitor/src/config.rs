//! Configuration for the charging point monitor
//!
//! Groups the settings for each collaborator: the local engine, the central
//! controller, the credential registry, and the two loops the monitor runs.

use std::path::PathBuf;
use std::time::Duration;

use evcp_core::RetryPolicy;

use crate::error::MonitorError;

/// Complete monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Charging point identity, e.g. `CP-001`
    pub cp_id: String,

    pub engine: EngineConfig,
    pub controller: ControllerConfig,
    pub registry: RegistryConfig,
    pub health: HealthConfig,
    pub charging: ChargingConfig,

    /// Directory holding the credential cache
    pub cache_dir: PathBuf,
}

/// Local engine link
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    /// Explicit port; derived from `base_port + cp_number` when unset
    pub port: Option<u16>,
    pub base_port: u16,
    pub retry: RetryPolicy,
}

/// Central controller link
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    pub retry: RetryPolicy,
    /// How long to wait for AUTHENTICATED/DENY
    pub auth_timeout: Duration,
}

/// Credential registry service
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub price_per_kwh: f64,
}

/// Engine heartbeat loop
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub reply_timeout: Duration,
    pub failure_threshold: u32,
}

/// Simulated charging sessions
#[derive(Debug, Clone)]
pub struct ChargingConfig {
    /// Time for a session to go from 0 to 100 %
    pub duration: Duration,
    /// Progress task period
    pub tick: Duration,
    pub target_kwh: f64,
    /// Ticks between "please unplug" reminders once complete
    pub reminder_every: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cp_id: "CP-001".to_string(),
            engine: EngineConfig::default(),
            controller: ControllerConfig::default(),
            registry: RegistryConfig::default(),
            health: HealthConfig::default(),
            charging: ChargingConfig::default(),
            cache_dir: PathBuf::from("data"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            base_port: 6000,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            retry: RetryPolicy::default(),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5001".to_string(),
            request_timeout: Duration::from_secs(10),
            price_per_kwh: 0.30,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(14),
            tick: Duration::from_secs(2),
            target_kwh: 10.0,
            reminder_every: 5,
        }
    }
}

impl ChargingConfig {
    /// Smallest progress step worth publishing: the share of the session one
    /// tick represents (2 s of 14 s -> 14 %), at least 1 %.
    pub fn reporting_quantum(&self) -> u8 {
        let duration = self.duration.as_secs_f64();
        if duration <= 0.0 {
            return 1;
        }
        let quantum = (self.tick.as_secs_f64() / duration * 100.0).floor();
        quantum.clamp(1.0, 100.0) as u8
    }
}

impl MonitorConfig {
    /// Create config for a charging point with default endpoints
    pub fn new(cp_id: impl Into<String>) -> Self {
        Self {
            cp_id: cp_id.into(),
            ..Default::default()
        }
    }

    /// Numeric suffix of the CP id (`CP-007` -> 7)
    pub fn cp_number(&self) -> Option<u32> {
        cp_number(&self.cp_id)
    }

    /// Engine port: explicit, or `base_port + cp_number`
    pub fn engine_port(&self) -> Result<u16, MonitorError> {
        if let Some(port) = self.engine.port {
            return Ok(port);
        }
        let number = self.cp_number().ok_or_else(|| {
            MonitorError::Config(format!(
                "cannot derive engine port from CP id {:?}, pass one explicitly",
                self.cp_id
            ))
        })?;
        u16::try_from(u32::from(self.engine.base_port) + number).map_err(|_| {
            MonitorError::Config(format!(
                "engine port {} + {} out of range",
                self.engine.base_port, number
            ))
        })
    }

    /// Set controller endpoint
    pub fn with_controller(mut self, host: impl Into<String>, port: u16) -> Self {
        self.controller.host = host.into();
        self.controller.port = port;
        self
    }

    /// Set engine host and optional explicit port
    pub fn with_engine(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.engine.host = host.into();
        self.engine.port = port;
        self
    }

    /// Set registry base URL
    pub fn with_registry(mut self, url: impl Into<String>) -> Self {
        self.registry.url = url.into();
        self
    }

    /// Set credential cache directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Use the same retry policy for both links
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.engine.retry = retry;
        self.controller.retry = retry;
        self
    }

    /// Set heartbeat timings
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Set charging simulation timings
    pub fn with_charging(mut self, charging: ChargingConfig) -> Self {
        self.charging = charging;
        self
    }
}

/// Parse the number after the last `-` of a CP id
pub fn cp_number(cp_id: &str) -> Option<u32> {
    cp_id.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MonitorConfig::new("CP-003")
            .with_controller("central", 5500)
            .with_engine("engine-3", None)
            .with_registry("http://registry:5001")
            .with_retry(RetryPolicy::new(2, Duration::from_millis(50)));

        assert_eq!(config.cp_id, "CP-003");
        assert_eq!(config.controller.host, "central");
        assert_eq!(config.controller.port, 5500);
        assert_eq!(config.engine.host, "engine-3");
        assert_eq!(config.engine.retry.attempts, 2);
        assert_eq!(config.controller.retry.attempts, 2);
        assert_eq!(config.registry.url, "http://registry:5001");
    }

    #[test]
    fn test_engine_port_derivation() {
        let config = MonitorConfig::new("CP-007");
        assert_eq!(config.cp_number(), Some(7));
        assert_eq!(config.engine_port().unwrap(), 6007);

        let explicit = MonitorConfig::new("CP-007").with_engine("localhost", Some(7777));
        assert_eq!(explicit.engine_port().unwrap(), 7777);

        let unnamed = MonitorConfig::new("charger");
        assert!(unnamed.engine_port().is_err());
    }

    #[test]
    fn test_reporting_quantum() {
        assert_eq!(ChargingConfig::default().reporting_quantum(), 14);

        let fast = ChargingConfig {
            duration: Duration::from_secs(1000),
            tick: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(fast.reporting_quantum(), 1);

        let coarse = ChargingConfig {
            duration: Duration::from_secs(1),
            tick: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(coarse.reporting_quantum(), 100);
    }
}
