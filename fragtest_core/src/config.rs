// Run and server configuration structures

use crate::packet::{RunFlags, TestSize, PADDING_LEN};
use crate::registry::BoundsPolicy;
use crate::verdict::Thresholds;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Test sizes the fragment server walks through, in order.
pub const DEFAULT_TEST_SIZES: [TestSize; 7] = [10, 25, 50, 75, 100, 150, 200];
/// Test instances per test size.
pub const DEFAULT_POPULATION: u8 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Client side of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub target_ip: String,
    pub target_port: u16,
    /// Pre-declared sizes. Empty means sizes are discovered from the first fragment seen.
    pub test_sizes: Vec<TestSize>,
    pub population: u8,
    pub warmup: bool,
    pub inter_fragment_delay: bool,
    pub keepalive_interval_ms: u64,
    /// Ends the run when no datagram arrived for this long. `0` waits for the session to close.
    pub idle_timeout_secs: u64,
    pub bounds_policy: BoundsPolicy,
    pub thresholds: Thresholds,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            target_ip: "127.0.0.1".to_string(),
            target_port: 4443,
            test_sizes: Vec::new(),
            population: DEFAULT_POPULATION,
            warmup: false,
            inter_fragment_delay: false,
            keepalive_interval_ms: 1000,
            idle_timeout_secs: 10,
            bounds_policy: BoundsPolicy::Reject,
            thresholds: Thresholds::default(),
        }
    }
}

impl RunConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_json::from_slice(&std::fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population == 0 {
            return Err(ConfigError::Invalid("population must be positive".to_string()));
        }
        if self.test_sizes.contains(&0) {
            return Err(ConfigError::Invalid("test sizes must be positive".to_string()));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid("keepalive interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn target_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .target_ip
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid target address {}: {}", self.target_ip, e)))?;
        Ok(SocketAddr::new(ip, self.target_port))
    }

    pub fn run_flags(&self) -> RunFlags {
        RunFlags {
            warmup: self.warmup,
            inter_fragment_delay: self.inter_fragment_delay,
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// The fragment server's schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_ip: String,
    pub port: u16,
    pub test_sizes: Vec<TestSize>,
    pub population: u8,
    /// Spacing between consecutive test instances of one size.
    pub instance_interval_ms: u64,
    pub padding_len: usize,
    pub stream_chunk_bytes: usize,
    pub stream_interval_ms: u64,
    pub warmup_duration_ms: u64,
    /// Gap between fragments of one instance when the client asks for inter-fragment delay.
    pub fragment_gap_ms: u64,
    /// Simulated loss: probability that a fragment is never sent.
    pub loss_probability: f64,
    pub rng_seed: Option<u64>,
    /// Time to keep the session open after the last fragment.
    pub grace_period_ms: u64,
    pub registration_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_ip: "0.0.0.0".to_string(),
            port: 4443,
            test_sizes: DEFAULT_TEST_SIZES.to_vec(),
            population: DEFAULT_POPULATION,
            instance_interval_ms: 40, // one 25fps frame
            padding_len: PADDING_LEN,
            stream_chunk_bytes: 5500, // ~128kbps at 40ms
            stream_interval_ms: 40,
            warmup_duration_ms: 1000,
            fragment_gap_ms: 1,
            loss_probability: 0.0,
            rng_seed: None,
            grace_period_ms: 1000,
            registration_timeout_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_slice(&std::fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.loss_probability) {
            return Err(ConfigError::Invalid(format!(
                "loss probability {} is outside [0, 1]",
                self.loss_probability
            )));
        }
        if self.test_sizes.contains(&0) {
            return Err(ConfigError::Invalid("test sizes must be positive".to_string()));
        }
        if self.stream_interval_ms == 0 {
            return Err(ConfigError::Invalid("stream interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_ip
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid bind address {}: {}", self.bind_ip, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn instance_interval(&self) -> Duration {
        Duration::from_millis(self.instance_interval_ms)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    pub fn warmup_duration(&self) -> Duration {
        Duration::from_millis(self.warmup_duration_ms)
    }

    pub fn fragment_gap(&self) -> Duration {
        Duration::from_millis(self.fragment_gap_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}
