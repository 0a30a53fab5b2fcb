use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::interpolation::InterpolationConfig;
use crate::latency::LatencyConfig;
use crate::prediction::PredictionConfig;
use crate::rate::RateConfig;

pub const DEFAULT_TICK_RATE: u32 = 60;

/// Every tunable of the synchronization layer, supplied by the host at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub tick_rate: u32,
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    pub latency: LatencyConfig,
    pub rates: RateConfig,
    pub batching: BatchConfig,
    pub interpolation: InterpolationConfig,
    pub prediction: PredictionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            transport: TransportConfig::default(),
            retry: RetryConfig::default(),
            latency: LatencyConfig::default(),
            rates: RateConfig::default(),
            batching: BatchConfig::default(),
            interpolation: InterpolationConfig::default(),
            prediction: PredictionConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub hello_resend: Duration,
    /// Link is considered lost after this long without any inbound datagram.
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            hello_resend: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounded reconnect policy with linearly increasing delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `failed_attempt` (1-based).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        self.base_delay * failed_attempt.max(1)
    }

    pub fn should_retry(&self, failed_attempt: u32) -> bool {
        failed_attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_after(1), Duration::from_secs(1));
        assert_eq!(retry.delay_after(2), Duration::from_secs(2));
        assert!(retry.should_retry(2));
        assert!(!retry.should_retry(3));
    }

    #[test]
    fn test_tick_duration() {
        let config = SyncConfig::default();
        let tick = config.tick_duration();
        assert!((tick.as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }
}
