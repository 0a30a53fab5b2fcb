use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::latency::LatencyTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateParams {
    pub send_interval: Duration,
    pub flush_delay: Duration,
}

impl RateParams {
    pub const fn from_millis(send_interval_ms: u64, flush_delay_ms: u64) -> Self {
        Self {
            send_interval: Duration::from_millis(send_interval_ms),
            flush_delay: Duration::from_millis(flush_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub low: RateParams,
    pub medium: RateParams,
    pub high: RateParams,
    pub very_high: RateParams,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            low: RateParams::from_millis(50, 50),
            medium: RateParams::from_millis(100, 100),
            high: RateParams::from_millis(150, 150),
            very_high: RateParams::from_millis(200, 250),
        }
    }
}

impl RateConfig {
    fn raw(&self, tier: LatencyTier) -> RateParams {
        match tier {
            LatencyTier::Low => self.low,
            LatencyTier::Medium => self.medium,
            LatencyTier::High => self.high,
            LatencyTier::VeryHigh => self.very_high,
        }
    }
}

/// Tier assumed until the first round-trip measurement arrives.
const UNMEASURED_TIER: LatencyTier = LatencyTier::Medium;

/// Maps latency tier to send cadence. Worse tiers never send faster than
/// better ones, even if configured that way.
#[derive(Debug, Clone)]
pub struct RateController {
    config: RateConfig,
    tier: Option<LatencyTier>,
    current: RateParams,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        let current = Self::resolve(&config, UNMEASURED_TIER);
        Self {
            config,
            tier: None,
            current,
        }
    }

    fn resolve(config: &RateConfig, tier: LatencyTier) -> RateParams {
        LatencyTier::ALL
            .iter()
            .filter(|&&t| t <= tier)
            .map(|&t| config.raw(t))
            .fold(RateParams::from_millis(0, 0), |acc, p| RateParams {
                send_interval: acc.send_interval.max(p.send_interval),
                flush_delay: acc.flush_delay.max(p.flush_delay),
            })
    }

    pub fn params_for(&self, tier: LatencyTier) -> RateParams {
        Self::resolve(&self.config, tier)
    }

    /// Returns the new parameters when the tier changed.
    pub fn apply(&mut self, tier: LatencyTier) -> Option<RateParams> {
        if self.tier == Some(tier) {
            return None;
        }

        self.tier = Some(tier);
        self.current = self.params_for(tier);
        log::info!(
            "Network {} - send every {}ms, flush after {}ms",
            tier.label(),
            self.current.send_interval.as_millis(),
            self.current.flush_delay.as_millis()
        );
        Some(self.current)
    }

    pub fn current(&self) -> RateParams {
        self.current
    }

    /// `None` until a tier has been applied.
    pub fn tier(&self) -> Option<LatencyTier> {
        self.tier
    }

    pub fn reset(&mut self) {
        self.tier = None;
        self.current = self.params_for(UNMEASURED_TIER);
    }
}
