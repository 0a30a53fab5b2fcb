use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::net::ClientMessage;

/// Discrete network quality, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LatencyTier {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl LatencyTier {
    pub const ALL: [LatencyTier; 4] = [Self::Low, Self::Medium, Self::High, Self::VeryHigh];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "good",
            Self::Medium => "fair",
            Self::High => "poor",
            Self::VeryHigh => "bad",
        }
    }
}

/// Exclusive upper bounds, in milliseconds, of the first three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyThresholds {
    pub good_below_ms: u32,
    pub fair_below_ms: u32,
    pub poor_below_ms: u32,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            good_below_ms: 100,
            fair_below_ms: 200,
            poor_below_ms: 300,
        }
    }
}

impl LatencyThresholds {
    pub fn classify(&self, ping_ms: u32) -> LatencyTier {
        if ping_ms < self.good_below_ms {
            LatencyTier::Low
        } else if ping_ms < self.fair_below_ms {
            LatencyTier::Medium
        } else if ping_ms < self.poor_below_ms {
            LatencyTier::High
        } else {
            LatencyTier::VeryHigh
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub ping_interval: Duration,
    pub history_capacity: usize,
    /// Requests older than this many are forgotten; their replies count as stale.
    pub max_outstanding: usize,
    pub thresholds: LatencyThresholds,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(2),
            history_capacity: 10,
            max_outstanding: 8,
            thresholds: LatencyThresholds::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatencyEstimate {
    samples: VecDeque<u32>,
    capacity: usize,
    average_ms: f32,
}

impl LatencyEstimate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            average_ms: 0.0,
        }
    }

    pub fn push(&mut self, rtt_ms: u32) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);

        let sum: u64 = self.samples.iter().map(|&s| s as u64).sum();
        self.average_ms = sum as f32 / self.samples.len() as f32;
    }

    pub fn average_ms(&self) -> f32 {
        self.average_ms
    }

    pub fn samples(&self) -> impl Iterator<Item = u32> + '_ {
        self.samples.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.average_ms = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyUpdate {
    pub ping_ms: u32,
    pub tier: LatencyTier,
    pub previous_tier: LatencyTier,
}

impl LatencyUpdate {
    pub fn tier_changed(&self) -> bool {
        self.tier != self.previous_tier
    }
}

/// Measures round-trip time from echoed timestamps. Timestamps are
/// milliseconds since the monitor's epoch.
#[derive(Debug)]
pub struct LatencyMonitor {
    config: LatencyConfig,
    epoch: Instant,
    estimate: LatencyEstimate,
    outstanding: VecDeque<u64>,
    tier: LatencyTier,
}

impl LatencyMonitor {
    pub fn new(config: LatencyConfig, epoch: Instant) -> Self {
        let estimate = LatencyEstimate::new(config.history_capacity);
        Self {
            config,
            epoch,
            estimate,
            outstanding: VecDeque::new(),
            tier: LatencyTier::Low,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }

    fn timestamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    pub fn create_request(&mut self, now: Instant) -> ClientMessage {
        let timestamp = self.timestamp(now);

        while self.outstanding.len() >= self.config.max_outstanding.max(1) {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back(timestamp);

        ClientMessage::PingRequest { timestamp }
    }

    /// `None` when the timestamp does not match an outstanding request.
    pub fn record_response(&mut self, timestamp: u64, now: Instant) -> Option<LatencyUpdate> {
        let Some(index) = self.outstanding.iter().position(|&t| t == timestamp) else {
            log::debug!("Ignoring ping response for unknown timestamp {}", timestamp);
            return None;
        };
        self.outstanding.remove(index);

        let rtt = self.timestamp(now).saturating_sub(timestamp);
        Some(self.record_sample(rtt.min(u32::MAX as u64) as u32))
    }

    pub fn record_sample(&mut self, rtt_ms: u32) -> LatencyUpdate {
        self.estimate.push(rtt_ms);

        let previous_tier = self.tier;
        let ping_ms = self.ping_ms();
        self.tier = self.config.thresholds.classify(ping_ms);

        log::debug!("RTT sample {}ms, average {}ms ({})", rtt_ms, ping_ms, self.tier.label());

        LatencyUpdate {
            ping_ms,
            tier: self.tier,
            previous_tier,
        }
    }

    pub fn ping_ms(&self) -> u32 {
        self.estimate.average_ms().round() as u32
    }

    pub fn tier(&self) -> LatencyTier {
        self.tier
    }

    pub fn estimate(&self) -> &LatencyEstimate {
        &self.estimate
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn reset(&mut self) {
        self.estimate.clear();
        self.outstanding.clear();
        self.tier = LatencyTier::Low;
    }
}
