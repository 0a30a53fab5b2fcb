use std::time::{Duration, Instant};

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, ParticipantState, ParticipantStats};
use crate::net::{ClientMessage, sequence_greater_than};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputState: u8 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const UP = 1 << 2;
        const DOWN = 1 << 3;
    }
}

impl InputState {
    /// Unit-axis direction. Opposing keys resolve to left and up.
    pub fn direction(&self) -> Vec2 {
        let x = if self.contains(Self::LEFT) {
            -1.0
        } else if self.contains(Self::RIGHT) {
            1.0
        } else {
            0.0
        };
        let y = if self.contains(Self::UP) {
            -1.0
        } else if self.contains(Self::DOWN) {
            1.0
        } else {
            0.0
        };
        Vec2::new(x, y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaBounds {
    pub width: f32,
    pub height: f32,
    pub margin: f32,
}

impl Default for ArenaBounds {
    fn default() -> Self {
        Self {
            width: 1024.0,
            height: 768.0,
            margin: 32.0,
        }
    }
}

impl ArenaBounds {
    pub fn min(&self) -> Vec2 {
        Vec2::splat(self.margin)
    }

    pub fn max(&self) -> Vec2 {
        Vec2::new(
            (self.width - self.margin).max(self.margin),
            (self.height - self.margin).max(self.margin),
        )
    }

    pub fn clamp(&self, position: Vec2) -> Vec2 {
        position.clamp(self.min(), self.max())
    }

    pub fn contains(&self, position: Vec2) -> bool {
        position.cmpge(self.min()).all() && position.cmple(self.max()).all()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub base_speed: f32,
    pub correction_threshold: f32,
    /// Share of the remaining gap closed per tick while reconciling.
    pub correction_factor: f32,
    pub settle_epsilon: f32,
    pub arena: ArenaBounds,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            base_speed: 200.0,
            correction_threshold: 20.0,
            correction_factor: 0.3,
            settle_epsilon: 0.5,
            arena: ArenaBounds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionState {
    Idle,
    Predicting,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    Stale,
    None,
    /// Divergence at or over the threshold; blending toward the server.
    Blending { divergence: f32 },
    /// Teleported onto the server position (respawn).
    Snapped,
}

#[derive(Debug)]
pub struct LocalPrediction {
    config: PredictionConfig,
    state: PredictionState,
    id: Option<EntityId>,
    predicted: Vec2,
    server_position: Vec2,
    server_sequence: Option<u32>,
    stats: ParticipantStats,
    send_interval: Duration,
    last_send: Option<Instant>,
    last_sent_position: Option<Vec2>,
}

impl LocalPrediction {
    pub fn new(config: PredictionConfig, send_interval: Duration) -> Self {
        Self {
            config,
            state: PredictionState::Idle,
            id: None,
            predicted: Vec2::ZERO,
            server_position: Vec2::ZERO,
            server_sequence: None,
            stats: ParticipantStats::default(),
            send_interval,
            last_send: None,
            last_sent_position: None,
        }
    }

    pub fn spawn(&mut self, state: &ParticipantState) {
        let position = self.config.arena.clamp(state.position());

        self.id = Some(state.id);
        self.predicted = position;
        self.server_position = state.position();
        self.server_sequence = Some(state.sequence);
        self.stats = state.stats;
        self.last_sent_position = Some(position);
        self.state = if state.stats.alive {
            PredictionState::Predicting
        } else {
            PredictionState::Idle
        };
    }

    /// Advances one simulation tick. Returns `true` if the predicted position
    /// changed.
    pub fn tick(&mut self, input: InputState, dt: f32) -> bool {
        if self.state == PredictionState::Idle {
            return false;
        }

        let before = self.predicted;
        let speed = self.config.base_speed * self.stats.speed_multiplier;
        self.predicted += input.direction() * speed * dt;

        if self.state == PredictionState::Reconciling {
            let target = self.config.arena.clamp(self.server_position);
            self.predicted += (target - self.predicted) * self.config.correction_factor;

            if self.predicted.distance(target) < self.config.settle_epsilon {
                self.predicted = target;
                self.state = PredictionState::Predicting;
                log::debug!("Reconciled with server position {}", target);
            }
        }

        self.predicted = self.config.arena.clamp(self.predicted);
        self.predicted != before
    }

    pub fn apply_authoritative(&mut self, state: &ParticipantState) -> Correction {
        if let Some(sequence) = self.server_sequence {
            if sequence_greater_than(sequence, state.sequence) {
                log::debug!(
                    "Stale authoritative state (seq {} < {})",
                    state.sequence,
                    sequence
                );
                return Correction::Stale;
            }
        }

        let was_alive = self.stats.alive;
        let is_newer = self
            .server_sequence
            .is_none_or(|sequence| sequence_greater_than(state.sequence, sequence));

        self.stats = state.stats;
        if is_newer {
            self.server_sequence = Some(state.sequence);
            self.server_position = state.position();
        }

        if !self.stats.alive {
            self.state = PredictionState::Idle;
            return Correction::None;
        }

        if !was_alive || self.id.is_none() {
            self.id = Some(state.id);
            self.predicted = self.config.arena.clamp(self.server_position);
            self.state = PredictionState::Predicting;
            return Correction::Snapped;
        }

        if !is_newer {
            return Correction::None;
        }

        let divergence = self.divergence();
        if divergence >= self.config.correction_threshold {
            self.state = PredictionState::Reconciling;
            log::debug!("Divergence {:.1} - reconciling", divergence);
            Correction::Blending { divergence }
        } else {
            Correction::None
        }
    }

    /// Emits the predicted position when the send interval has elapsed and
    /// it moved since the last emitted value.
    pub fn take_position_update(&mut self, now: Instant) -> Option<ClientMessage> {
        if self.state == PredictionState::Idle {
            return None;
        }
        if self
            .last_send
            .is_some_and(|last| now.saturating_duration_since(last) < self.send_interval)
        {
            return None;
        }
        if self.last_sent_position == Some(self.predicted) {
            return None;
        }

        self.last_send = Some(now);
        self.last_sent_position = Some(self.predicted);
        Some(ClientMessage::PositionUpdate {
            x: self.predicted.x,
            y: self.predicted.y,
        })
    }

    pub fn set_send_interval(&mut self, send_interval: Duration) {
        self.send_interval = send_interval;
    }

    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    pub fn divergence(&self) -> f32 {
        self.predicted.distance(self.server_position)
    }

    pub fn position(&self) -> Vec2 {
        self.predicted
    }

    pub fn server_position(&self) -> Vec2 {
        self.server_position
    }

    pub fn state(&self) -> PredictionState {
        self.state
    }

    pub fn stats(&self) -> &ParticipantStats {
        &self.stats
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn reset(&mut self) {
        self.state = PredictionState::Idle;
        self.id = None;
        self.predicted = Vec2::ZERO;
        self.server_position = Vec2::ZERO;
        self.server_sequence = None;
        self.stats = ParticipantStats::default();
        self.last_send = None;
        self.last_sent_position = None;
    }
}
