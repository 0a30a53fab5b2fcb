use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, ParticipantState, ParticipantStats};
use crate::latency::LatencyTier;
use crate::net::sequence_greater_than;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    pub base_blend: f32,
    pub high_latency_boost: f32,
    pub far_distance: f32,
    pub far_boost: f32,
    pub staleness_window: Duration,
    pub settle_epsilon: f32,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            base_blend: 0.15,
            high_latency_boost: 0.10,
            far_distance: 96.0,
            far_boost: 0.25,
            staleness_window: Duration::from_millis(1000),
            settle_epsilon: 0.01,
        }
    }
}

/// Larger under poor latency and after big jumps.
fn blend_factor(config: &InterpolationConfig, tier: LatencyTier, distance: f32) -> f32 {
    let mut blend = config.base_blend;
    if tier >= LatencyTier::High {
        blend += config.high_latency_boost;
    }
    if distance > config.far_distance {
        blend += config.far_boost;
    }
    blend.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub target: Vec2,
    pub displayed: Vec2,
    pub last_update: Instant,
    pub sequence: u32,
    pub stats: ParticipantStats,
}

impl RemoteEntitySnapshot {
    fn new(state: &ParticipantState, now: Instant) -> Self {
        let position = state.position();
        Self {
            id: state.id,
            name: state.name.clone(),
            target: position,
            displayed: position,
            last_update: now,
            sequence: state.sequence,
            stats: state.stats,
        }
    }

    pub fn is_stale(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_update) > window
    }

    pub fn is_settled(&self) -> bool {
        self.displayed == self.target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    Created,
    Updated,
    Stale,
}

#[derive(Debug)]
pub struct RemoteInterpolator {
    config: InterpolationConfig,
    tier: LatencyTier,
    entities: BTreeMap<EntityId, RemoteEntitySnapshot>,
    // Last sequence seen for entities that left or died
    departed: BTreeMap<EntityId, u32>,
}

impl RemoteInterpolator {
    pub fn new(config: InterpolationConfig) -> Self {
        Self {
            config,
            tier: LatencyTier::Low,
            entities: BTreeMap::new(),
            departed: BTreeMap::new(),
        }
    }

    pub fn set_latency_tier(&mut self, tier: LatencyTier) {
        self.tier = tier;
    }

    pub fn blend_factor(&self, distance: f32) -> f32 {
        blend_factor(&self.config, self.tier, distance)
    }

    /// Applies a full participant state. Stats from a state with the same
    /// sequence are still taken; position only moves on a newer sequence.
    pub fn apply_state(&mut self, state: &ParticipantState, now: Instant) -> RemoteUpdate {
        if self.is_outdated(state.id, state.sequence) {
            log::debug!("Stale state for {} (seq {})", state.id, state.sequence);
            return RemoteUpdate::Stale;
        }

        let Some(entity) = self.entities.get_mut(&state.id) else {
            self.departed.remove(&state.id);
            self.entities
                .insert(state.id, RemoteEntitySnapshot::new(state, now));
            return RemoteUpdate::Created;
        };

        entity.stats = state.stats;
        entity.name.clone_from(&state.name);

        if sequence_greater_than(state.sequence, entity.sequence) {
            entity.sequence = state.sequence;
            entity.target = state.position();
            entity.last_update = now;
        }

        RemoteUpdate::Updated
    }

    /// Sets a new target without touching the displayed position. A bare
    /// position never brings back an entity that left or died.
    pub fn update_target(
        &mut self,
        id: EntityId,
        sequence: u32,
        target: Vec2,
        now: Instant,
    ) -> RemoteUpdate {
        if self.departed.contains_key(&id) {
            log::debug!("Position for departed {} (seq {})", id, sequence);
            return RemoteUpdate::Stale;
        }

        let Some(entity) = self.entities.get_mut(&id) else {
            let mut state = ParticipantState::new(id, String::new(), target.x, target.y);
            state.sequence = sequence;
            self.entities
                .insert(id, RemoteEntitySnapshot::new(&state, now));
            return RemoteUpdate::Created;
        };

        if !sequence_greater_than(sequence, entity.sequence) {
            log::debug!("Stale position for {} (seq {})", id, sequence);
            return RemoteUpdate::Stale;
        }

        entity.sequence = sequence;
        entity.target = target;
        entity.last_update = now;
        RemoteUpdate::Updated
    }

    pub fn tick(&mut self, now: Instant) -> Vec<(EntityId, Vec2)> {
        let Self {
            config,
            tier,
            entities,
            departed: _,
        } = self;
        let mut moved = Vec::new();

        for entity in entities.values_mut() {
            if entity.is_settled() || entity.is_stale(now, config.staleness_window) {
                continue;
            }

            let delta = entity.target - entity.displayed;
            let distance = delta.length();

            if distance <= config.settle_epsilon {
                entity.displayed = entity.target;
            } else {
                entity.displayed += delta * blend_factor(config, *tier, distance);
            }

            moved.push((entity.id, entity.displayed));
        }

        moved
    }

    /// Whether a state carrying `sequence` would be dropped as stale. Once an
    /// entity departs only a newer sequence brings it back.
    pub fn is_outdated(&self, id: EntityId, sequence: u32) -> bool {
        if let Some(entity) = self.entities.get(&id) {
            return sequence_greater_than(entity.sequence, sequence);
        }
        self.departed
            .get(&id)
            .is_some_and(|&last| !sequence_greater_than(sequence, last))
    }

    pub fn remove(&mut self, id: EntityId) -> Option<RemoteEntitySnapshot> {
        let removed = self.entities.remove(&id)?;
        self.record_departure(id, removed.sequence);
        Some(removed)
    }

    pub fn depart(&mut self, id: EntityId, sequence: u32) -> Option<RemoteEntitySnapshot> {
        let removed = self.remove(id);
        self.record_departure(id, sequence);
        removed
    }

    pub fn depart_all(&mut self) {
        for (id, entity) in std::mem::take(&mut self.entities) {
            self.record_departure(id, entity.sequence);
        }
    }

    pub fn forget_departed(&mut self) {
        self.departed.clear();
    }

    fn record_departure(&mut self, id: EntityId, sequence: u32) {
        let last = self.departed.entry(id).or_insert(sequence);
        if sequence_greater_than(sequence, *last) {
            *last = sequence;
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&RemoteEntitySnapshot> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteEntitySnapshot> {
        self.entities.values()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.departed.clear();
        self.tier = LatencyTier::Low;
    }
}
