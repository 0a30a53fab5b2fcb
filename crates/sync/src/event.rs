use std::collections::VecDeque;
use std::time::Duration;

use glam::Vec2;

use crate::entity::{EntityHandle, EntityId, ParticipantState, ParticipantStats};
use crate::latency::LatencyTier;
use crate::net::RoomId;
use crate::session::ConnectionState;

const MAX_BUFFERED_EVENTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Host called `disconnect`.
    Graceful,
    /// Server sent `Disconnected` or closed the link.
    ServerClosed,
    TimedOut,
    TransportError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    ConnectionRetrying {
        attempt: u32,
        delay: Duration,
    },
    ConnectionFailed {
        reason: String,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    RoomCreated {
        room_id: RoomId,
        local_id: EntityId,
    },
    RoomJoined {
        room_id: RoomId,
        local_id: EntityId,
    },
    EntityAppeared {
        handle: EntityHandle,
        participant: ParticipantState,
    },
    EntityRemoved {
        handle: EntityHandle,
    },
    EntityPositionChanged {
        handle: EntityHandle,
        position: Vec2,
    },
    AuthoritativeStateApplied {
        handle: EntityHandle,
        stats: ParticipantStats,
    },
    LatencyChanged {
        ping_ms: u32,
        tier: LatencyTier,
    },
    SessionStarted {
        round_time_remaining_ms: u32,
    },
    SessionEnded {
        winner_id: Option<EntityId>,
    },
    ServerError {
        message: String,
    },
    ActionPlaced {
        action_id: u32,
        owner_id: EntityId,
        position: Vec2,
    },
    ActionResolved {
        action_id: u32,
        removed_targets: Vec<u32>,
    },
    ResourceCollected {
        target_id: u32,
        collector_id: EntityId,
    },
}

#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<SyncEvent>,
    capacity: usize,
    dropped: u64,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(MAX_BUFFERED_EVENTS)
    }
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: SyncEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                log::warn!("Event buffer full, {} events dropped so far", self.dropped);
            }
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<SyncEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let mut buffer = EventBuffer::default();
        buffer.push(SyncEvent::ServerError {
            message: "a".to_string(),
        });
        buffer.push(SyncEvent::SessionEnded { winner_id: Some(1) });

        let events = buffer.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SyncEvent::ServerError { .. }));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = EventBuffer::new(2);
        for id in 0..3 {
            buffer.push(SyncEvent::EntityRemoved {
                handle: EntityHandle::Remote(id),
            });
        }

        assert_eq!(buffer.dropped(), 1);
        assert_eq!(
            buffer.drain(),
            vec![
                SyncEvent::EntityRemoved {
                    handle: EntityHandle::Remote(1)
                },
                SyncEvent::EntityRemoved {
                    handle: EntityHandle::Remote(2)
                },
            ]
        );
    }
}
