use std::time::{Duration, Instant};

use arena_sync::{
    ArenaBounds, ClientMessage, EntityId, LoopbackServer, ParticipantState, ServerMessage,
    SessionSnapshot,
};
use glam::Vec2;

const PLAYER_ID: EntityId = 1;
const BOT_ID: EntityId = 2;
const ROOM_ID: &str = "DEMO";

const BOT_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
const SYNC_INTERVAL: Duration = Duration::from_secs(1);
/// Every Nth state sync nudges the player to force a reconciliation.
const DRIFT_EVERY: u32 = 4;
const DRIFT: f32 = 40.0;
const ACTION_RADIUS: f32 = 96.0;
const ACTION_DAMAGE: i32 = 25;

/// In-process authority for the demo. Accepts whatever the client reports,
/// orbits a bot around the arena, and resolves actions against it.
pub struct ScriptedServer {
    link: LoopbackServer,
    arena: ArenaBounds,
    round: Duration,
    started: Option<Instant>,
    player: Option<ParticipantState>,
    bot: ParticipantState,
    last_bot_update: Option<Instant>,
    last_sync: Option<Instant>,
    syncs: u32,
    next_action_id: u32,
}

impl ScriptedServer {
    pub fn new(link: LoopbackServer, arena: ArenaBounds, round: Duration) -> Self {
        let center = arena.clamp(Vec2::new(arena.width, arena.height) * 0.5);
        let mut bot = ParticipantState::new(BOT_ID, "bot", center.x, center.y);
        bot.sequence = 1;

        Self {
            link,
            arena,
            round,
            started: None,
            player: None,
            bot,
            last_bot_update: None,
            last_sync: None,
            syncs: 0,
            next_action_id: 1,
        }
    }

    pub fn step(&mut self, now: Instant) {
        for message in self.link.take_received(now) {
            self.handle(message, now);
        }

        if self.started.is_some() {
            self.move_bot(now);
            self.sync_player(now);
        }
    }

    fn handle(&mut self, message: ClientMessage, now: Instant) {
        match message {
            ClientMessage::PingRequest { timestamp } => {
                self.link.send(now, ServerMessage::PingResponse { timestamp });
            }
            ClientMessage::CreateRoom { name, .. } => {
                self.spawn_player(name);
                self.link.send(
                    now,
                    ServerMessage::RoomCreated {
                        room_id: ROOM_ID.to_string(),
                        local_id: PLAYER_ID,
                    },
                );
                self.start_round(now);
            }
            ClientMessage::JoinRoom { room_id, name } => {
                self.spawn_player(name);
                self.started = Some(now);
                let initial_state = self.snapshot(now);
                self.link.send(
                    now,
                    ServerMessage::RoomJoined {
                        room_id,
                        local_id: PLAYER_ID,
                        initial_state,
                    },
                );
            }
            ClientMessage::PositionUpdate { x, y } => {
                if let Some(player) = self.player.as_mut() {
                    let position = self.arena.clamp(Vec2::new(x, y));
                    player.x = position.x;
                    player.y = position.y;
                    player.sequence = player.sequence.wrapping_add(1);
                }
            }
            ClientMessage::PlaceAction { x, y } => self.resolve_action(Vec2::new(x, y), now),
            ClientMessage::CollectAction { target_id } => {
                let participants = self.player.iter().cloned().collect();
                self.link.send(
                    now,
                    ServerMessage::ResourceCollected {
                        target_id,
                        collector_id: PLAYER_ID,
                        participants,
                    },
                );
            }
            ClientMessage::Goodbye => {
                log::info!("[server] client left");
                self.player = None;
                self.started = None;
            }
            ClientMessage::Hello { .. } => {}
        }
    }

    fn spawn_player(&mut self, name: String) {
        let start = self.arena.min() + Vec2::splat(64.0);
        self.player = Some(ParticipantState::new(PLAYER_ID, name, start.x, start.y));
    }

    fn start_round(&mut self, now: Instant) {
        self.started = Some(now);
        let initial_state = self.snapshot(now);
        self.link
            .send(now, ServerMessage::SessionStarted { initial_state });
    }

    fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let elapsed = self
            .started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();

        SessionSnapshot {
            participants: self
                .player
                .iter()
                .chain(std::iter::once(&self.bot))
                .cloned()
                .collect(),
            in_progress: self.started.is_some(),
            round_time_remaining_ms: self.round.saturating_sub(elapsed).as_millis() as u32,
        }
    }

    fn move_bot(&mut self, now: Instant) {
        if self
            .last_bot_update
            .is_some_and(|last| now.saturating_duration_since(last) < BOT_UPDATE_INTERVAL)
        {
            return;
        }
        self.last_bot_update = Some(now);

        if !self.bot.stats.alive {
            return;
        }

        let elapsed = self
            .started
            .map(|started| now.saturating_duration_since(started).as_secs_f32())
            .unwrap_or_default();
        let center = Vec2::new(self.arena.width, self.arena.height) * 0.5;
        let position = self
            .arena
            .clamp(center + Vec2::from_angle(elapsed * 0.8) * 220.0);

        self.bot.x = position.x;
        self.bot.y = position.y;
        self.bot.sequence = self.bot.sequence.wrapping_add(1);

        self.link.send(
            now,
            ServerMessage::RemotePositionUpdate {
                id: BOT_ID,
                sequence: self.bot.sequence,
                x: position.x,
                y: position.y,
            },
        );
    }

    fn sync_player(&mut self, now: Instant) {
        if self
            .last_sync
            .is_some_and(|last| now.saturating_duration_since(last) < SYNC_INTERVAL)
        {
            return;
        }
        self.last_sync = Some(now);
        self.syncs += 1;

        if !self.bot.stats.alive {
            log::info!("[server] bot respawned");
            self.bot.stats.alive = true;
            self.bot.stats.health = 100;
            self.bot.sequence = self.bot.sequence.wrapping_add(1);
            self.link.send(
                now,
                ServerMessage::ParticipantJoined {
                    participant: self.bot.clone(),
                },
            );
        }

        let Some(player) = self.player.as_mut() else {
            return;
        };

        if self.syncs % DRIFT_EVERY == 0 {
            let drifted = self.arena.clamp(player.position() + Vec2::new(DRIFT, 0.0));
            log::info!("[server] injecting drift to ({:.0}, {:.0})", drifted.x, drifted.y);
            player.x = drifted.x;
            player.y = drifted.y;
            player.sequence = player.sequence.wrapping_add(1);
        }

        let state = self.snapshot(now);
        self.link.send(now, ServerMessage::SessionStateSync { state });
    }

    fn resolve_action(&mut self, position: Vec2, now: Instant) {
        let action_id = self.next_action_id;
        self.next_action_id += 1;

        self.link.send(
            now,
            ServerMessage::ActionPlaced {
                action_id,
                owner_id: PLAYER_ID,
                x: position.x,
                y: position.y,
            },
        );

        let mut participants = Vec::new();
        if self.bot.stats.alive && self.bot.position().distance(position) <= ACTION_RADIUS {
            self.bot.stats.health -= ACTION_DAMAGE;
            if self.bot.stats.health <= 0 {
                log::info!("[server] bot eliminated by action {}", action_id);
                self.bot.stats.alive = false;
            }
            self.bot.sequence = self.bot.sequence.wrapping_add(1);
            participants.push(self.bot.clone());
        }

        self.link.send(
            now,
            ServerMessage::ActionResolved {
                action_id,
                participants,
                removed_targets: Vec::new(),
            },
        );
    }
}
