use std::task::Poll;
use std::time::Instant;

use glam::Vec2;

use crate::batch::{BatchingQueue, Dispatch};
use crate::config::SyncConfig;
use crate::entity::{EntityHandle, EntityId, ParticipantState};
use crate::error::{ConnectionError, ProtocolError, TransportError};
use crate::event::{DisconnectReason, EventBuffer, SyncEvent};
use crate::interpolation::{RemoteEntitySnapshot, RemoteInterpolator, RemoteUpdate};
use crate::latency::{LatencyMonitor, LatencyTier};
use crate::net::{
    ClientMessage, LinkState, NetworkStats, ServerMessage, ServerMessageKind, SessionSnapshot,
    Transport, TransportSession,
};
use crate::prediction::{Correction, InputState, LocalPrediction};
use crate::rate::{RateController, RateParams};
use crate::scheduler::{Scheduler, TimerHandle, TimerTask};
use crate::session::{ConnectionState, Session};

/// Client side of the synchronization layer. Owns every component and is
/// driven entirely by `update` from the host's tick loop.
pub struct SyncClient<T> {
    config: SyncConfig,
    session: Session,
    transport: TransportSession<T>,
    scheduler: Scheduler<TimerTask>,
    latency: LatencyMonitor,
    rates: RateController,
    batch: BatchingQueue,
    remotes: RemoteInterpolator,
    prediction: LocalPrediction,
    events: EventBuffer,
    endpoint: Option<String>,
    attempt: u32,
    ping_timer: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    stale_ignored: u64,
}

impl<T: Transport> SyncClient<T> {
    pub fn new(config: SyncConfig, transport: T) -> Self {
        let rates = RateController::new(config.rates.clone());
        let params = rates.current();
        let mut batch = BatchingQueue::new(config.batching.clone());
        batch.set_flush_delay(params.flush_delay);

        Self {
            session: Session::new(),
            transport: TransportSession::new(transport),
            scheduler: Scheduler::new(),
            latency: LatencyMonitor::new(config.latency.clone(), Instant::now()),
            batch,
            remotes: RemoteInterpolator::new(config.interpolation.clone()),
            prediction: LocalPrediction::new(config.prediction.clone(), params.send_interval),
            events: EventBuffer::default(),
            endpoint: None,
            attempt: 0,
            ping_timer: None,
            reconnect_timer: None,
            stale_ignored: 0,
            rates,
            config,
        }
    }

    /// Starts connecting. Failures are retried with a linear backoff and
    /// reported through events; returns `false` if a connection already exists.
    pub fn connect(&mut self, endpoint: impl Into<String>, now: Instant) -> bool {
        if matches!(
            self.session.state(),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Joined
        ) {
            log::debug!("Connect ignored while {:?}", self.session.state());
            return false;
        }

        let endpoint = endpoint.into();
        log::info!("Connecting to {}", endpoint);

        self.endpoint = Some(endpoint);
        self.attempt = 0;
        self.latency = LatencyMonitor::new(self.config.latency.clone(), now);
        self.set_state(ConnectionState::Connecting);
        self.start_attempt(now);
        true
    }

    fn start_attempt(&mut self, now: Instant) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        self.attempt += 1;
        log::debug!("Connection attempt {} to {}", self.attempt, endpoint);

        if let Err(e) = self.transport.connect(&endpoint, now) {
            self.on_connect_failed(e, now);
        }
    }

    fn on_connect_failed(&mut self, error: ConnectionError, now: Instant) {
        let retry = &self.config.retry;

        if retry.should_retry(self.attempt) {
            let delay = retry.delay_after(self.attempt);
            log::warn!(
                "Connection attempt {} failed: {} - retrying in {:?}",
                self.attempt,
                error,
                delay
            );
            self.events.push(SyncEvent::ConnectionRetrying {
                attempt: self.attempt + 1,
                delay,
            });
            self.reconnect_timer = Some(self.scheduler.run_after(now, delay, TimerTask::Reconnect));
        } else {
            log::error!(
                "Giving up after {} connection attempts: {}",
                self.attempt,
                error
            );
            self.attempt = 0;
            self.set_state(ConnectionState::Error);
            self.events.push(SyncEvent::ConnectionFailed {
                reason: error.to_string(),
            });
        }
    }

    fn on_connected(&mut self, now: Instant) {
        log::info!("Connected after {} attempt(s)", self.attempt);
        self.attempt = 0;
        self.set_state(ConnectionState::Connected);

        self.send_ping(now);
        self.ping_timer = Some(self.scheduler.run_every(
            now,
            self.latency.ping_interval(),
            TimerTask::Ping,
        ));
    }

    pub fn create_room(&mut self, name: impl Into<String>, max_players: u8, now: Instant) -> bool {
        if !self.session.state().is_connected() {
            log::debug!("create_room ignored while {:?}", self.session.state());
            return false;
        }
        self.submit(
            ClientMessage::CreateRoom {
                name: name.into(),
                max_players,
            },
            now,
        )
    }

    pub fn join_room(
        &mut self,
        room_id: impl Into<String>,
        name: impl Into<String>,
        now: Instant,
    ) -> bool {
        if !self.session.state().is_connected() {
            log::debug!("join_room ignored while {:?}", self.session.state());
            return false;
        }
        self.submit(
            ClientMessage::JoinRoom {
                room_id: room_id.into(),
                name: name.into(),
            },
            now,
        )
    }

    pub fn place_action(&mut self, position: Vec2, now: Instant) -> bool {
        if self.session.state() != ConnectionState::Joined {
            log::debug!("place_action ignored while {:?}", self.session.state());
            return false;
        }
        self.submit(
            ClientMessage::PlaceAction {
                x: position.x,
                y: position.y,
            },
            now,
        )
    }

    pub fn collect_action(&mut self, target_id: u32, now: Instant) -> bool {
        if self.session.state() != ConnectionState::Joined {
            log::debug!("collect_action ignored while {:?}", self.session.state());
            return false;
        }
        self.submit(ClientMessage::CollectAction { target_id }, now)
    }

    fn submit(&mut self, message: ClientMessage, now: Instant) -> bool {
        match self.batch.enqueue(message, now, &mut self.scheduler) {
            Dispatch::Now(message) => self.transport.send(message),
            Dispatch::Queued => true,
        }
    }

    fn send_ping(&mut self, now: Instant) {
        let request = self.latency.create_request(now);
        self.transport.send(request);
    }

    /// One simulation tick. Never fails: bad messages are logged and dropped,
    /// a lost link becomes a `Disconnected` event.
    pub fn update(&mut self, now: Instant, dt: f32, input: InputState) {
        if self.session.state() == ConnectionState::Connecting
            && self.transport.state() == LinkState::Opening
        {
            match self.transport.poll_connect(now) {
                Poll::Ready(Ok(())) => self.on_connected(now),
                Poll::Ready(Err(e)) => self.on_connect_failed(e, now),
                Poll::Pending => {}
            }
        }

        match self.transport.poll(now) {
            Ok(messages) => {
                for message in messages {
                    if !self.session.state().is_connected() {
                        break;
                    }
                    if let Err(e) = self.handle_message(message, now) {
                        log::warn!("Discarding message: {}", e);
                    }
                }
            }
            Err(e) => self.on_link_lost(e),
        }

        for task in self.scheduler.poll(now) {
            self.run_task(task, now);
        }

        if self.session.state() == ConnectionState::Joined {
            self.tick_local(now, dt, input);
        }

        for (id, position) in self.remotes.tick(now) {
            self.events.push(SyncEvent::EntityPositionChanged {
                handle: EntityHandle::Remote(id),
                position,
            });
        }
    }

    fn run_task(&mut self, task: TimerTask, now: Instant) {
        match task {
            TimerTask::Ping => {
                if self.session.state().is_connected() {
                    self.send_ping(now);
                }
            }
            TimerTask::FlushBatch => {
                for message in self.batch.on_timer() {
                    self.transport.send(message);
                }
            }
            TimerTask::Reconnect => {
                self.reconnect_timer = None;
                if self.session.state() == ConnectionState::Connecting {
                    self.start_attempt(now);
                }
            }
        }
    }

    fn tick_local(&mut self, now: Instant, dt: f32, input: InputState) {
        let Some(id) = self.prediction.id() else {
            return;
        };

        if self.prediction.tick(input, dt) {
            self.events.push(SyncEvent::EntityPositionChanged {
                handle: EntityHandle::Local(id),
                position: self.prediction.position(),
            });
        }

        if let Some(update) = self.prediction.take_position_update(now) {
            self.submit(update, now);
        }
    }

    fn handle_message(&mut self, message: ServerMessage, now: Instant) -> Result<(), ProtocolError> {
        let state = self.session.state();
        let kind = message.kind();

        match message {
            ServerMessage::Welcome { .. } => {}
            ServerMessage::PingResponse { timestamp } => self.on_ping_response(timestamp, now),
            ServerMessage::ErrorNotice { message } => {
                log::warn!("Server error: {}", message);
                self.events.push(SyncEvent::ServerError { message });
            }
            ServerMessage::Disconnected => {
                log::info!("Disconnected by server");
                self.transport.disconnect(std::iter::empty());
                self.teardown(DisconnectReason::ServerClosed);
            }
            ServerMessage::RoomCreated { room_id, local_id } => {
                self.session.assign_local_id(local_id)?;
                self.session.set_room(room_id.clone());
                self.session.set_host(true);
                log::info!("Created room {} as {}", room_id, local_id);

                self.set_state(ConnectionState::Joined);
                self.events
                    .push(SyncEvent::RoomCreated { room_id, local_id });
            }
            ServerMessage::RoomJoined {
                room_id,
                local_id,
                initial_state,
            } => {
                self.session.assign_local_id(local_id)?;
                self.session.set_room(room_id.clone());
                log::info!("Joined room {} as {}", room_id, local_id);

                self.set_state(ConnectionState::Joined);
                self.events.push(SyncEvent::RoomJoined { room_id, local_id });

                self.apply_snapshot(&initial_state, now);
                if initial_state.in_progress {
                    self.events.push(SyncEvent::SessionStarted {
                        round_time_remaining_ms: initial_state.round_time_remaining_ms,
                    });
                }
            }
            _ if state != ConnectionState::Joined => {
                return Err(ProtocolError::Unexpected { kind, state });
            }
            ServerMessage::ParticipantJoined { participant } => {
                self.apply_participant(&participant, now);
            }
            ServerMessage::ParticipantLeft { id } => {
                if !self.remove_entity(id) {
                    return Err(ProtocolError::UnknownEntity(id));
                }
            }
            ServerMessage::SessionStarted { initial_state } => {
                self.clear_entities();
                self.remotes.forget_departed();
                self.apply_snapshot(&initial_state, now);
                self.events.push(SyncEvent::SessionStarted {
                    round_time_remaining_ms: initial_state.round_time_remaining_ms,
                });
            }
            ServerMessage::SessionStateSync { state } => {
                self.apply_snapshot(&state, now);
            }
            ServerMessage::SessionEnded { winner_id } => {
                log::info!("Session ended, winner {:?}", winner_id);
                self.events.push(SyncEvent::SessionEnded { winner_id });
                self.clear_entities();
            }
            ServerMessage::RemotePositionUpdate { id, sequence, x, y } => {
                self.on_remote_position(id, sequence, Vec2::new(x, y), now);
            }
            ServerMessage::ActionPlaced {
                action_id,
                owner_id,
                x,
                y,
            } => {
                self.events.push(SyncEvent::ActionPlaced {
                    action_id,
                    owner_id,
                    position: Vec2::new(x, y),
                });
            }
            ServerMessage::ActionResolved {
                action_id,
                participants,
                removed_targets,
            } => {
                for participant in &participants {
                    self.apply_participant(participant, now);
                }
                self.events.push(SyncEvent::ActionResolved {
                    action_id,
                    removed_targets,
                });
            }
            ServerMessage::ResourceCollected {
                target_id,
                collector_id,
                participants,
            } => {
                for participant in &participants {
                    self.apply_participant(participant, now);
                }
                self.events.push(SyncEvent::ResourceCollected {
                    target_id,
                    collector_id,
                });
            }
        }

        Ok(())
    }

    fn on_ping_response(&mut self, timestamp: u64, now: Instant) {
        let Some(update) = self.latency.record_response(timestamp, now) else {
            self.stale_ignored += 1;
            return;
        };

        self.events.push(SyncEvent::LatencyChanged {
            ping_ms: update.ping_ms,
            tier: update.tier,
        });
        self.apply_rates(update.tier);
    }

    fn apply_rates(&mut self, tier: LatencyTier) {
        if let Some(params) = self.rates.apply(tier) {
            self.prediction.set_send_interval(params.send_interval);
            self.batch.set_flush_delay(params.flush_delay);
        }
        self.remotes.set_latency_tier(tier);
    }

    fn on_remote_position(&mut self, id: EntityId, sequence: u32, target: Vec2, now: Instant) {
        // Echo of our own movement
        if self.session.local_id() == Some(id) {
            return;
        }

        match self.remotes.update_target(id, sequence, target, now) {
            RemoteUpdate::Created => {
                let mut participant = ParticipantState::new(id, String::new(), target.x, target.y);
                participant.sequence = sequence;
                self.events.push(SyncEvent::EntityAppeared {
                    handle: EntityHandle::Remote(id),
                    participant,
                });
            }
            RemoteUpdate::Updated => {}
            RemoteUpdate::Stale => self.stale_ignored += 1,
        }
    }

    fn apply_snapshot(&mut self, snapshot: &SessionSnapshot, now: Instant) {
        for participant in &snapshot.participants {
            self.apply_participant(participant, now);
        }
    }

    fn apply_participant(&mut self, state: &ParticipantState, now: Instant) {
        let handle = EntityHandle::classify(self.session.local_id(), state.id);

        match handle {
            EntityHandle::Local(_) if self.prediction.id().is_none() => {
                self.prediction.spawn(state);
                self.events.push(SyncEvent::EntityAppeared {
                    handle,
                    participant: state.clone(),
                });
            }
            EntityHandle::Local(_) => match self.prediction.apply_authoritative(state) {
                Correction::Stale => self.stale_ignored += 1,
                correction => {
                    self.events.push(SyncEvent::AuthoritativeStateApplied {
                        handle,
                        stats: state.stats,
                    });
                    if correction == Correction::Snapped {
                        self.events.push(SyncEvent::EntityPositionChanged {
                            handle,
                            position: self.prediction.position(),
                        });
                    }
                }
            },
            EntityHandle::Remote(id) => {
                if !state.stats.alive {
                    if self.remotes.is_outdated(id, state.sequence) {
                        self.stale_ignored += 1;
                    } else if self.remotes.depart(id, state.sequence).is_some() {
                        self.events.push(SyncEvent::EntityRemoved { handle });
                    }
                    return;
                }

                match self.remotes.apply_state(state, now) {
                    RemoteUpdate::Created => self.events.push(SyncEvent::EntityAppeared {
                        handle,
                        participant: state.clone(),
                    }),
                    RemoteUpdate::Updated => {
                        self.events.push(SyncEvent::AuthoritativeStateApplied {
                            handle,
                            stats: state.stats,
                        })
                    }
                    RemoteUpdate::Stale => self.stale_ignored += 1,
                }
            }
        }
    }

    fn remove_entity(&mut self, id: EntityId) -> bool {
        let handle = EntityHandle::classify(self.session.local_id(), id);

        let removed = match handle {
            EntityHandle::Local(_) => {
                let known = self.prediction.id().is_some();
                self.prediction.reset();
                known
            }
            EntityHandle::Remote(_) => self.remotes.remove(id).is_some(),
        };

        if removed {
            self.events.push(SyncEvent::EntityRemoved { handle });
        }
        removed
    }

    fn clear_entities(&mut self) {
        for id in self.remotes.ids() {
            self.events.push(SyncEvent::EntityRemoved {
                handle: EntityHandle::Remote(id),
            });
        }
        if let Some(id) = self.prediction.id() {
            self.events.push(SyncEvent::EntityRemoved {
                handle: EntityHandle::Local(id),
            });
        }

        self.remotes.depart_all();
        self.prediction.reset();
    }

    fn on_link_lost(&mut self, error: TransportError) {
        let reason = match error {
            TransportError::TimedOut => DisconnectReason::TimedOut,
            TransportError::Closed => DisconnectReason::ServerClosed,
            _ => DisconnectReason::TransportError,
        };
        log::warn!("Connection lost: {}", error);
        self.teardown(reason);
    }

    /// Flushes pending updates, then tears everything down. Idempotent.
    pub fn disconnect(&mut self) -> bool {
        if self.session.state() == ConnectionState::Disconnected {
            return false;
        }
        log::info!("Disconnecting");

        let pending = self.batch.flush(&mut self.scheduler);
        if !pending.is_empty() {
            log::debug!("Flushing {} pending message(s) before disconnect", pending.len());
        }
        self.transport.disconnect(pending);
        self.teardown(DisconnectReason::Graceful);
        true
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        self.scheduler.cancel_all();
        self.ping_timer = None;
        self.reconnect_timer = None;
        self.attempt = 0;

        self.clear_entities();
        self.session.clear();

        self.latency.reset();
        self.rates.reset();
        let params = self.rates.current();
        self.prediction.set_send_interval(params.send_interval);
        self.batch.clear(&mut self.scheduler);
        self.batch.set_flush_delay(params.flush_delay);
        self.remotes.clear();

        self.set_state(ConnectionState::Disconnected);
        self.events.push(SyncEvent::Disconnected { reason });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.session.set_state(state) {
            self.events
                .push(SyncEvent::ConnectionStateChanged { state });
        }
    }

    pub fn on_message<F>(&mut self, kind: ServerMessageKind, handler: F)
    where
        F: FnMut(&ServerMessage) + 'static,
    {
        self.transport.on_message(kind, handler);
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        self.events.drain()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn local_id(&self) -> Option<EntityId> {
        self.session.local_id()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.session.room_id()
    }

    pub fn is_host(&self) -> bool {
        self.session.is_host()
    }

    pub fn ping_ms(&self) -> u32 {
        self.latency.ping_ms()
    }

    pub fn latency_tier(&self) -> LatencyTier {
        self.latency.tier()
    }

    pub fn rate_params(&self) -> RateParams {
        self.rates.current()
    }

    pub fn local_position(&self) -> Option<Vec2> {
        self.prediction.id().map(|_| self.prediction.position())
    }

    pub fn prediction(&self) -> &LocalPrediction {
        &self.prediction
    }

    pub fn remote(&self, id: EntityId) -> Option<&RemoteEntitySnapshot> {
        self.remotes.get(id)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &RemoteEntitySnapshot> {
        self.remotes.iter()
    }

    pub fn pending_outbound(&self) -> usize {
        self.batch.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending_count()
    }

    pub fn is_ping_scheduled(&self) -> bool {
        self.ping_timer
            .is_some_and(|timer| self.scheduler.is_pending(timer))
    }

    pub fn is_reconnect_scheduled(&self) -> bool {
        self.reconnect_timer
            .is_some_and(|timer| self.scheduler.is_pending(timer))
    }

    pub fn network_stats(&self) -> NetworkStats {
        let mut stats = self.transport.stats().clone();
        stats.stale_ignored = self.stale_ignored;
        stats
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        self.transport.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.transport.transport_mut()
    }
}
