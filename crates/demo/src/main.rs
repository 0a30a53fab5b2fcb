mod pilot;
mod scripted;

use std::time::{Duration, Instant};

use anyhow::Result;
use arena_sync::{
    ConnectionState, PacketLossSimulation, SyncClient, SyncConfig, SyncEvent, Transport,
    UdpTransport, loopback_pair,
};
use clap::Parser;
use tokio::time::MissedTickBehavior;

use scripted::ScriptedServer;

const ACTION_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "arena-sync-demo")]
#[command(about = "Drives the sync layer against a scripted or remote server")]
struct Args {
    #[arg(short, long, help = "UDP server address (e.g., 127.0.0.1:27015)")]
    server: Option<String>,

    #[arg(short, long, help = "Room to join; a new room is created if omitted")]
    room: Option<String>,

    #[arg(short, long, default_value = "pilot")]
    name: String,

    #[arg(long, default_value_t = 20)]
    seconds: u64,

    #[arg(long, default_value_t = 0, help = "Simulated one-way latency in ms")]
    latency_ms: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter_ms: u32,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

impl Args {
    fn link_simulation(&self) -> PacketLossSimulation {
        PacketLossSimulation {
            enabled: self.latency_ms > 0 || self.jitter_ms > 0 || self.loss_percent > 0.0,
            loss_percent: self.loss_percent,
            min_latency_ms: self.latency_ms,
            max_latency_ms: self.latency_ms.saturating_add(self.jitter_ms),
            jitter_ms: 0,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = SyncConfig::default();
    let run_for = Duration::from_secs(args.seconds);

    let (transport, mut server, endpoint): (Box<dyn Transport>, _, _) = match &args.server {
        Some(addr) => (
            Box::new(UdpTransport::new(config.transport.clone())),
            None,
            addr.clone(),
        ),
        None => {
            let (transport, mut link) = loopback_pair();
            let simulation = args.link_simulation();
            link.set_uplink(simulation.clone());
            link.set_downlink(simulation);
            let server = ScriptedServer::new(link, config.prediction.arena, run_for);
            (Box::new(transport), Some(server), "loopback".to_string())
        }
    };

    let tick = config.tick_duration();
    let mut client = SyncClient::new(config, transport);

    let started = Instant::now();
    client.connect(endpoint, started);

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_tick = started;
    let mut last_action = started;

    loop {
        let now = tokio::select! {
            instant = ticker.tick() => instant.into_std(),
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
        };

        let elapsed = now.saturating_duration_since(started);
        if elapsed >= run_for {
            break;
        }

        let dt = now.saturating_duration_since(last_tick).as_secs_f32();
        last_tick = now;

        if let Some(server) = server.as_mut() {
            server.step(now);
        }

        client.update(now, dt, pilot::input_at(elapsed));

        for event in client.drain_events() {
            on_event(&mut client, &args, event, now);
        }

        if client.state() == ConnectionState::Error {
            anyhow::bail!("could not connect");
        }

        if now.saturating_duration_since(last_action) >= ACTION_INTERVAL {
            last_action = now;
            if let Some(position) = client.local_position() {
                client.place_action(position, now);
            }
        }
    }

    client.disconnect();
    if let Some(server) = server.as_mut() {
        server.step(Instant::now());
    }

    let stats = client.network_stats();
    log::info!(
        "Sent {} packets ({} bytes), received {} ({} bytes), dropped {}, stale {}",
        stats.packets_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received,
        stats.packets_dropped,
        stats.stale_ignored
    );

    Ok(())
}

fn on_event(
    client: &mut SyncClient<Box<dyn Transport>>,
    args: &Args,
    event: SyncEvent,
    now: Instant,
) {
    match event {
        SyncEvent::ConnectionStateChanged { state } => {
            log::info!("State: {:?}", state);
            if state == ConnectionState::Connected {
                match &args.room {
                    Some(room) => client.join_room(room.clone(), args.name.clone(), now),
                    None => client.create_room(args.name.clone(), 4, now),
                };
            }
        }
        SyncEvent::ConnectionRetrying { attempt, delay } => {
            log::warn!("Retrying connection (attempt {}) in {:?}", attempt, delay);
        }
        SyncEvent::ConnectionFailed { reason } => log::error!("Connection failed: {}", reason),
        SyncEvent::Disconnected { reason } => log::info!("Disconnected: {:?}", reason),
        SyncEvent::RoomCreated { room_id, local_id } => {
            log::info!("Hosting room {} as entity {}", room_id, local_id);
        }
        SyncEvent::RoomJoined { room_id, local_id } => {
            log::info!("Joined room {} as entity {}", room_id, local_id);
        }
        SyncEvent::EntityAppeared {
            handle,
            participant,
        } => {
            log::info!(
                "{:?} appeared at ({:.0}, {:.0})",
                handle,
                participant.x,
                participant.y
            );
        }
        SyncEvent::EntityRemoved { handle } => log::info!("{:?} removed", handle),
        SyncEvent::EntityPositionChanged { handle, position } => {
            log::trace!("{:?} at ({:.1}, {:.1})", handle, position.x, position.y);
        }
        SyncEvent::AuthoritativeStateApplied { handle, stats } => {
            log::debug!("{:?} health {} alive {}", handle, stats.health, stats.alive);
        }
        SyncEvent::LatencyChanged { ping_ms, tier } => {
            log::debug!("Ping {}ms ({})", ping_ms, tier.label());
        }
        SyncEvent::SessionStarted {
            round_time_remaining_ms,
        } => {
            log::info!("Round started, {}s left", round_time_remaining_ms / 1000);
        }
        SyncEvent::SessionEnded { winner_id } => log::info!("Round over, winner {:?}", winner_id),
        SyncEvent::ServerError { message } => log::warn!("Server: {}", message),
        SyncEvent::ActionPlaced {
            action_id,
            owner_id,
            position,
        } => {
            log::info!(
                "Action {} by {} at ({:.0}, {:.0})",
                action_id,
                owner_id,
                position.x,
                position.y
            );
        }
        SyncEvent::ActionResolved {
            action_id,
            removed_targets,
        } => {
            log::info!(
                "Action {} resolved, {} target(s) removed",
                action_id,
                removed_targets.len()
            );
        }
        SyncEvent::ResourceCollected {
            target_id,
            collector_id,
        } => {
            log::info!("Resource {} collected by {}", target_id, collector_id);
        }
    }
}
