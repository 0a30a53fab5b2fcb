use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use arena_sync::net::{ClientPacket, PacketHeader, ServerPacket};
use arena_sync::{
    ClientMessage, ConnectionState, InputState, ParticipantState, RetryConfig, ServerMessage,
    SessionSnapshot, SyncClient, SyncConfig, SyncEvent, Transport, TransportConfig, UdpTransport,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

/// Minimal scripted server on a raw socket.
struct FakeServer {
    socket: UdpSocket,
    client: Option<SocketAddr>,
    sequence: u32,
}

impl FakeServer {
    fn bind(port: u16) -> Self {
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", port)).unwrap();
        socket.set_nonblocking(true).unwrap();
        Self {
            socket,
            client: None,
            sequence: 0,
        }
    }

    fn receive(&mut self) -> Vec<ClientMessage> {
        let mut buf = [0u8; 2048];
        let mut messages = Vec::new();
        while let Ok((size, addr)) = self.socket.recv_from(&mut buf) {
            if let Ok(packet) = ClientPacket::deserialize(&buf[..size]) {
                self.client = Some(addr);
                messages.push(packet.payload);
            }
        }
        messages
    }

    fn send(&mut self, message: ServerMessage) {
        let addr = self.client.unwrap();
        let packet = ServerPacket::new(PacketHeader::new(self.sequence), message);
        self.sequence += 1;
        self.socket
            .send_to(&packet.serialize().unwrap(), addr)
            .unwrap();
    }

    fn send_raw(&self, data: &[u8]) {
        self.socket.send_to(data, self.client.unwrap()).unwrap();
    }
}

fn client_config() -> SyncConfig {
    SyncConfig {
        transport: TransportConfig {
            connect_timeout: Duration::from_millis(500),
            hello_resend: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(5),
        },
        ..Default::default()
    }
}

/// Ticks the client and lets the server answer until `done` holds.
fn drive_until<F, D>(
    client: &mut SyncClient<UdpTransport>,
    server: &mut FakeServer,
    mut respond: F,
    done: D,
) -> Vec<ClientMessage>
where
    F: FnMut(&mut FakeServer, &ClientMessage),
    D: Fn(&SyncClient<UdpTransport>) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut seen = Vec::new();

    while !done(client) && Instant::now() < deadline {
        client.update(Instant::now(), 1.0 / 60.0, InputState::empty());
        for message in server.receive() {
            respond(server, &message);
            seen.push(message);
        }
        thread::sleep(Duration::from_millis(1));
    }

    seen
}

fn answer(server: &mut FakeServer, message: &ClientMessage) {
    match message {
        ClientMessage::Hello { .. } => server.send(ServerMessage::Welcome { session_salt: 77 }),
        ClientMessage::PingRequest { timestamp } => server.send(ServerMessage::PingResponse {
            timestamp: *timestamp,
        }),
        ClientMessage::JoinRoom { room_id, .. } => {
            let mut local = ParticipantState::new(3, "udp", 64.0, 64.0);
            local.sequence = 1;
            server.send(ServerMessage::RoomJoined {
                room_id: room_id.clone(),
                local_id: 3,
                initial_state: SessionSnapshot {
                    participants: vec![local],
                    in_progress: false,
                    round_time_remaining_ms: 0,
                },
            });
        }
        _ => {}
    }
}

#[test]
fn test_udp_handshake_and_join() {
    let port = next_port();
    let mut server = FakeServer::bind(port);
    let config = client_config();
    let mut client = SyncClient::new(config.clone(), UdpTransport::new(config.transport));

    assert!(client.connect(format!("127.0.0.1:{}", port), Instant::now()));
    let seen = drive_until(&mut client, &mut server, answer, |c| {
        c.state() == ConnectionState::Connected
    });

    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(matches!(seen[0], ClientMessage::Hello { .. }));
    assert_eq!(client.transport().session_salt(), Some(77));

    assert!(client.join_room("UDP1", "udp", Instant::now()));
    drive_until(&mut client, &mut server, answer, |c| {
        c.state() == ConnectionState::Joined
    });

    assert_eq!(client.state(), ConnectionState::Joined);
    assert_eq!(client.local_id(), Some(3));
    assert_eq!(client.room_id(), Some("UDP1"));
    assert!(client.network_stats().packets_received >= 2);

    assert!(client.disconnect());
    thread::sleep(Duration::from_millis(20));
    assert!(server.receive().contains(&ClientMessage::Goodbye));
}

#[test]
fn test_udp_drops_malformed_datagrams() {
    let port = next_port();
    let mut server = FakeServer::bind(port);
    let mut transport = UdpTransport::new(client_config().transport);

    let start = Instant::now();
    transport.open(&format!("127.0.0.1:{}", port), start).unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while server.receive().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    server.send_raw(b"definitely not a packet");
    server.send(ServerMessage::Welcome { session_salt: 5 });

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut connected = false;
    while Instant::now() < deadline {
        if let std::task::Poll::Ready(result) = transport.poll_open(Instant::now()) {
            result.unwrap();
            connected = true;
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    assert!(connected);
    assert_eq!(transport.stats().packets_dropped, 1);
    assert_eq!(transport.session_salt(), Some(5));
}

#[test]
fn test_udp_silent_server_times_out() {
    let port = next_port();
    let _silent = UdpSocket::bind(format!("127.0.0.1:{}", port)).unwrap();

    let config = SyncConfig {
        transport: TransportConfig {
            connect_timeout: Duration::from_millis(150),
            hello_resend: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(5),
        },
        retry: RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
        },
        ..Default::default()
    };
    let mut client = SyncClient::new(config.clone(), UdpTransport::new(config.transport));
    assert!(client.connect(format!("127.0.0.1:{}", port), Instant::now()));

    let deadline = Instant::now() + Duration::from_secs(2);
    while client.state() == ConnectionState::Connecting && Instant::now() < deadline {
        client.update(Instant::now(), 1.0 / 60.0, InputState::empty());
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(client.state(), ConnectionState::Error);
    assert!(
        client
            .drain_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::ConnectionFailed { .. }))
    );
}
