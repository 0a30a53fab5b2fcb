use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::task::Poll;
use std::time::Instant;

use super::protocol::{
    ClientMessage, ClientPacket, MAX_PACKET_SIZE, PacketHeader, ServerMessage, ServerMessageKind,
    ServerPacket,
};
use super::stats::{NetworkStats, rand_u64};
use super::tracking::ReceiveTracker;
use crate::config::TransportConfig;
use crate::error::{ConnectionError, TransportError};

/// Best-effort duplex message channel. Implementations never block: opening
/// is started by `open` and completed by polling `poll_open` from the tick loop.
pub trait Transport {
    fn open(&mut self, endpoint: &str, now: Instant) -> Result<(), ConnectionError>;

    fn poll_open(&mut self, now: Instant) -> Poll<Result<(), ConnectionError>>;

    fn send(&mut self, message: &ClientMessage) -> Result<usize, TransportError>;

    /// Drains everything that has arrived. An error means the link is gone.
    fn receive(&mut self, now: Instant) -> Result<Vec<ServerMessage>, TransportError>;

    fn close(&mut self);

    fn stats(&self) -> &NetworkStats;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, endpoint: &str, now: Instant) -> Result<(), ConnectionError> {
        (**self).open(endpoint, now)
    }

    fn poll_open(&mut self, now: Instant) -> Poll<Result<(), ConnectionError>> {
        (**self).poll_open(now)
    }

    fn send(&mut self, message: &ClientMessage) -> Result<usize, TransportError> {
        (**self).send(message)
    }

    fn receive(&mut self, now: Instant) -> Result<Vec<ServerMessage>, TransportError> {
        (**self).receive(now)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn stats(&self) -> &NetworkStats {
        (**self).stats()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Idle,
    Pending {
        started: Instant,
        last_hello: Instant,
        client_salt: u64,
    },
    Established {
        session_salt: u64,
    },
}

pub struct UdpTransport {
    config: TransportConfig,
    socket: Option<UdpSocket>,
    remote_addr: Option<SocketAddr>,
    handshake: Handshake,
    send_sequence: u32,
    tracker: ReceiveTracker,
    stats: NetworkStats,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    last_receive_time: Option<Instant>,
    early_messages: Vec<ServerMessage>,
}

impl UdpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            socket: None,
            remote_addr: None,
            handshake: Handshake::Idle,
            send_sequence: 0,
            tracker: ReceiveTracker::new(),
            stats: NetworkStats::default(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            last_receive_time: None,
            early_messages: Vec::new(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn session_salt(&self) -> Option<u64> {
        match self.handshake {
            Handshake::Established { session_salt } => Some(session_salt),
            _ => None,
        }
    }

    fn send_packet(&mut self, message: ClientMessage) -> Result<usize, TransportError> {
        let (Some(socket), Some(addr)) = (self.socket.as_ref(), self.remote_addr) else {
            return Err(TransportError::NotConnected);
        };

        let packet = ClientPacket::new(PacketHeader::new(self.send_sequence), message);
        let data = packet.serialize()?;
        let bytes = socket.send_to(&data, addr)?;

        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        Ok(bytes)
    }

    fn read_datagrams(&mut self) -> io::Result<Vec<ServerMessage>> {
        let mut messages = Vec::new();
        let Some(socket) = self.socket.as_ref() else {
            return Ok(messages);
        };

        loop {
            match socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if Some(addr) != self.remote_addr {
                        self.stats.packets_dropped += 1;
                        continue;
                    }

                    let packet = match ServerPacket::deserialize(&self.recv_buffer[..size]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            log::debug!("Dropping malformed datagram from {}: {}", addr, e);
                            self.stats.packets_dropped += 1;
                            continue;
                        }
                    };

                    if !packet.header.is_valid() {
                        log::debug!("Dropping datagram with bad header from {}", addr);
                        self.stats.packets_dropped += 1;
                        continue;
                    }

                    if !self.tracker.record_received(packet.header.sequence) {
                        self.stats.packets_dropped += 1;
                        continue;
                    }

                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;
                    messages.push(packet.payload);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(messages)
    }

    fn reset(&mut self) {
        self.socket = None;
        self.remote_addr = None;
        self.handshake = Handshake::Idle;
        self.send_sequence = 0;
        self.tracker.reset();
        self.last_receive_time = None;
        self.early_messages.clear();
    }
}

impl Transport for UdpTransport {
    fn open(&mut self, endpoint: &str, now: Instant) -> Result<(), ConnectionError> {
        self.reset();

        let addr = endpoint
            .to_socket_addrs()
            .map_err(|e| ConnectionError::Unreachable(format!("{}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| ConnectionError::Unreachable(endpoint.to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        self.socket = Some(socket);
        self.remote_addr = Some(addr);

        let client_salt = rand_u64();
        self.handshake = Handshake::Pending {
            started: now,
            last_hello: now,
            client_salt,
        };

        self.send_packet(ClientMessage::Hello { client_salt })
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        log::debug!("Sent hello to {}", addr);
        Ok(())
    }

    fn poll_open(&mut self, now: Instant) -> Poll<Result<(), ConnectionError>> {
        let Handshake::Pending {
            started,
            last_hello,
            client_salt,
        } = self.handshake
        else {
            return match self.handshake {
                Handshake::Established { .. } => Poll::Ready(Ok(())),
                _ => Poll::Ready(Err(ConnectionError::Handshake(
                    "no connection attempt in progress".to_string(),
                ))),
            };
        };

        let messages = match self.read_datagrams() {
            Ok(messages) => messages,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                self.reset();
                return Poll::Ready(Err(ConnectionError::Unreachable(e.to_string())));
            }
            Err(e) => {
                self.reset();
                return Poll::Ready(Err(ConnectionError::Io(e)));
            }
        };

        let mut messages = messages.into_iter();
        for message in messages.by_ref() {
            if let ServerMessage::Welcome { session_salt } = message {
                self.handshake = Handshake::Established { session_salt };
                self.last_receive_time = Some(now);
                break;
            }
            log::debug!("Ignoring {:?} before welcome", message.kind());
        }

        if let Handshake::Established { .. } = self.handshake {
            // Anything the server sent right behind the welcome
            self.early_messages.extend(messages);
            log::info!("Connected to {:?}", self.remote_addr);
            return Poll::Ready(Ok(()));
        }

        if now.duration_since(started) >= self.config.connect_timeout {
            self.reset();
            return Poll::Ready(Err(ConnectionError::TimedOut));
        }

        if now.duration_since(last_hello) >= self.config.hello_resend {
            self.handshake = Handshake::Pending {
                started,
                last_hello: now,
                client_salt,
            };
            if let Err(e) = self.send_packet(ClientMessage::Hello { client_salt }) {
                log::warn!("Failed to resend hello: {}", e);
            }
        }

        Poll::Pending
    }

    fn send(&mut self, message: &ClientMessage) -> Result<usize, TransportError> {
        if !matches!(self.handshake, Handshake::Established { .. }) {
            return Err(TransportError::NotConnected);
        }
        self.send_packet(message.clone())
    }

    fn receive(&mut self, now: Instant) -> Result<Vec<ServerMessage>, TransportError> {
        if !matches!(self.handshake, Handshake::Established { .. }) {
            return Err(TransportError::NotConnected);
        }

        let mut messages = std::mem::take(&mut self.early_messages);
        let received = self.read_datagrams()?;

        if !received.is_empty() {
            self.last_receive_time = Some(now);
        }

        // Late duplicates of the handshake reply
        messages.extend(
            received
                .into_iter()
                .filter(|m| m.kind() != ServerMessageKind::Welcome),
        );

        let idle = self
            .last_receive_time
            .is_some_and(|last| now.saturating_duration_since(last) > self.config.idle_timeout);
        if idle {
            self.reset();
            return Err(TransportError::TimedOut);
        }

        Ok(messages)
    }

    fn close(&mut self) {
        if let Handshake::Established { .. } = self.handshake {
            if let Err(e) = self.send_packet(ClientMessage::Goodbye) {
                log::debug!("Failed to send goodbye: {}", e);
            }
        }
        self.reset();
    }

    fn stats(&self) -> &NetworkStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Opening,
    Up,
}

type MessageHandler = Box<dyn FnMut(&ServerMessage)>;

pub struct TransportSession<T> {
    transport: T,
    state: LinkState,
    handlers: HashMap<ServerMessageKind, Vec<MessageHandler>>,
}

impl<T: Transport> TransportSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: LinkState::Down,
            handlers: HashMap::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Up
    }

    pub fn stats(&self) -> &NetworkStats {
        self.transport.stats()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn connect(&mut self, endpoint: &str, now: Instant) -> Result<(), ConnectionError> {
        if self.state == LinkState::Up {
            return Ok(());
        }

        match self.transport.open(endpoint, now) {
            Ok(()) => {
                self.state = LinkState::Opening;
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Down;
                Err(e)
            }
        }
    }

    pub fn poll_connect(&mut self, now: Instant) -> Poll<Result<(), ConnectionError>> {
        match self.state {
            LinkState::Up => Poll::Ready(Ok(())),
            LinkState::Down => Poll::Ready(Err(ConnectionError::Handshake(
                "no connection attempt in progress".to_string(),
            ))),
            LinkState::Opening => match self.transport.poll_open(now) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(())) => {
                    self.state = LinkState::Up;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Err(e)) => {
                    self.state = LinkState::Down;
                    Poll::Ready(Err(e))
                }
            },
        }
    }

    pub fn send(&mut self, message: ClientMessage) -> bool {
        if self.state != LinkState::Up {
            log::debug!("Dropping {:?}: link is {:?}", message.kind(), self.state);
            return false;
        }

        match self.transport.send(&message) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Failed to send {:?}: {}", message.kind(), e);
                false
            }
        }
    }

    pub fn on_message<F>(&mut self, kind: ServerMessageKind, handler: F)
    where
        F: FnMut(&ServerMessage) + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Receives and dispatches inbound messages. On error the link is already
    /// marked down.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<ServerMessage>, TransportError> {
        if self.state != LinkState::Up {
            return Ok(Vec::new());
        }

        let messages = match self.transport.receive(now) {
            Ok(messages) => messages,
            Err(e) => {
                self.state = LinkState::Down;
                self.transport.close();
                return Err(e);
            }
        };

        for message in &messages {
            if let Some(handlers) = self.handlers.get_mut(&message.kind()) {
                for handler in handlers.iter_mut() {
                    handler(message);
                }
            }
        }

        Ok(messages)
    }

    pub fn disconnect(&mut self, pending: impl IntoIterator<Item = ClientMessage>) -> bool {
        if self.state == LinkState::Down {
            return false;
        }

        if self.state == LinkState::Up {
            for message in pending {
                self.send(message);
            }
        }

        self.transport.close();
        self.state = LinkState::Down;
        true
    }
}
