use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::task::Poll;
use std::time::{Duration, Instant};

use super::protocol::{ClientMessage, ClientPacket, PacketHeader, ServerMessage, ServerPacket};
use super::stats::{NetworkStats, PacketLossSimulation};
use super::transport::Transport;
use crate::error::{ConnectionError, TransportError};

#[derive(Debug)]
struct InFlight {
    deliver_at: Instant,
    sequence: u64,
    datagram: Vec<u8>,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.sequence == other.sequence
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .deliver_at
            .cmp(&self.deliver_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug)]
struct Wire {
    clock: Option<Instant>,
    listening: bool,
    refuse_opens: u32,
    open_attempts: u32,
    connected: bool,
    closed_by_server: bool,
    uplink: PacketLossSimulation,
    downlink: PacketLossSimulation,
    to_server: BinaryHeap<InFlight>,
    to_client: BinaryHeap<InFlight>,
    next_sequence: u64,
}

impl Wire {
    fn advance(&mut self, now: Instant) -> Instant {
        let now = match self.clock {
            Some(clock) if clock > now => clock,
            _ => now,
        };
        self.clock = Some(now);
        now
    }

    fn now(&self) -> Instant {
        self.clock.unwrap_or_else(Instant::now)
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

fn take_due(queue: &mut BinaryHeap<InFlight>, now: Instant) -> Vec<Vec<u8>> {
    let mut due = Vec::new();
    while queue.peek().is_some_and(|m| m.deliver_at <= now) {
        if let Some(in_flight) = queue.pop() {
            due.push(in_flight.datagram);
        }
    }
    due
}

#[derive(Debug)]
pub struct LoopbackTransport {
    wire: Rc<RefCell<Wire>>,
    opening: Option<Result<(), ConnectionError>>,
    send_sequence: u32,
    stats: NetworkStats,
}

#[derive(Debug)]
pub struct LoopbackServer {
    wire: Rc<RefCell<Wire>>,
    send_sequence: u32,
}

pub fn loopback_pair() -> (LoopbackTransport, LoopbackServer) {
    let wire = Rc::new(RefCell::new(Wire {
        clock: None,
        listening: true,
        refuse_opens: 0,
        open_attempts: 0,
        connected: false,
        closed_by_server: false,
        uplink: PacketLossSimulation::default(),
        downlink: PacketLossSimulation::default(),
        to_server: BinaryHeap::new(),
        to_client: BinaryHeap::new(),
        next_sequence: 0,
    }));

    let transport = LoopbackTransport {
        wire: Rc::clone(&wire),
        opening: None,
        send_sequence: 0,
        stats: NetworkStats::default(),
    };
    let server = LoopbackServer {
        wire,
        send_sequence: 0,
    };

    (transport, server)
}

impl Transport for LoopbackTransport {
    fn open(&mut self, endpoint: &str, now: Instant) -> Result<(), ConnectionError> {
        let mut wire = self.wire.borrow_mut();
        wire.advance(now);
        wire.open_attempts += 1;
        wire.closed_by_server = false;

        let outcome = if wire.refuse_opens > 0 {
            wire.refuse_opens -= 1;
            Err(ConnectionError::Unreachable(endpoint.to_string()))
        } else if !wire.listening {
            Err(ConnectionError::Unreachable(endpoint.to_string()))
        } else {
            Ok(())
        };

        self.opening = Some(outcome);
        Ok(())
    }

    fn poll_open(&mut self, now: Instant) -> Poll<Result<(), ConnectionError>> {
        let mut wire = self.wire.borrow_mut();
        wire.advance(now);

        match self.opening.take() {
            Some(Ok(())) => {
                wire.connected = true;
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(e)),
            None if wire.connected => Poll::Ready(Ok(())),
            None => Poll::Ready(Err(ConnectionError::Handshake(
                "no connection attempt in progress".to_string(),
            ))),
        }
    }

    fn send(&mut self, message: &ClientMessage) -> Result<usize, TransportError> {
        let mut wire = self.wire.borrow_mut();
        if !wire.connected {
            return Err(TransportError::NotConnected);
        }

        let packet = ClientPacket::new(PacketHeader::new(self.send_sequence), message.clone());
        let datagram = packet.serialize()?;
        let bytes = datagram.len();
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        if wire.uplink.should_drop() {
            return Ok(bytes);
        }

        let deliver_at = wire.now() + Duration::from_millis(wire.uplink.delay_ms() as u64);
        let sequence = wire.next_sequence();
        wire.to_server.push(InFlight {
            deliver_at,
            sequence,
            datagram,
        });

        Ok(bytes)
    }

    fn receive(&mut self, now: Instant) -> Result<Vec<ServerMessage>, TransportError> {
        let mut wire = self.wire.borrow_mut();
        let now = wire.advance(now);

        if wire.closed_by_server {
            wire.closed_by_server = false;
            return Err(TransportError::Closed);
        }
        if !wire.connected {
            return Err(TransportError::NotConnected);
        }

        let mut messages = Vec::new();
        for datagram in take_due(&mut wire.to_client, now) {
            match ServerPacket::deserialize(&datagram) {
                Ok(packet) => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += datagram.len() as u64;
                    messages.push(packet.payload);
                }
                Err(e) => log::debug!("Dropping malformed loopback datagram: {}", e),
            }
        }
        Ok(messages)
    }

    fn close(&mut self) {
        let connected = self.wire.borrow().connected;
        if connected {
            if let Err(e) = self.send(&ClientMessage::Goodbye) {
                log::debug!("Failed to send goodbye: {}", e);
            }
        }

        let mut wire = self.wire.borrow_mut();
        wire.connected = false;
        wire.to_client.clear();
        self.opening = None;
    }

    fn stats(&self) -> &NetworkStats {
        &self.stats
    }
}

impl LoopbackServer {
    pub fn take_received(&mut self, now: Instant) -> Vec<ClientMessage> {
        let mut wire = self.wire.borrow_mut();
        let now = wire.advance(now);

        take_due(&mut wire.to_server, now)
            .into_iter()
            .filter_map(|datagram| match ClientPacket::deserialize(&datagram) {
                Ok(packet) => Some(packet.payload),
                Err(e) => {
                    log::debug!("Dropping malformed loopback datagram: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Returns `false` if no client is connected, the message does not fit
    /// in a datagram, or it was lost.
    pub fn send(&mut self, now: Instant, message: ServerMessage) -> bool {
        let mut wire = self.wire.borrow_mut();
        let now = wire.advance(now);
        if !wire.connected {
            return false;
        }

        let kind = message.kind();
        let packet = ServerPacket::new(PacketHeader::new(self.send_sequence), message);
        let datagram = match packet.serialize() {
            Ok(datagram) => datagram,
            Err(e) => {
                log::debug!("Failed to send {:?}: {}", kind, e);
                return false;
            }
        };
        self.send_sequence = self.send_sequence.wrapping_add(1);

        if wire.downlink.should_drop() {
            return false;
        }

        let deliver_at = now + Duration::from_millis(wire.downlink.delay_ms() as u64);
        let sequence = wire.next_sequence();
        wire.to_client.push(InFlight {
            deliver_at,
            sequence,
            datagram,
        });
        true
    }

    pub fn is_connected(&self) -> bool {
        self.wire.borrow().connected
    }

    pub fn set_listening(&mut self, listening: bool) {
        self.wire.borrow_mut().listening = listening;
    }

    pub fn refuse_next_opens(&mut self, count: u32) {
        self.wire.borrow_mut().refuse_opens = count;
    }

    pub fn open_attempts(&self) -> u32 {
        self.wire.borrow().open_attempts
    }

    pub fn drop_connection(&mut self) {
        let mut wire = self.wire.borrow_mut();
        wire.connected = false;
        wire.closed_by_server = true;
        wire.to_client.clear();
        wire.to_server.clear();
    }

    pub fn set_uplink(&mut self, simulation: PacketLossSimulation) {
        self.wire.borrow_mut().uplink = simulation;
    }

    pub fn set_downlink(&mut self, simulation: PacketLossSimulation) {
        self.wire.borrow_mut().downlink = simulation;
    }

    pub fn in_flight(&self) -> usize {
        let wire = self.wire.borrow();
        wire.to_client.len() + wire.to_server.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MAX_PACKET_SIZE;

    #[test]
    fn test_refused_open_resolves_on_poll() {
        let (mut transport, mut server) = loopback_pair();
        server.refuse_next_opens(1);
        let now = Instant::now();

        transport.open("loopback", now).unwrap();
        assert!(matches!(
            transport.poll_open(now),
            Poll::Ready(Err(ConnectionError::Unreachable(_)))
        ));

        transport.open("loopback", now).unwrap();
        assert!(matches!(transport.poll_open(now), Poll::Ready(Ok(()))));
        assert_eq!(server.open_attempts(), 2);
        assert!(server.is_connected());
    }

    #[test]
    fn test_downlink_latency() {
        let (mut transport, mut server) = loopback_pair();
        server.set_downlink(PacketLossSimulation::latency(80));
        let now = Instant::now();
        transport.open("loopback", now).unwrap();
        let _ = transport.poll_open(now);

        assert!(server.send(now, ServerMessage::PingResponse { timestamp: 7 }));
        assert!(
            transport
                .receive(now + Duration::from_millis(79))
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            transport.receive(now + Duration::from_millis(80)).unwrap(),
            vec![ServerMessage::PingResponse { timestamp: 7 }]
        );
    }

    #[test]
    fn test_uplink_preserves_send_order_at_equal_delay() {
        let (mut transport, mut server) = loopback_pair();
        let now = Instant::now();
        transport.open("loopback", now).unwrap();
        let _ = transport.poll_open(now);

        transport.send(&ClientMessage::PingRequest { timestamp: 1 }).unwrap();
        transport.send(&ClientMessage::PingRequest { timestamp: 2 }).unwrap();

        assert_eq!(
            server.take_received(now),
            vec![
                ClientMessage::PingRequest { timestamp: 1 },
                ClientMessage::PingRequest { timestamp: 2 },
            ]
        );
        assert_eq!(transport.stats().packets_sent, 2);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let (mut transport, mut server) = loopback_pair();
        server.set_uplink(PacketLossSimulation {
            enabled: true,
            loss_percent: 100.0,
            ..Default::default()
        });
        let now = Instant::now();
        transport.open("loopback", now).unwrap();
        let _ = transport.poll_open(now);

        transport.send(&ClientMessage::PlaceAction { x: 1.0, y: 2.0 }).unwrap();
        assert!(server.take_received(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_dropped_connection_reports_closed_once() {
        let (mut transport, mut server) = loopback_pair();
        let now = Instant::now();
        transport.open("loopback", now).unwrap();
        let _ = transport.poll_open(now);

        server.drop_connection();
        assert!(matches!(transport.receive(now), Err(TransportError::Closed)));
        assert!(matches!(
            transport.receive(now),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_downlink_goes_through_codec() {
        let (mut transport, mut server) = loopback_pair();
        let now = Instant::now();
        transport.open("loopback", now).unwrap();
        let _ = transport.poll_open(now);

        let oversized = ServerMessage::ErrorNotice {
            message: "x".repeat(MAX_PACKET_SIZE * 2),
        };
        assert!(!server.send(now, oversized));
        assert_eq!(server.in_flight(), 0);

        assert!(server.send(now, ServerMessage::PingResponse { timestamp: 3 }));
        assert_eq!(
            transport.receive(now).unwrap(),
            vec![ServerMessage::PingResponse { timestamp: 3 }]
        );
        assert_eq!(transport.stats().packets_received, 1);
        assert!(transport.stats().bytes_received > 0);
    }

    #[test]
    fn test_close_sends_goodbye() {
        let (mut transport, mut server) = loopback_pair();
        let now = Instant::now();
        transport.open("loopback", now).unwrap();
        let _ = transport.poll_open(now);

        transport.close();
        assert!(!server.is_connected());
        assert_eq!(server.take_received(now), vec![ClientMessage::Goodbye]);

        // Nothing to say once the link is down
        transport.close();
        assert!(server.take_received(now).is_empty());
    }
}
