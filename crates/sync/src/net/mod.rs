mod loopback;
mod protocol;
mod stats;
mod tracking;
mod transport;

pub use loopback::{LoopbackServer, LoopbackTransport, loopback_pair};
pub use protocol::sequence_greater_than;
pub use protocol::{
    ClientMessage, ClientMessageKind, ClientPacket, DEFAULT_PORT, Delivery, EntityId,
    MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, PacketError, PacketHeader,
    ParticipantState, ParticipantStats, RoomId, ServerMessage, ServerMessageKind, ServerPacket,
    SessionSnapshot,
};
pub use stats::{NetworkStats, PacketLossSimulation, rand_u64};
pub use tracking::ReceiveTracker;
pub use transport::{LinkState, Transport, TransportSession, UdpTransport};
