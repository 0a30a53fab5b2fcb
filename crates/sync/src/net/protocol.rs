use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4152_4E41;
pub const DEFAULT_PORT: u16 = 27016;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

pub type EntityId = u32;
pub type RoomId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

/// Wrapping "newer than" comparison for packet and entity sequences.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ParticipantStats {
    pub health: i32,
    pub resource_capacity: u32,
    pub resources_in_use: u32,
    pub power: u32,
    pub speed_multiplier: f32,
    pub alive: bool,
}

impl Default for ParticipantStats {
    fn default() -> Self {
        Self {
            health: 100,
            resource_capacity: 1,
            resources_in_use: 0,
            power: 5,
            speed_multiplier: 1.0,
            alive: true,
        }
    }
}

impl ParticipantStats {
    pub fn resources_available(&self) -> u32 {
        self.resource_capacity.saturating_sub(self.resources_in_use)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ParticipantState {
    pub id: EntityId,
    pub sequence: u32,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub stats: ParticipantStats,
}

impl ParticipantState {
    pub fn new(id: EntityId, name: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            id,
            sequence: 0,
            name: name.into(),
            x,
            y,
            stats: ParticipantStats::default(),
        }
    }

    pub fn position(&self) -> glam::Vec2 {
        glam::Vec2::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SessionSnapshot {
    pub participants: Vec<ParticipantState>,
    pub in_progress: bool,
    pub round_time_remaining_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientMessageKind {
    Hello,
    Goodbye,
    CreateRoom,
    JoinRoom,
    PlaceAction,
    CollectAction,
    PositionUpdate,
    PingRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Immediate,
    LatestWins,
}

impl Delivery {
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ClientMessage {
    Hello { client_salt: u64 },
    Goodbye,
    CreateRoom { name: String, max_players: u8 },
    JoinRoom { room_id: RoomId, name: String },
    PlaceAction { x: f32, y: f32 },
    CollectAction { target_id: u32 },
    PositionUpdate { x: f32, y: f32 },
    PingRequest { timestamp: u64 },
}

impl ClientMessage {
    pub fn kind(&self) -> ClientMessageKind {
        match self {
            Self::Hello { .. } => ClientMessageKind::Hello,
            Self::Goodbye => ClientMessageKind::Goodbye,
            Self::CreateRoom { .. } => ClientMessageKind::CreateRoom,
            Self::JoinRoom { .. } => ClientMessageKind::JoinRoom,
            Self::PlaceAction { .. } => ClientMessageKind::PlaceAction,
            Self::CollectAction { .. } => ClientMessageKind::CollectAction,
            Self::PositionUpdate { .. } => ClientMessageKind::PositionUpdate,
            Self::PingRequest { .. } => ClientMessageKind::PingRequest,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Self::PositionUpdate { .. } => Delivery::LatestWins,

            Self::Hello { .. }
            | Self::Goodbye
            | Self::CreateRoom { .. }
            | Self::JoinRoom { .. }
            | Self::PlaceAction { .. }
            | Self::CollectAction { .. }
            | Self::PingRequest { .. } => Delivery::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerMessageKind {
    Welcome,
    RoomCreated,
    RoomJoined,
    ParticipantJoined,
    ParticipantLeft,
    SessionStarted,
    SessionStateSync,
    SessionEnded,
    ErrorNotice,
    Disconnected,
    RemotePositionUpdate,
    ActionPlaced,
    ActionResolved,
    ResourceCollected,
    PingResponse,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ServerMessage {
    Welcome {
        session_salt: u64,
    },
    RoomCreated {
        room_id: RoomId,
        local_id: EntityId,
    },
    RoomJoined {
        room_id: RoomId,
        local_id: EntityId,
        initial_state: SessionSnapshot,
    },
    ParticipantJoined {
        participant: ParticipantState,
    },
    ParticipantLeft {
        id: EntityId,
    },
    SessionStarted {
        initial_state: SessionSnapshot,
    },
    SessionStateSync {
        state: SessionSnapshot,
    },
    SessionEnded {
        winner_id: Option<EntityId>,
    },
    ErrorNotice {
        message: String,
    },
    Disconnected,
    RemotePositionUpdate {
        id: EntityId,
        sequence: u32,
        x: f32,
        y: f32,
    },
    ActionPlaced {
        action_id: u32,
        owner_id: EntityId,
        x: f32,
        y: f32,
    },
    ActionResolved {
        action_id: u32,
        participants: Vec<ParticipantState>,
        removed_targets: Vec<u32>,
    },
    ResourceCollected {
        target_id: u32,
        collector_id: EntityId,
        participants: Vec<ParticipantState>,
    },
    PingResponse {
        timestamp: u64,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> ServerMessageKind {
        match self {
            Self::Welcome { .. } => ServerMessageKind::Welcome,
            Self::RoomCreated { .. } => ServerMessageKind::RoomCreated,
            Self::RoomJoined { .. } => ServerMessageKind::RoomJoined,
            Self::ParticipantJoined { .. } => ServerMessageKind::ParticipantJoined,
            Self::ParticipantLeft { .. } => ServerMessageKind::ParticipantLeft,
            Self::SessionStarted { .. } => ServerMessageKind::SessionStarted,
            Self::SessionStateSync { .. } => ServerMessageKind::SessionStateSync,
            Self::SessionEnded { .. } => ServerMessageKind::SessionEnded,
            Self::ErrorNotice { .. } => ServerMessageKind::ErrorNotice,
            Self::Disconnected => ServerMessageKind::Disconnected,
            Self::RemotePositionUpdate { .. } => ServerMessageKind::RemotePositionUpdate,
            Self::ActionPlaced { .. } => ServerMessageKind::ActionPlaced,
            Self::ActionResolved { .. } => ServerMessageKind::ActionResolved,
            Self::ResourceCollected { .. } => ServerMessageKind::ResourceCollected,
            Self::PingResponse { .. } => ServerMessageKind::PingResponse,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("packet of {0} bytes exceeds MTU")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ClientPacket {
    pub header: PacketHeader,
    pub payload: ClientMessage,
}

impl ClientPacket {
    pub fn new(header: PacketHeader, payload: ClientMessage) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let data = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        check_size(data)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let aligned = aligned_copy(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ServerPacket {
    pub header: PacketHeader,
    pub payload: ServerMessage,
}

impl ServerPacket {
    pub fn new(header: PacketHeader, payload: ServerMessage) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let data = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        check_size(data)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let aligned = aligned_copy(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

// Receive buffers carry no alignment guarantee.
fn aligned_copy(data: &[u8]) -> AlignedVec {
    let mut aligned = AlignedVec::with_capacity(data.len());
    aligned.extend_from_slice(data);
    aligned
}

fn check_size(data: Vec<u8>) -> Result<Vec<u8>, PacketError> {
    if data.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(data.len()));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(!sequence_greater_than(7, 7));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_delivery_classes() {
        assert_eq!(
            ClientMessage::PositionUpdate { x: 1.0, y: 2.0 }.delivery(),
            Delivery::LatestWins
        );
        assert!(ClientMessage::PlaceAction { x: 1.0, y: 2.0 }
            .delivery()
            .is_immediate());
        assert!(ClientMessage::CollectAction { target_id: 3 }
            .delivery()
            .is_immediate());
        assert!(ClientMessage::JoinRoom {
            room_id: "abc".to_string(),
            name: "p".to_string()
        }
        .delivery()
        .is_immediate());
    }

    #[test]
    fn test_server_packet_serialization() {
        let mut participant = ParticipantState::new(2, "Bea", 64.0, 704.0);
        participant.stats.health = 70;
        let state = SessionSnapshot {
            participants: vec![participant.clone()],
            in_progress: true,
            round_time_remaining_ms: 90_000,
        };
        let packet = ServerPacket::new(
            PacketHeader::new(9),
            ServerMessage::RoomJoined {
                room_id: "room-1".to_string(),
                local_id: 2,
                initial_state: state.clone(),
            },
        );

        let bytes = packet.serialize().unwrap();
        let decoded = ServerPacket::deserialize(&bytes).unwrap();

        assert_eq!(decoded.header, packet.header);
        match decoded.payload {
            ServerMessage::RoomJoined {
                local_id,
                initial_state,
                ..
            } => {
                assert_eq!(local_id, 2);
                assert_eq!(initial_state, state);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        let garbage = [0xAAu8; 24];
        assert!(ServerPacket::deserialize(&garbage).is_err());
    }

    #[test]
    fn test_oversized_packet_is_rejected() {
        let packet = ClientPacket::new(
            PacketHeader::new(0),
            ClientMessage::CreateRoom {
                name: "x".repeat(MAX_PACKET_SIZE * 2),
                max_players: 4,
            },
        );
        assert!(matches!(packet.serialize(), Err(PacketError::TooLarge(_))));
    }
}
