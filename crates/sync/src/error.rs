use std::io;

use crate::net::{EntityId, PacketError, ServerMessageKind};
use crate::session::ConnectionState;

/// Failure to establish a link. Recovered by the lifecycle manager's bounded
/// retry before it becomes fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection attempt timed out")]
    TimedOut,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("no traffic from peer within the idle timeout")]
    TimedOut,
    #[error("link closed by peer")]
    Closed,
    #[error(transparent)]
    Codec(#[from] PacketError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// A single malformed or out-of-place message. Logged and discarded; never
/// tears the session down.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] PacketError),
    #[error("packet header has wrong magic or version")]
    InvalidHeader,
    #[error("unexpected {kind:?} while {state:?}")]
    Unexpected {
        kind: ServerMessageKind,
        state: ConnectionState,
    },
    #[error("local id already assigned as {current}, server sent {received}")]
    IdentityReassigned {
        current: EntityId,
        received: EntityId,
    },
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
}
