use crate::error::ProtocolError;
use crate::net::{EntityId, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Joined,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Joined)
    }
}

/// Per-process session record, mutated only on lifecycle transitions.
#[derive(Debug, Clone)]
pub struct Session {
    state: ConnectionState,
    local_id: Option<EntityId>,
    room_id: Option<RoomId>,
    is_host: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            local_id: None,
            room_id: None,
            is_host: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns `true` if the state actually changed.
    pub fn set_state(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }
        log::debug!("Session {:?} -> {:?}", self.state, state);
        self.state = state;
        true
    }

    pub fn local_id(&self) -> Option<EntityId> {
        self.local_id
    }

    /// The local id is assigned once per connection and never changes.
    pub fn assign_local_id(&mut self, id: EntityId) -> Result<(), ProtocolError> {
        match self.local_id {
            Some(current) if current != id => Err(ProtocolError::IdentityReassigned {
                current,
                received: id,
            }),
            _ => {
                self.local_id = Some(id);
                Ok(())
            }
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn set_room(&mut self, room_id: RoomId) {
        self.room_id = Some(room_id);
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn set_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    pub fn clear(&mut self) {
        self.local_id = None;
        self.room_id = None;
        self.is_host = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_is_immutable() {
        let mut session = Session::new();
        session.assign_local_id(2).unwrap();
        session.assign_local_id(2).unwrap();

        let err = session.assign_local_id(3).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IdentityReassigned {
                current: 2,
                received: 3
            }
        ));
        assert_eq!(session.local_id(), Some(2));
    }

    #[test]
    fn test_clear_allows_new_identity() {
        let mut session = Session::new();
        session.assign_local_id(2).unwrap();
        session.set_room("abc".to_string());
        session.set_host(true);

        session.clear();

        assert_eq!(session.local_id(), None);
        assert_eq!(session.room_id(), None);
        assert!(!session.is_host());
        session.assign_local_id(5).unwrap();
    }

    #[test]
    fn test_state_change_reporting() {
        let mut session = Session::new();
        assert!(session.set_state(ConnectionState::Connecting));
        assert!(!session.set_state(ConnectionState::Connecting));
        assert!(!session.state().is_connected());
        session.set_state(ConnectionState::Joined);
        assert!(session.state().is_connected());
    }
}
