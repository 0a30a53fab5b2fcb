pub use crate::net::{EntityId, ParticipantState, ParticipantStats};

/// Which update rule an entity follows. The local entity is predicted and
/// corrected; remote entities are only interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityHandle {
    Local(EntityId),
    Remote(EntityId),
}

impl EntityHandle {
    pub fn classify(local_id: Option<EntityId>, id: EntityId) -> Self {
        if local_id == Some(id) {
            Self::Local(id)
        } else {
            Self::Remote(id)
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Self::Local(id) | Self::Remote(id) => *id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(EntityHandle::classify(Some(3), 3), EntityHandle::Local(3));
        assert_eq!(EntityHandle::classify(Some(3), 4), EntityHandle::Remote(4));
        assert_eq!(EntityHandle::classify(None, 3), EntityHandle::Remote(3));
        assert_eq!(EntityHandle::Remote(9).id(), 9);
    }
}
