//! Per-conversation mutual exclusion for in-flight turns.
//!
//! At most one turn may be in flight per conversation: concurrent turns on
//! one conversation indicate a client bug or duplicate submission, so the
//! second caller fails fast with `ConversationBusy` rather than queueing.
//! The permit is RAII — dropping it (including on panic or task abort after
//! the fallback persistence path) releases the conversation.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Tracks which conversations currently have a turn in flight.
#[derive(Clone, Default)]
pub struct TurnGuard {
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl TurnGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim a conversation for one turn.
    ///
    /// Returns `None` when a turn is already in flight. The claim is held
    /// until the returned [`TurnPermit`] is dropped.
    pub fn try_acquire(&self, conversation_id: Uuid) -> Option<TurnPermit> {
        match self.in_flight.entry(conversation_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(TurnPermit {
                    conversation_id,
                    in_flight: Arc::clone(&self.in_flight),
                })
            }
        }
    }

    /// Number of conversations with a turn currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// RAII claim on a conversation; released on drop.
pub struct TurnPermit {
    conversation_id: Uuid,
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.in_flight.remove(&self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let guard = TurnGuard::new();
        let id = Uuid::now_v7();

        let permit = guard.try_acquire(id).expect("first acquire");
        assert!(guard.try_acquire(id).is_none());
        assert_eq!(guard.in_flight_count(), 1);

        drop(permit);
        assert!(guard.try_acquire(id).is_some());
    }

    #[test]
    fn test_distinct_conversations_independent() {
        let guard = TurnGuard::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        let _pa = guard.try_acquire(a).expect("acquire a");
        let _pb = guard.try_acquire(b).expect("acquire b");
        assert_eq!(guard.in_flight_count(), 2);
    }

    #[test]
    fn test_clone_shares_state() {
        let guard = TurnGuard::new();
        let other = guard.clone();
        let id = Uuid::now_v7();

        let _permit = guard.try_acquire(id).expect("acquire");
        assert!(other.try_acquire(id).is_none());
    }
}
