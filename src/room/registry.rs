use std::collections::HashMap;

use crate::room::session::PeerSession;
use crate::signaling::UserId;

/// Returned by [`PeerRegistry::insert`] when a session for the same user already
/// exists. Hands the rejected session back so the caller can destroy it.
pub struct DuplicatePeer(pub PeerSession);

/// Live peer sessions of the current room, at most one per user.
#[derive(Default)]
pub struct PeerRegistry {
    sessions: HashMap<UserId, PeerSession>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: PeerSession) -> Result<&mut PeerSession, DuplicatePeer> {
        use std::collections::hash_map::Entry;

        match self.sessions.entry(session.user_id().to_owned()) {
            Entry::Occupied(_) => Err(DuplicatePeer(session)),
            Entry::Vacant(slot) => Ok(slot.insert(session)),
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&PeerSession> {
        self.sessions.get(user_id)
    }

    pub fn get_mut(&mut self, user_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(user_id)
    }

    pub fn remove(&mut self, user_id: &str) -> Option<PeerSession> {
        self.sessions.remove(user_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}
