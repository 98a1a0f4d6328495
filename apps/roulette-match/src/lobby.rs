use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Per-process connection identity, assigned from an incrementing counter.
pub type ConnId = u64;

pub trait LobbyMember {
    fn id(&self) -> ConnId;
}

impl<T: LobbyMember> LobbyMember for Arc<T> {
    fn id(&self) -> ConnId {
        (**self).id()
    }
}

/// Clients waiting for a partner, keyed by identity.
///
/// A single coarse lock guards the map; `drain_all` swaps the whole map out
/// so a matching tick works on a snapshot while new clients keep arriving.
pub struct Lobby<T> {
    members: Mutex<HashMap<ConnId, T>>,
}

impl<T> Default for Lobby<T> {
    fn default() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: LobbyMember> Lobby<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a member. Adding an identity that is already waiting keeps the
    /// existing entry.
    pub fn add(&self, member: T) {
        self.members.lock().entry(member.id()).or_insert(member);
    }

    /// Takes a member out before a tick reaches it. `None` when it has
    /// already been drained.
    pub fn remove(&self, id: ConnId) -> Option<T> {
        self.members.lock().remove(&id)
    }

    /// Removes and returns every waiting member, leaving the lobby empty.
    pub fn drain_all(&self) -> Vec<T> {
        let drained = std::mem::take(&mut *self.members.lock());
        drained.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pairs consecutive entries. An odd member out is returned separately so the
/// caller can put it back for the next tick.
pub fn pair_up<T>(members: Vec<T>) -> (Vec<(T, T)>, Option<T>) {
    let mut pairs = Vec::with_capacity(members.len() / 2);
    let mut iter = members.into_iter();
    loop {
        match (iter.next(), iter.next()) {
            (Some(first), Some(second)) => pairs.push((first, second)),
            (leftover, _) => return (pairs, leftover),
        }
    }
}
