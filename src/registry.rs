use std::collections::HashMap;
use std::sync::Arc;

use crate::session::{SessionHandle, SessionId};

/// The set of live sessions.
///
/// Owned by the event loop and mutated only there, so there is no locking.
/// Membership decides whether a session still takes part in the shutdown
/// sweep.
pub struct SessionRegistry<S> {
    sessions: HashMap<SessionId, Arc<S>>,
}

impl<S: SessionHandle> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SessionHandle> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Register a session under its own id.
    pub fn add(&mut self, session: Arc<S>) {
        let id = session.id();
        if self.sessions.insert(id, session).is_some() {
            tracing::warn!(session = %id, "replaced a registered session with the same id");
        }
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<Arc<S>> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Arc<S>> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Ids of every registered session, in no particular order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Remove and return every session.
    pub fn drain(&mut self) -> Vec<Arc<S>> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
