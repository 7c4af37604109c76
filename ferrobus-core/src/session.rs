//! Peer sessions and per-channel session bookkeeping.
//!
//! A session is the conversation state kept for one peer on a channel,
//! keyed by the peer's routing ID. Protocols extend the base state with
//! their own fields by embedding [`SessionBase`].

use hashbrown::HashMap;

use crate::endpoint::ZmqAddress;
use crate::error::{Error, Result};
use crate::types::RoutingId;

/// State common to all sessions.
#[derive(Debug, Clone)]
pub struct SessionBase {
    /// Routing ID of the connected peer.
    pub routing_id: RoutingId,
    /// Endpoint address this session was connected to, if any.
    pub endpoint: Option<ZmqAddress>,
    /// Flag indicating that the session is waiting for send.
    pub send_pending: bool,
}

impl SessionBase {
    /// New session state for a peer.
    pub fn new(routing_id: RoutingId) -> Self {
        Self { routing_id, endpoint: None, send_pending: false }
    }
}

/// Per-peer conversation state attached to a channel.
///
/// Protocol-specific session types embed a [`SessionBase`] and expose
/// it through this trait; construction goes through
/// `From<SessionBase>` so the channel can create sessions without
/// knowing the concrete type.
pub trait Session: From<SessionBase> + 'static {
    /// The common session state.
    fn base(&self) -> &SessionBase;

    /// The common session state, mutably.
    fn base_mut(&mut self) -> &mut SessionBase;

    /// Routing ID of the connected peer.
    fn routing_id(&self) -> &RoutingId {
        &self.base().routing_id
    }

    /// Endpoint address this session was connected to, if any.
    fn endpoint(&self) -> Option<&ZmqAddress> {
        self.base().endpoint.as_ref()
    }

    /// Whether the session is waiting for send.
    fn send_pending(&self) -> bool {
        self.base().send_pending
    }

    /// Set or clear the waiting-for-send flag.
    fn set_send_pending(&mut self, value: bool) {
        self.base_mut().send_pending = value;
    }
}

impl Session for SessionBase {
    fn base(&self) -> &SessionBase {
        self
    }

    fn base_mut(&mut self) -> &mut SessionBase {
        self
    }
}

/// Sessions of one channel, keyed by routing ID.
#[derive(Debug)]
pub struct SessionStore<S: Session> {
    map: HashMap<RoutingId, S>,
}

impl<S: Session> Default for SessionStore<S> {
    fn default() -> Self {
        Self { map: HashMap::new() }
    }
}

impl<S: Session> SessionStore<S> {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session for `routing_id`.
    ///
    /// # Errors
    ///
    /// Returns a channel error when a session for the routing ID
    /// already exists.
    pub fn create(&mut self, routing_id: RoutingId) -> Result<&mut S> {
        if self.map.contains_key(&routing_id) {
            return Err(Error::channel(format!(
                "session for route {routing_id} already exists"
            )));
        }
        let session = S::from(SessionBase::new(routing_id.clone()));
        Ok(self.map.entry(routing_id).or_insert(session))
    }

    /// Remove and return the session for `routing_id`.
    pub fn remove(&mut self, routing_id: &RoutingId) -> Option<S> {
        self.map.remove(routing_id)
    }

    /// Session for `routing_id`, if present.
    pub fn get(&self, routing_id: &RoutingId) -> Option<&S> {
        self.map.get(routing_id)
    }

    /// Session for `routing_id`, mutably.
    pub fn get_mut(&mut self, routing_id: &RoutingId) -> Option<&mut S> {
        self.map.get_mut(routing_id)
    }

    /// Returns true if a session for `routing_id` exists.
    pub fn contains(&self, routing_id: &RoutingId) -> bool {
        self.map.contains_key(routing_id)
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no session is active.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over active sessions.
    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.map.values()
    }

    /// Iterate over active sessions, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.map.values_mut()
    }

    /// Routing IDs of all active sessions.
    ///
    /// Handy when a loop must mutate the store while visiting sessions.
    pub fn routing_ids(&self) -> Vec<RoutingId> {
        self.map.keys().cloned().collect()
    }

    /// The single active session.
    ///
    /// Valid only when the channel has exactly one associated session.
    pub fn single(&self) -> Option<&S> {
        if self.map.len() == 1 {
            self.map.values().next()
        } else {
            None
        }
    }

    /// The single active session, mutably.
    pub fn single_mut(&mut self) -> Option<&mut S> {
        if self.map.len() == 1 {
            self.map.values_mut().next()
        } else {
            None
        }
    }

    /// Discard all sessions.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_duplicate() {
        let mut store: SessionStore<SessionBase> = SessionStore::new();
        let rid = RoutingId::internal();
        store.create(rid.clone()).unwrap();
        assert!(store.contains(&rid));
        assert!(store.create(rid.clone()).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_single() {
        let mut store: SessionStore<SessionBase> = SessionStore::new();
        assert!(store.single().is_none());
        store.create(RoutingId::internal()).unwrap();
        assert!(store.single().is_some());
        store.create(RoutingId::generate()).unwrap();
        assert!(store.single().is_none());
    }

    #[test]
    fn test_remove() {
        let mut store: SessionStore<SessionBase> = SessionStore::new();
        let rid = RoutingId::generate();
        store.create(rid.clone()).unwrap();
        let session = store.remove(&rid).unwrap();
        assert_eq!(session.routing_id(), &rid);
        assert!(store.is_empty());
    }

    #[test]
    fn test_send_pending_flag() {
        let mut store: SessionStore<SessionBase> = SessionStore::new();
        let rid = RoutingId::internal();
        store.create(rid.clone()).unwrap();
        let session = store.get_mut(&rid).unwrap();
        assert!(!session.send_pending());
        session.set_send_pending(true);
        assert!(store.get(&rid).unwrap().send_pending());
    }
}
