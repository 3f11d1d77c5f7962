use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::transport::PeerId;

/// A server's local name for a logical connection. Real connections have positive ids, which are
///  assigned in increasing order and never reused while the server keeps listening. Zero and
///  negative values are sentinels.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub i32);

impl ConnectionId {
    /// attached to errors that can not be attributed to a known connection
    pub const UNKNOWN: ConnectionId = ConnectionId(-1);
    pub const FIRST: ConnectionId = ConnectionId(1);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Connected,
    /// DISCONNECT was sent, the record is removed once the grace period is over
    Disconnecting,
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    peer: PeerId,
    id: ConnectionId,
    state: ConnectionState,
    last_activity: Instant,
}
impl ConnectionRecord {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// time since the connection was established or last received data
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Bidirectional index of connections by peer and by connection id. Records can only be added and
///  removed through this type, so both directions always refer to the same set of records.
pub struct ConnectionRegistry {
    by_id: FxHashMap<ConnectionId, ConnectionRecord>,
    id_by_peer: FxHashMap<PeerId, ConnectionId>,
    next_id: ConnectionId,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            by_id: Default::default(),
            id_by_peer: Default::default(),
            next_id: ConnectionId::FIRST,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Adds a new connection in state [ConnectionState::Connected], assigning the next id.
    pub fn register(&mut self, peer: PeerId) -> anyhow::Result<ConnectionId> {
        if let Some(existing) = self.id_by_peer.get(&peer) {
            bail!("peer {:?} is already registered as connection {:?}", peer, existing);
        }

        let id = self.next_id;
        self.next_id = ConnectionId(id.0.checked_add(1)
            .ok_or_else(|| anyhow!("connection ids are exhausted"))?);

        self.id_by_peer.insert(peer, id);
        self.by_id.insert(id, ConnectionRecord {
            peer,
            id,
            state: ConnectionState::Connected,
            last_activity: Instant::now(),
        });
        Ok(id)
    }

    pub fn get_by_id(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.by_id.get(&id)
    }

    pub fn get_by_peer(&self, peer: PeerId) -> Option<&ConnectionRecord> {
        self.id_by_peer.get(&peer)
            .and_then(|id| self.by_id.get(id))
    }

    /// returns the previous state, or `None` if there is no such connection
    pub fn set_state(&mut self, id: ConnectionId, state: ConnectionState) -> Option<ConnectionState> {
        self.by_id.get_mut(&id)
            .map(|record| std::mem::replace(&mut record.state, state))
    }

    /// Records activity from a peer, returning its connection id if it is registered
    pub fn touch(&mut self, peer: PeerId) -> Option<ConnectionId> {
        let id = *self.id_by_peer.get(&peer)?;
        let record = self.by_id.get_mut(&id)?;
        record.last_activity = Instant::now();
        Some(id)
    }

    pub fn remove_by_id(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        let record = self.by_id.remove(&id)?;
        self.id_by_peer.remove(&record.peer);
        Some(record)
    }

    pub fn remove_by_peer(&mut self, peer: PeerId) -> Option<ConnectionRecord> {
        let id = self.id_by_peer.remove(&peer)?;
        self.by_id.remove(&id)
    }

    /// all connection ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids = self.by_id.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// connections in state [ConnectionState::Connected] that were idle for longer than the timeout
    pub fn idle_connections(&self, timeout: Duration) -> Vec<(ConnectionId, Duration)> {
        let mut result = self.by_id.values()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| (r.id, r.idle_time()))
            .filter(|(_, idle_time)| *idle_time > timeout)
            .collect::<Vec<_>>();
        result.sort();
        result
    }
}
