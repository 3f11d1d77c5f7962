//! An in-process packet network for tests and demos. Every endpoint has per-channel FIFO queues,
//!  so packets on a given channel arrive complete and in order regardless of delivery mode.
//!
//! Transport-level sessions are tracked loosely: sending to a peer opens a session on the
//!  sender's side, and the first packet from a peer without an accepted session raises a
//!  [TransportEvent::SessionRequested] on the receiving side. Packets are queued whether or not
//!  the session was accepted, leaving the decision to the receiver. Closing a session discards
//!  the packets from that peer that were not polled yet.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use crate::transport::{Channel, DeliveryMode, PeerId, PeerTransport, ReceivedPacket, TransportError, TransportEvent};

/// a record of a packet that was handed to the network, kept for inspection by tests
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SentPacket {
    pub to: PeerId,
    pub channel: Channel,
    pub mode: DeliveryMode,
    pub data: Bytes,
}

struct EndpointState {
    available: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    inbox: FxHashMap<Channel, VecDeque<ReceivedPacket>>,
    sessions: FxHashSet<PeerId>,
    requested_sessions: FxHashSet<PeerId>,
    sent: Vec<SentPacket>,
    closed_sessions: Vec<PeerId>,
}
impl EndpointState {
    fn new() -> EndpointState {
        let (events, _) = broadcast::channel(64);
        EndpointState {
            available: Arc::new(AtomicBool::new(true)),
            events,
            inbox: Default::default(),
            sessions: Default::default(),
            requested_sessions: Default::default(),
            sent: Default::default(),
            closed_sessions: Default::default(),
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn notify(&self, event: TransportEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    endpoints: Arc<RwLock<FxHashMap<PeerId, EndpointState>>>,
}

impl InMemoryNetwork {
    pub fn new() -> InMemoryNetwork {
        Default::default()
    }

    /// Returns the transport for a given peer id, registering the peer with the network on first
    ///  use. Several handles for the same peer share queues and availability.
    pub async fn endpoint(&self, peer: PeerId) -> InMemoryTransport {
        let mut endpoints = self.endpoints.write().await;
        let state = endpoints.entry(peer)
            .or_insert_with(EndpointState::new);

        InMemoryTransport {
            myself: peer,
            available: state.available.clone(),
            events: state.events.clone(),
            network: self.clone(),
        }
    }

    pub async fn sent_packets(&self, peer: PeerId) -> Vec<SentPacket> {
        self.endpoints.read().await
            .get(&peer)
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    /// the peers that `peer` closed sessions with, in call order
    pub async fn closed_sessions(&self, peer: PeerId) -> Vec<PeerId> {
        self.endpoints.read().await
            .get(&peer)
            .map(|s| s.closed_sessions.clone())
            .unwrap_or_default()
    }

    pub async fn has_session(&self, peer: PeerId, with: PeerId) -> bool {
        self.endpoints.read().await
            .get(&peer)
            .map(|s| s.sessions.contains(&with))
            .unwrap_or(false)
    }

    pub async fn num_pending_packets(&self, peer: PeerId, channel: Channel) -> usize {
        self.endpoints.read().await
            .get(&peer)
            .and_then(|s| s.inbox.get(&channel))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Simulates a transport-level session failure as seen by `peer`: the session with `with` is
    ///  dropped, and `peer` is notified.
    pub async fn fail_session(&self, peer: PeerId, with: PeerId, reason: &str) {
        if let Some(state) = self.endpoints.write().await.get_mut(&peer) {
            state.sessions.remove(&with);
            state.requested_sessions.remove(&with);
            state.notify(TransportEvent::SessionFailed { peer: with, reason: reason.to_string() });
        }
    }

    /// Puts a packet directly into a peer's queue, bypassing the sender side. This is for
    ///  simulating traffic from peers that do not have an endpoint of their own.
    pub async fn inject_packet(&self, to: PeerId, from: PeerId, channel: Channel, data: &[u8]) {
        if let Some(state) = self.endpoints.write().await.get_mut(&to) {
            state.inbox.entry(channel)
                .or_default()
                .push_back(ReceivedPacket { from, data: Bytes::copy_from_slice(data) });
        }
    }
}

pub struct InMemoryTransport {
    myself: PeerId,
    available: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    pub fn peer_id(&self) -> PeerId {
        self.myself
    }

    /// Makes this endpoint unavailable, as if the networking layer was torn down. All further
    ///  calls fail with [TransportError::Unavailable].
    pub fn shutdown(&self) {
        debug!(peer = ?self.myself, "shutting down in-memory transport");
        self.available.store(false, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        }
        else {
            Err(TransportError::Unavailable)
        }
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    async fn send_packet(&self, to: PeerId, data: &[u8], channel: Channel, mode: DeliveryMode) -> Result<(), TransportError> {
        self.check_available()?;
        if data.len() > mode.max_packet_size() {
            return Err(TransportError::PacketTooLarge { len: data.len(), max: mode.max_packet_size() });
        }

        let data = Bytes::copy_from_slice(data);
        let mut endpoints = self.network.endpoints.write().await;

        if let Some(own) = endpoints.get_mut(&self.myself) {
            own.sent.push(SentPacket { to, channel, mode, data: data.clone() });
            own.sessions.insert(to);
        }

        match endpoints.get_mut(&to) {
            Some(recipient) if recipient.is_available() => {
                if !recipient.sessions.contains(&self.myself) && recipient.requested_sessions.insert(self.myself) {
                    recipient.notify(TransportEvent::SessionRequested(self.myself));
                }
                trace!(from = ?self.myself, ?to, channel, len = data.len(), "delivering packet");
                recipient.inbox.entry(channel)
                    .or_default()
                    .push_back(ReceivedPacket { from: self.myself, data });
            }
            _ => {
                trace!(from = ?self.myself, ?to, "recipient is not reachable - dropping packet");
            }
        }
        Ok(())
    }

    async fn poll_packet(&self, channel: Channel) -> Result<Option<ReceivedPacket>, TransportError> {
        self.check_available()?;
        Ok(self.network.endpoints.write().await
            .get_mut(&self.myself)
            .and_then(|s| s.inbox.get_mut(&channel))
            .and_then(|q| q.pop_front()))
    }

    async fn accept_session(&self, peer: PeerId) -> Result<(), TransportError> {
        self.check_available()?;
        if let Some(own) = self.network.endpoints.write().await.get_mut(&self.myself) {
            own.requested_sessions.remove(&peer);
            own.sessions.insert(peer);
        }
        Ok(())
    }

    async fn close_session(&self, peer: PeerId) -> Result<(), TransportError> {
        self.check_available()?;
        if let Some(own) = self.network.endpoints.write().await.get_mut(&self.myself) {
            own.requested_sessions.remove(&peer);
            own.sessions.remove(&peer);
            own.closed_sessions.push(peer);
            for queue in own.inbox.values_mut() {
                queue.retain(|p| p.from != peer);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<TransportEvent>, TransportError> {
        self.check_available()?;
        Ok(self.events.subscribe())
    }
}
