pub mod in_memory;

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use thiserror::Error;
use tokio::sync::broadcast;


/// Logical channel number of the underlying transport. User data uses channels `0..n` as
///  configured in [crate::session::session_config::SessionConfig], the session layer's own
///  handshake traffic uses a reserved channel above that range.
pub type Channel = u16;

/// Opaque address of a remote endpoint as the packet transport understands it. The session layer
///  never makes one up: it either gets it from the transport, or parses a user-supplied address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(pub u64);

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[peer:{}]", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().parse::<u64>()
            .map_err(|e| anyhow!("peer address {:?} is not a numeric peer id: {}", s, e))?;
        if raw == 0 {
            bail!("0 is not a valid peer id");
        }
        Ok(PeerId(raw))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DeliveryMode {
    /// UDP style: packets may be dropped or arrive out of order
    Unreliable,
    /// like [DeliveryMode::Unreliable], but sent immediately rather than batched
    UnreliableNoDelay,
    /// reliable and ordered per channel
    Reliable,
    /// like [DeliveryMode::Reliable], but the transport may delay sending to batch packets
    ReliableWithBuffering,
}

impl DeliveryMode {
    pub const MAX_RELIABLE_PACKET_SIZE: usize = 1024*1024;
    pub const MAX_UNRELIABLE_PACKET_SIZE: usize = 1200;

    pub fn is_reliable(&self) -> bool {
        match *self {
            DeliveryMode::Reliable | DeliveryMode::ReliableWithBuffering => true,
            DeliveryMode::Unreliable | DeliveryMode::UnreliableNoDelay => false,
        }
    }

    /// Unreliable packets must fit into a single MTU, reliable packets are chunked by the
    ///  transport and can be up to 1 MiB.
    pub fn max_packet_size(&self) -> usize {
        if self.is_reliable() {
            Self::MAX_RELIABLE_PACKET_SIZE
        }
        else {
            Self::MAX_UNRELIABLE_PACKET_SIZE
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedPacket {
    pub from: PeerId,
    pub data: Bytes,
}

/// Notifications about transport-level sessions, which exist independently of (and below) the
///  session layer's logical connections.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    /// a peer we have no open session with started sending to us
    SessionRequested(PeerId),
    SessionFailed { peer: PeerId, reason: String },
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TransportError {
    /// The networking layer is not initialized or was disposed. This is fatal for the current
    ///  operation, and it terminates poll loops.
    #[error("the peer transport is not available")]
    Unavailable,

    #[error("packet of {len} bytes exceeds the maximum of {max} bytes for its delivery mode")]
    PacketTooLarge { len: usize, max: usize },
}

/// This is the contract the session layer consumes from the packet transport. The transport
///  knows peers, channels and delivery modes, but it has no notion of a logical connection.
///
/// All operations fail with [TransportError::Unavailable] if the underlying networking layer is
///  not initialized.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    fn is_available(&self) -> bool;

    async fn send_packet(&self, to: PeerId, data: &[u8], channel: Channel, mode: DeliveryMode) -> Result<(), TransportError>;

    /// non-blocking: returns `None` if there is no packet pending on the channel
    async fn poll_packet(&self, channel: Channel) -> Result<Option<ReceivedPacket>, TransportError>;

    async fn accept_session(&self, peer: PeerId) -> Result<(), TransportError>;

    async fn close_session(&self, peer: PeerId) -> Result<(), TransportError>;

    fn subscribe(&self) -> Result<broadcast::Receiver<TransportEvent>, TransportError>;
}
