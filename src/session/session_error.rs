use std::time::Duration;

use thiserror::Error;

use crate::session::connection_registry::ConnectionId;
use crate::transport::{PeerId, TransportError};

/// Failures of session operations. These are returned to callers and / or delivered as error
///  events, so they are cheap to clone.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SessionError {
    #[error("invalid peer address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("client is already connected or connecting")]
    AlreadyConnected,

    #[error("timed out after {0:?} waiting for the server to accept the connection")]
    ConnectTimeout(Duration),

    /// The server answered CONNECT with DISCONNECT, typically because it is at capacity
    #[error("the server rejected the connection")]
    ConnectionRejected,

    #[error("connecting was aborted by a local disconnect")]
    ConnectAborted,

    #[error("not connected")]
    NotConnected,

    #[error("server is not listening")]
    NotListening,

    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),

    #[error("unknown peer {0:?}")]
    UnknownPeer(PeerId),

    #[error("no data received on connection {connection_id:?} for {idle_time:?}")]
    IdleTimeout { connection_id: ConnectionId, idle_time: Duration },

    #[error("transport session with {peer:?} failed: {reason}")]
    SessionFailed { peer: PeerId, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
