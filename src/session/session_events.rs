use std::fmt::Debug;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

use crate::session::connection_registry::ConnectionId;
use crate::session::session_error::SessionError;
use crate::transport::Channel;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    DataReceived(ReceivedData),
    Error(SessionError),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedData {
    pub data: Bytes,
    pub channel: Channel,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    DataReceived(ServerDataReceived),
    /// Errors that can not be attributed to a registered connection carry
    ///  [ConnectionId::UNKNOWN].
    Error(ServerError),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerDataReceived {
    pub connection_id: ConnectionId,
    pub data: Bytes,
    pub channel: Channel,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerError {
    pub connection_id: ConnectionId,
    pub error: SessionError,
}


pub struct EventNotifier<E: Clone + Debug> {
    sender: broadcast::Sender<E>,
}
impl <E: Clone + Debug> EventNotifier<E> {
    pub fn new(buffer_size: usize) -> EventNotifier<E> {
        let (sender, _) = broadcast::channel(buffer_size);

        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: E) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
