use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::session::connection_registry::{ConnectionId, ConnectionRegistry, ConnectionState};
use crate::session::control_messages::{ControlMessage, CONTROL_CHANNEL};
use crate::session::poll_loop::{drain_channel, run_poll_loop, run_transport_event_loop};
use crate::session::session_config::SessionConfig;
use crate::session::session_error::SessionError;
use crate::session::session_events::{EventNotifier, ServerDataReceived, ServerError, ServerEvent};
use crate::transport::{Channel, PeerId, PeerTransport, TransportError, TransportEvent};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerState {
    Offline,
    Listening,
}

struct ServerSession {
    state: ServerState,
    registry: ConnectionRegistry,
    max_connections: usize,
    /// incremented on every `listen()`, see [crate::session::client::Client] for the idea
    generation: u64,
    cancel_sender: Option<broadcast::Sender<()>>,
}

impl ServerSession {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state == ServerState::Listening
    }
}

/// The accepting side of sessions: any number of peers (up to a limit) can connect, each of them
///  being known by a [ConnectionId] that is local to the server.
///
/// Lifecycle changes, incoming data and errors are delivered as [ServerEvent]s through
///  [Server::subscribe].
#[derive(Clone)]
pub struct Server {
    config: Arc<SessionConfig>,
    transport: Arc<dyn PeerTransport>,
    session: Arc<RwLock<ServerSession>>,
    events: Arc<EventNotifier<ServerEvent>>,
}

impl Server {
    pub fn new(config: Arc<SessionConfig>, transport: Arc<dyn PeerTransport>) -> anyhow::Result<Server> {
        config.validate()?;

        let events = Arc::new(EventNotifier::new(config.event_buffer_size));
        Ok(Server {
            config,
            transport,
            session: Arc::new(RwLock::new(ServerSession {
                state: ServerState::Offline,
                registry: ConnectionRegistry::new(),
                max_connections: 0,
                generation: 0,
                cancel_sender: None,
            })),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ServerState {
        self.session.read().await.state
    }

    pub async fn is_listening(&self) -> bool {
        self.state().await == ServerState::Listening
    }

    pub async fn connection_count(&self) -> usize {
        self.session.read().await.registry.len()
    }

    /// ids of all registered connections, including those that are being disconnected
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.session.read().await.registry.ids()
    }

    /// Starts accepting connections, at most `max_connections` at a time. Connection ids start
    ///  at 1 again. Calling this while already listening has no effect.
    #[tracing::instrument(skip(self))]
    pub async fn listen(&self, max_connections: usize) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        if session.state == ServerState::Listening {
            warn!("server is already listening - ignoring");
            return Ok(());
        }

        if !self.transport.is_available() {
            return Err(TransportError::Unavailable.into());
        }
        let transport_events = self.transport.subscribe()?;

        let (cancel_sender, _) = broadcast::channel(1);

        session.state = ServerState::Listening;
        session.registry = ConnectionRegistry::new();
        session.max_connections = max_connections;
        session.generation += 1;
        let generation = session.generation;

        tokio::spawn(self.clone().run_control_loop(generation, cancel_sender.subscribe()));
        tokio::spawn(self.clone().run_data_loop(generation, cancel_sender.subscribe()));
        tokio::spawn(self.clone().run_transport_events(generation, transport_events, cancel_sender.subscribe()));
        session.cancel_sender = Some(cancel_sender);

        info!("listening");
        Ok(())
    }

    /// Stops the poll loops. Connections are not disconnected, and their records are kept until
    ///  the next `listen()`.
    pub async fn stop(&self) {
        let mut session = self.session.write().await;
        if session.state == ServerState::Offline {
            debug!("server is not listening - nothing to stop");
            return;
        }

        session.state = ServerState::Offline;
        if let Some(cancel_sender) = session.cancel_sender.take() {
            let _ = cancel_sender.send(());
        }
        info!(num_connections = session.registry.len(), "stopped listening");
    }

    /// Sends DISCONNECT to the connection's peer and removes the connection after the grace
    ///  period, firing [ServerEvent::Disconnected] at that point.
    ///
    /// Returns `false` if there is no such connection. Disconnecting a connection that is
    ///  already being disconnected returns `true` and has no further effect.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let mut session = self.session.write().await;
        let Some(peer) = session.registry.get_by_id(connection_id).map(|r| r.peer()) else {
            warn!(?connection_id, "trying to disconnect an unknown connection");
            return false;
        };

        if session.registry.set_state(connection_id, ConnectionState::Disconnecting) != Some(ConnectionState::Connected) {
            debug!(?connection_id, "connection is already being disconnected");
            return true;
        }

        if let Err(e) = ControlMessage::Disconnect.send_to(self.transport.as_ref(), peer).await {
            warn!(?peer, ?connection_id, "could not send DISCONNECT: {}", e);
        }
        let generation = session.generation;
        drop(session);

        debug!(?peer, ?connection_id, "disconnecting");
        let server = self.clone();
        tokio::spawn(async move {
            sleep(server.config.disconnect_grace_period).await;
            server.complete_disconnect(generation, connection_id).await;
        });
        true
    }

    async fn complete_disconnect(&self, generation: u64, connection_id: ConnectionId) {
        let removed = {
            let mut session = self.session.write().await;
            if session.generation != generation {
                trace!(?connection_id, "server was restarted - connection is gone");
                return;
            }
            match session.registry.get_by_id(connection_id).map(|r| r.state()) {
                Some(ConnectionState::Disconnecting) => session.registry.remove_by_id(connection_id),
                _ => None,
            }
        };

        let Some(record) = removed else {
            trace!(?connection_id, "connection was removed in the meantime");
            return;
        };

        info!(?connection_id, peer = ?record.peer(), "disconnected");
        self.events.send_event(ServerEvent::Disconnected(connection_id));
        if let Err(e) = self.transport.close_session(record.peer()).await {
            debug!(peer = ?record.peer(), "could not close transport session: {}", e);
        }
    }

    /// Sends the same data to several connections. Unknown connection ids are reported as
    ///  [ServerEvent::Error] without affecting the others, while a transport failure aborts the
    ///  call.
    pub async fn send(&self, connection_ids: &[ConnectionId], data: &[u8], channel: Channel) -> Result<(), SessionError> {
        let session = self.session.read().await;
        if session.state != ServerState::Listening {
            return Err(SessionError::NotListening);
        }

        let (channel, mode) = self.config.delivery_mode(channel);
        for &connection_id in connection_ids {
            match session.registry.get_by_id(connection_id) {
                Some(record) => {
                    self.transport.send_packet(record.peer(), data, channel, mode).await?;
                }
                None => {
                    error!(?connection_id, "trying to send to an unknown connection");
                    self.send_error(connection_id, SessionError::UnknownConnection(connection_id));
                }
            }
        }
        Ok(())
    }

    /// The textual address of a connection's peer, as it can be passed to
    ///  [crate::session::client::Client::connect]
    pub async fn peer_address(&self, connection_id: ConnectionId) -> Option<String> {
        let peer = self.session.read().await
            .registry.get_by_id(connection_id)
            .map(|r| r.peer());

        match peer {
            Some(peer) => Some(peer.to_string()),
            None => {
                error!(?connection_id, "trying to get the address of an unknown connection");
                self.send_error(connection_id, SessionError::UnknownConnection(connection_id));
                None
            }
        }
    }

    fn send_error(&self, connection_id: ConnectionId, error: SessionError) {
        self.events.send_event(ServerEvent::Error(ServerError { connection_id, error }));
    }

    async fn run_control_loop(self, generation: u64, cancel: broadcast::Receiver<()>) {
        let poll_interval = self.config.poll_interval;
        run_poll_loop("server control", poll_interval, cancel, move || {
            let server = self.clone();
            async move { server.control_cycle(generation).await }
        }).await;
    }

    async fn control_cycle(&self, generation: u64) -> Result<ControlFlow<()>, TransportError> {
        if !self.session.read().await.is_current(generation) {
            return Ok(ControlFlow::Break(()));
        }

        for packet in drain_channel(self.transport.as_ref(), CONTROL_CHANNEL).await? {
            match ControlMessage::try_deser(&packet.data) {
                Ok(ControlMessage::Connect) => self.on_connect(generation, packet.from).await?,
                Ok(ControlMessage::Disconnect) => self.on_disconnect(generation, packet.from).await?,
                Ok(ControlMessage::AcceptConnect) => {
                    warn!(from = ?packet.from, "received ACCEPT_CONNECT - servers do not connect to peers");
                }
                Err(e) => {
                    debug!(from = ?packet.from, "ignoring control packet: {}", e);
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn on_connect(&self, generation: u64, peer: PeerId) -> Result<(), TransportError> {
        let mut session = self.session.write().await;
        if !session.is_current(generation) {
            return Ok(());
        }

        if let Some((connection_id, state)) = session.registry.get_by_peer(peer).map(|r| (r.id(), r.state())) {
            return match state {
                ConnectionState::Connected => {
                    debug!(?peer, ?connection_id, "repeated CONNECT - sending ACCEPT_CONNECT again");
                    ControlMessage::AcceptConnect.send_to(self.transport.as_ref(), peer).await
                }
                ConnectionState::Disconnecting => {
                    debug!(?peer, ?connection_id, "CONNECT from a peer that is being disconnected - ignoring");
                    Ok(())
                }
            };
        }

        if session.registry.len() >= session.max_connections {
            info!(?peer, max_connections = session.max_connections, "server is full - rejecting connection");
            return ControlMessage::Disconnect.send_to(self.transport.as_ref(), peer).await;
        }

        let connection_id = match session.registry.register(peer) {
            Ok(id) => id,
            Err(e) => {
                error!(?peer, "rejecting connection: {}", e);
                return ControlMessage::Disconnect.send_to(self.transport.as_ref(), peer).await;
            }
        };

        if let Err(e) = ControlMessage::AcceptConnect.send_to(self.transport.as_ref(), peer).await {
            // the peer does not know about the connection, so it must not take up capacity
            session.registry.remove_by_id(connection_id);
            return Err(e);
        }
        info!(?peer, ?connection_id, "accepted connection");
        self.events.send_event(ServerEvent::Connected(connection_id));
        Ok(())
    }

    async fn on_disconnect(&self, generation: u64, peer: PeerId) -> Result<(), TransportError> {
        let removed = {
            let mut session = self.session.write().await;
            if !session.is_current(generation) {
                return Ok(());
            }
            session.registry.remove_by_peer(peer)
        };

        match removed {
            Some(record) => {
                info!(?peer, connection_id = ?record.id(), "peer disconnected");
                self.events.send_event(ServerEvent::Disconnected(record.id()));
                self.transport.close_session(peer).await
            }
            None => {
                error!(?peer, "DISCONNECT from an unknown peer");
                self.send_error(ConnectionId::UNKNOWN, SessionError::UnknownPeer(peer));
                Ok(())
            }
        }
    }

    async fn run_data_loop(self, generation: u64, cancel: broadcast::Receiver<()>) {
        let poll_interval = self.config.poll_interval;
        run_poll_loop("server data", poll_interval, cancel, move || {
            let server = self.clone();
            async move { server.data_cycle(generation).await }
        }).await;
    }

    async fn data_cycle(&self, generation: u64) -> Result<ControlFlow<()>, TransportError> {
        if !self.session.read().await.is_current(generation) {
            return Ok(ControlFlow::Break(()));
        }

        for channel in 0..self.config.num_channels() {
            let packets = drain_channel(self.transport.as_ref(), channel).await?;
            if packets.is_empty() {
                continue;
            }

            let mut unknown_peers = Vec::new();
            {
                let mut session = self.session.write().await;
                for packet in packets {
                    if packet.data.is_empty() {
                        continue;
                    }
                    match session.registry.touch(packet.from) {
                        Some(connection_id) => self.events.send_event(ServerEvent::DataReceived(ServerDataReceived {
                            connection_id,
                            data: packet.data,
                            channel,
                        })),
                        None => unknown_peers.push(packet.from),
                    }
                }
            }

            for peer in unknown_peers {
                error!(?peer, channel, "data from an unknown peer - closing its session");
                let closed = self.transport.close_session(peer).await;
                self.send_error(ConnectionId::UNKNOWN, SessionError::UnknownPeer(peer));
                closed?;
            }
        }

        if let Some(idle_timeout) = self.config.idle_timeout {
            self.disconnect_idle_connections(idle_timeout).await;
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn disconnect_idle_connections(&self, idle_timeout: Duration) {
        let idle = self.session.read().await
            .registry.idle_connections(idle_timeout);

        for (connection_id, idle_time) in idle {
            warn!(?connection_id, ?idle_time, "connection is idle - disconnecting");
            self.send_error(connection_id, SessionError::IdleTimeout { connection_id, idle_time });
            self.disconnect(connection_id).await;
        }
    }

    async fn run_transport_events(self, generation: u64, transport_events: broadcast::Receiver<TransportEvent>, cancel: broadcast::Receiver<()>) {
        run_transport_event_loop("server", transport_events, cancel, move |event| {
            let server = self.clone();
            async move {
                match event {
                    TransportEvent::SessionRequested(peer) => server.on_session_requested(generation, peer).await,
                    TransportEvent::SessionFailed { peer, reason } => server.on_session_failed(generation, peer, reason).await,
                }
            }
        }).await;
    }

    async fn on_session_requested(&self, generation: u64, peer: PeerId) {
        if !self.session.read().await.is_current(generation) {
            return;
        }

        trace!(?peer, "accepting transport session");
        if let Err(e) = self.transport.accept_session(peer).await {
            warn!(?peer, "could not accept transport session: {}", e);
        }
    }

    async fn on_session_failed(&self, generation: u64, peer: PeerId, reason: String) {
        let removed = {
            let mut session = self.session.write().await;
            if !session.is_current(generation) {
                return;
            }
            session.registry.remove_by_peer(peer)
        };

        match removed {
            Some(record) => {
                let error = SessionError::SessionFailed { peer, reason };
                error!(connection_id = ?record.id(), "{}", error);
                self.send_error(record.id(), error);
                self.events.send_event(ServerEvent::Disconnected(record.id()));
            }
            None => {
                debug!(?peer, "transport session failed for a peer without connection: {}", reason);
            }
        }
    }
}
