use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::select;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::session::control_messages::{ControlMessage, CONTROL_CHANNEL};
use crate::session::poll_loop::{drain_channel, run_poll_loop, run_transport_event_loop};
use crate::session::session_config::SessionConfig;
use crate::session::session_error::SessionError;
use crate::session::session_events::{ClientEvent, EventNotifier, ReceivedData};
use crate::transport::{Channel, PeerId, PeerTransport, TransportError, TransportEvent};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    Disconnected,
    /// CONNECT was sent, waiting for ACCEPT_CONNECT
    Connecting,
    Connected,
}

type HandshakeOutcome = Result<(), SessionError>;

struct ClientSession {
    state: ClientState,
    remote_peer: Option<PeerId>,
    /// incremented for every connection attempt. Background tasks belong to a single generation
    ///  and leave everything alone once it is over.
    generation: u64,
    cancel_sender: Option<broadcast::Sender<()>>,
    /// present while a `connect()` call is waiting for the handshake to complete
    handshake: Option<oneshot::Sender<HandshakeOutcome>>,
}

impl ClientSession {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state != ClientState::Disconnected
    }
}

/// The connecting side of a session: a single logical connection to a server peer.
///
/// Incoming data and lifecycle changes are delivered as [ClientEvent]s through [Client::subscribe].
///  A `Client` is a cheap handle, clones share the same session.
#[derive(Clone)]
pub struct Client {
    config: Arc<SessionConfig>,
    transport: Arc<dyn PeerTransport>,
    session: Arc<RwLock<ClientSession>>,
    events: Arc<EventNotifier<ClientEvent>>,
}

impl Client {
    pub fn new(config: Arc<SessionConfig>, transport: Arc<dyn PeerTransport>) -> anyhow::Result<Client> {
        config.validate()?;

        let events = Arc::new(EventNotifier::new(config.event_buffer_size));
        Ok(Client {
            config,
            transport,
            session: Arc::new(RwLock::new(ClientSession {
                state: ClientState::Disconnected,
                remote_peer: None,
                generation: 0,
                cancel_sender: None,
                handshake: None,
            })),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ClientState {
        self.session.read().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ClientState::Connected
    }

    /// the server peer while connecting or connected
    pub async fn remote_peer(&self) -> Option<PeerId> {
        let session = self.session.read().await;
        match session.state {
            ClientState::Disconnected => None,
            _ => session.remote_peer,
        }
    }

    /// Connects to the server peer with the given (textual) address, returning once the server
    ///  accepted the connection. Failures are returned and also reported as [ClientEvent::Error].
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self, address: &str) -> Result<(), SessionError> {
        let (peer, generation, handshake) = match self.start_connecting(address).await {
            Ok(started) => started,
            Err(e) => {
                error!("failed to connect: {}", e);
                self.events.send_event(ClientEvent::Error(e.clone()));
                return Err(e);
            }
        };

        match self.await_handshake(peer, generation, handshake).await {
            Ok(()) => {
                info!(?peer, "connected");
                Ok(())
            }
            Err(e) => {
                error!(?peer, "failed to connect: {}", e);
                self.events.send_event(ClientEvent::Error(e.clone()));
                self.disconnect_generation(generation).await;
                Err(e)
            }
        }
    }

    async fn start_connecting(&self, address: &str) -> Result<(PeerId, u64, oneshot::Receiver<HandshakeOutcome>), SessionError> {
        let mut session = self.session.write().await;
        if session.state != ClientState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }

        let peer = address.parse::<PeerId>()
            .map_err(|e| SessionError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        if !self.transport.is_available() {
            return Err(TransportError::Unavailable.into());
        }
        let transport_events = self.transport.subscribe()?;

        let (cancel_sender, _) = broadcast::channel(1);
        let (handshake_sender, handshake_receiver) = oneshot::channel();

        session.state = ClientState::Connecting;
        session.remote_peer = Some(peer);
        session.generation += 1;
        session.handshake = Some(handshake_sender);
        let generation = session.generation;

        tokio::spawn(self.clone().run_control_loop(generation, cancel_sender.subscribe()));
        tokio::spawn(self.clone().run_transport_events(generation, transport_events, cancel_sender.subscribe()));
        session.cancel_sender = Some(cancel_sender);

        debug!(?peer, generation, "connecting");
        Ok((peer, generation, handshake_receiver))
    }

    async fn await_handshake(&self, peer: PeerId, generation: u64, handshake: oneshot::Receiver<HandshakeOutcome>) -> Result<(), SessionError> {
        // a leftover transport session from an earlier connection must not carry over
        self.transport.close_session(peer).await?;
        ControlMessage::Connect.send_to(self.transport.as_ref(), peer).await?;
        debug!(?peer, "sent CONNECT");

        select! {
            outcome = handshake => {
                outcome.unwrap_or(Err(SessionError::ConnectAborted))
            }
            _ = sleep(self.config.connect_timeout) => {
                self.on_handshake_timeout(generation).await
            }
        }
    }

    async fn on_handshake_timeout(&self, generation: u64) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        if session.generation == generation && session.handshake.take().is_none() && session.state == ClientState::Connected {
            // ACCEPT_CONNECT arrived at the last moment
            return Ok(());
        }
        Err(SessionError::ConnectTimeout(self.config.connect_timeout))
    }

    /// Ends the current connection or connection attempt. This is a no-op if the client is
    ///  already disconnected.
    pub async fn disconnect(&self) {
        let generation = self.session.read().await.generation;
        self.disconnect_generation(generation).await
    }

    async fn disconnect_generation(&self, generation: u64) {
        let peer = {
            let mut session = self.session.write().await;
            if !session.is_current(generation) {
                trace!("not connected - nothing to disconnect");
                return;
            }

            let peer = session.remote_peer;
            if let Some(peer) = peer {
                if let Err(e) = ControlMessage::Disconnect.send_to(self.transport.as_ref(), peer).await {
                    debug!(?peer, "could not send DISCONNECT: {}", e);
                }
            }
            self.mark_disconnected(&mut session, SessionError::ConnectAborted);
            peer
        };

        if let Some(peer) = peer {
            sleep(self.config.disconnect_grace_period).await;
            self.close_transport_session(peer, generation).await;
        }
    }

    fn mark_disconnected(&self, session: &mut ClientSession, handshake_error: SessionError) {
        session.state = ClientState::Disconnected;
        if let Some(cancel_sender) = session.cancel_sender.take() {
            let _ = cancel_sender.send(());
        }
        if let Some(handshake) = session.handshake.take() {
            let _ = handshake.send(Err(handshake_error));
        }

        info!(peer = ?session.remote_peer, "disconnected");
        self.events.send_event(ClientEvent::Disconnected);
    }

    /// closes the transport session unless a newer connection to the same peer uses it by now
    async fn close_transport_session(&self, peer: PeerId, generation: u64) {
        {
            let session = self.session.read().await;
            if session.generation != generation && session.state != ClientState::Disconnected && session.remote_peer == Some(peer) {
                debug!(?peer, "reconnected in the meantime - keeping the transport session");
                return;
            }
        }

        if let Err(e) = self.transport.close_session(peer).await {
            debug!(?peer, "could not close transport session: {}", e);
        }
    }

    /// Sends data to the server. Channels that are not configured fall back to channel 0.
    pub async fn send(&self, data: &[u8], channel: Channel) -> Result<(), SessionError> {
        let peer = {
            let session = self.session.read().await;
            match (session.state, session.remote_peer) {
                (ClientState::Connected, Some(peer)) => peer,
                _ => return Err(SessionError::NotConnected),
            }
        };

        let (channel, mode) = self.config.delivery_mode(channel);
        self.transport.send_packet(peer, data, channel, mode).await?;
        Ok(())
    }

    async fn run_control_loop(self, generation: u64, cancel: broadcast::Receiver<()>) {
        let poll_interval = self.config.poll_interval;
        run_poll_loop("client control", poll_interval, cancel, move || {
            let client = self.clone();
            async move { client.control_cycle(generation).await }
        }).await;
    }

    async fn control_cycle(&self, generation: u64) -> Result<ControlFlow<()>, TransportError> {
        let expected_peer = {
            let session = self.session.read().await;
            if !session.is_current(generation) {
                return Ok(ControlFlow::Break(()));
            }
            session.remote_peer
        };

        for packet in drain_channel(self.transport.as_ref(), CONTROL_CHANNEL).await? {
            let msg = match ControlMessage::try_deser(&packet.data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(from = ?packet.from, "ignoring control packet: {}", e);
                    continue;
                }
            };

            if Some(packet.from) != expected_peer {
                warn!(from = ?packet.from, ?msg, "control message from a peer other than the server - ignoring");
                continue;
            }

            match msg {
                ControlMessage::AcceptConnect => self.on_accept_connect(generation).await,
                ControlMessage::Disconnect => self.on_server_disconnect(generation).await,
                ControlMessage::Connect => warn!(from = ?packet.from, "received CONNECT - clients do not accept connections"),
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn on_accept_connect(&self, generation: u64) {
        let mut session = self.session.write().await;
        if session.generation != generation || session.state != ClientState::Connecting {
            debug!("received ACCEPT_CONNECT while not connecting - ignoring");
            return;
        }
        let Some(handshake) = session.handshake.take() else {
            debug!("received ACCEPT_CONNECT after connecting timed out - ignoring");
            return;
        };

        session.state = ClientState::Connected;
        self.events.send_event(ClientEvent::Connected);
        let _ = handshake.send(Ok(()));

        if let Some(cancel_sender) = &session.cancel_sender {
            tokio::spawn(self.clone().run_data_loop(generation, cancel_sender.subscribe()));
        }
    }

    /// The server ended the connection, or rejected it if we are still connecting
    async fn on_server_disconnect(&self, generation: u64) {
        let peer = {
            let mut session = self.session.write().await;
            if !session.is_current(generation) {
                return;
            }
            if session.state == ClientState::Connecting {
                info!(peer = ?session.remote_peer, "server rejected the connection");
            }
            else {
                info!(peer = ?session.remote_peer, "server closed the connection");
            }
            self.mark_disconnected(&mut session, SessionError::ConnectionRejected);
            session.remote_peer
        };

        if let Some(peer) = peer {
            self.close_transport_session(peer, generation).await;
        }
    }

    async fn run_data_loop(self, generation: u64, cancel: broadcast::Receiver<()>) {
        let poll_interval = self.config.poll_interval;
        run_poll_loop("client data", poll_interval, cancel, move || {
            let client = self.clone();
            async move { client.data_cycle(generation).await }
        }).await;
    }

    async fn data_cycle(&self, generation: u64) -> Result<ControlFlow<()>, TransportError> {
        let remote_peer = {
            let session = self.session.read().await;
            if session.generation != generation || session.state != ClientState::Connected {
                return Ok(ControlFlow::Break(()));
            }
            session.remote_peer
        };

        for channel in 0..self.config.num_channels() {
            for packet in drain_channel(self.transport.as_ref(), channel).await? {
                if packet.data.is_empty() {
                    continue;
                }
                if Some(packet.from) != remote_peer {
                    warn!(from = ?packet.from, channel, "data from a peer other than the server - ignoring");
                    continue;
                }
                self.events.send_event(ClientEvent::DataReceived(ReceivedData {
                    data: packet.data,
                    channel,
                }));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn run_transport_events(self, generation: u64, transport_events: broadcast::Receiver<TransportEvent>, cancel: broadcast::Receiver<()>) {
        run_transport_event_loop("client", transport_events, cancel, move |event| {
            let client = self.clone();
            async move {
                match event {
                    TransportEvent::SessionRequested(peer) => client.on_session_requested(generation, peer).await,
                    TransportEvent::SessionFailed { peer, reason } => client.on_session_failed(generation, peer, reason).await,
                }
            }
        }).await;
    }

    async fn on_session_requested(&self, generation: u64, peer: PeerId) {
        let expected_peer = {
            let session = self.session.read().await;
            if session.is_current(generation) { session.remote_peer } else { None }
        };

        if expected_peer == Some(peer) {
            if let Err(e) = self.transport.accept_session(peer).await {
                warn!(?peer, "could not accept transport session: {}", e);
            }
        }
        else {
            warn!(?peer, "transport session request from a peer other than the server - not accepting");
        }
    }

    async fn on_session_failed(&self, generation: u64, peer: PeerId, reason: String) {
        let error = SessionError::SessionFailed { peer, reason };
        {
            let mut session = self.session.write().await;
            if !session.is_current(generation) || session.remote_peer != Some(peer) {
                debug!("{} - not the server, ignoring", error);
                return;
            }
            if let Some(handshake) = session.handshake.take() {
                // connect() reports the failure and cleans up
                let _ = handshake.send(Err(error));
                return;
            }
        }

        error!("{}", error);
        self.events.send_event(ClientEvent::Error(error));
        self.disconnect_generation(generation).await;
    }
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::rstest;
    use tokio::time::Instant;

    use crate::session::connection_registry::ConnectionId;
    use crate::session::server::Server;
    use crate::session::session_events::{ServerDataReceived, ServerEvent};
    use crate::test_util::event::{drain_events, next_event};
    use crate::test_util::peer::{test_config, test_peer_id_from_number};
    use crate::transport::in_memory::InMemoryNetwork;
    use crate::transport::{DeliveryMode, MockPeerTransport};

    use super::*;

    const MAX_WAIT: Duration = Duration::from_secs(1);

    fn server_peer() -> PeerId {
        test_peer_id_from_number(0)
    }

    fn client_peer(n: u16) -> PeerId {
        test_peer_id_from_number(n)
    }

    async fn test_client(network: &InMemoryNetwork, n: u16) -> Client {
        let transport = Arc::new(network.endpoint(client_peer(n)).await);
        Client::new(Arc::new(test_config()), transport).unwrap()
    }

    async fn test_server(network: &InMemoryNetwork, max_connections: usize) -> Server {
        let transport = Arc::new(network.endpoint(server_peer()).await);
        let server = Server::new(Arc::new(test_config()), transport).unwrap();
        server.listen(max_connections).await.unwrap();
        server
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.poll_interval = Duration::ZERO;
        assert!(Client::new(Arc::new(config), Arc::new(MockPeerTransport::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_send_receive_disconnect() {
        let network = InMemoryNetwork::new();
        let server = test_server(&network, 4).await;
        let mut server_events = server.subscribe();
        let client = test_client(&network, 1).await;
        let mut client_events = client.subscribe();

        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(client.remote_peer().await, None);

        client.connect(&server_peer().to_string()).await.unwrap();
        assert_eq!(client.state().await, ClientState::Connected);
        assert!(client.is_connected().await);
        assert_eq!(client.remote_peer().await, Some(server_peer()));
        assert_eq!(drain_events(&mut client_events), vec![ClientEvent::Connected]);
        assert_eq!(drain_events(&mut server_events), vec![ServerEvent::Connected(ConnectionId(1))]);

        client.send(b"hello", 1).await.unwrap();
        assert_eq!(next_event(&mut server_events, MAX_WAIT).await, Some(ServerEvent::DataReceived(ServerDataReceived {
            connection_id: ConnectionId(1),
            data: Bytes::from_static(b"hello"),
            channel: 1,
        })));

        server.send(&[ConnectionId(1)], b"world", 0).await.unwrap();
        assert_eq!(next_event(&mut client_events, MAX_WAIT).await, Some(ClientEvent::DataReceived(ReceivedData {
            data: Bytes::from_static(b"world"),
            channel: 0,
        })));

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(client.remote_peer().await, None);
        assert_eq!(drain_events(&mut client_events), vec![ClientEvent::Disconnected]);
        assert_eq!(next_event(&mut server_events, MAX_WAIT).await, Some(ServerEvent::Disconnected(ConnectionId(1))));
        assert_eq!(server.connection_count().await, 0);
        assert!(network.closed_sessions(client_peer(1)).await.contains(&server_peer()));

        assert_eq!(client.send(b"too late", 0).await, Err(SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_server() {
        let network = InMemoryNetwork::new();
        let silent = network.endpoint(server_peer()).await;
        let client = test_client(&network, 1).await;
        let mut client_events = client.subscribe();

        let start = Instant::now();
        let result = client.connect(&silent.peer_id().to_string()).await;

        assert_eq!(result, Err(SessionError::ConnectTimeout(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(drain_events(&mut client_events), vec![
            ClientEvent::Error(SessionError::ConnectTimeout(Duration::from_millis(50))),
            ClientEvent::Disconnected,
        ]);

        let sent = network.sent_packets(client_peer(1)).await.into_iter()
            .map(|p| (p.to, p.channel, p.data.to_vec()))
            .collect::<Vec<_>>();
        assert_eq!(sent, vec![
            (server_peer(), CONTROL_CHANNEL, vec![0]),
            (server_peer(), CONTROL_CHANNEL, vec![2]),
        ]);
        assert_eq!(network.closed_sessions(client_peer(1)).await, vec![server_peer(), server_peer()]);

        // late answers are ignored
        network.inject_packet(client_peer(1), server_peer(), CONTROL_CHANNEL, &ControlMessage::AcceptConnect.ser()).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert!(drain_events(&mut client_events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_accept_does_not_complete_a_later_connect() {
        let network = InMemoryNetwork::new();
        let _silent = network.endpoint(server_peer()).await;
        let client = test_client(&network, 1).await;

        assert!(client.connect(&server_peer().to_string()).await.is_err());

        // the answer to the first attempt arrives after it was given up
        network.inject_packet(client_peer(1), server_peer(), CONTROL_CHANNEL, &ControlMessage::AcceptConnect.ser()).await;

        assert_eq!(client.connect(&server_peer().to_string()).await, Err(SessionError::ConnectTimeout(Duration::from_millis(50))));
        assert_eq!(client.state().await, ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_control_messages_from_server() {
        let network = InMemoryNetwork::new();
        let _server = test_server(&network, 4).await;
        let client = test_client(&network, 1).await;
        let mut client_events = client.subscribe();
        client.connect(&server_peer().to_string()).await.unwrap();

        for _ in 0..2 {
            network.inject_packet(client_peer(1), server_peer(), CONTROL_CHANNEL, &ControlMessage::AcceptConnect.ser()).await;
        }
        sleep(Duration::from_millis(50)).await;
        assert!(client.is_connected().await);
        assert_eq!(drain_events(&mut client_events), vec![ClientEvent::Connected]);

        for _ in 0..2 {
            network.inject_packet(client_peer(1), server_peer(), CONTROL_CHANNEL, &ControlMessage::Disconnect.ser()).await;
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(drain_events(&mut client_events), vec![ClientEvent::Disconnected]);
    }

    #[rstest]
    #[case::empty("")]
    #[case::not_a_number("server")]
    #[case::zero("0")]
    #[case::negative("-5")]
    #[tokio::test]
    async fn test_connect_with_malformed_address(#[case] address: &str) {
        // no expectations: the transport must not be touched
        let client = Client::new(Arc::new(test_config()), Arc::new(MockPeerTransport::new())).unwrap();
        let mut client_events = client.subscribe();

        let result = client.connect(address).await;

        assert!(matches!(result, Err(SessionError::InvalidAddress { .. })), "{:?}", result);
        assert_eq!(client.state().await, ClientState::Disconnected);
        let events = drain_events(&mut client_events);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ClientEvent::Error(SessionError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn test_connect_with_unavailable_transport() {
        let mut transport = MockPeerTransport::new();
        transport.expect_is_available()
            .return_const(false);
        let client = Client::new(Arc::new(test_config()), Arc::new(transport)).unwrap();
        let mut client_events = client.subscribe();

        assert_eq!(client.connect("1234").await, Err(SessionError::Transport(TransportError::Unavailable)));
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(drain_events(&mut client_events), vec![ClientEvent::Error(SessionError::Transport(TransportError::Unavailable))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connecting_and_abort() {
        let network = InMemoryNetwork::new();
        let _silent = network.endpoint(server_peer()).await;
        let client = test_client(&network, 1).await;
        let mut client_events = client.subscribe();

        let connecting = tokio::spawn({
            let client = client.clone();
            async move { client.connect(&server_peer().to_string()).await }
        });
        sleep(Duration::from_millis(5)).await;
        assert_eq!(client.state().await, ClientState::Connecting);
        assert_eq!(client.remote_peer().await, Some(server_peer()));

        assert_eq!(client.connect("4711").await, Err(SessionError::AlreadyConnected));
        assert_eq!(client.state().await, ClientState::Connecting);
        assert_eq!(client.remote_peer().await, Some(server_peer()));

        client.disconnect().await;
        assert_eq!(connecting.await.unwrap(), Err(SessionError::ConnectAborted));
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(drain_events(&mut client_events), vec![
            ClientEvent::Error(SessionError::AlreadyConnected),
            ClientEvent::Disconnected,
            ClientEvent::Error(SessionError::ConnectAborted),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejected_by_full_server() {
        let network = InMemoryNetwork::new();
        let server = test_server(&network, 1).await;
        let mut server_events = server.subscribe();

        let first = test_client(&network, 1).await;
        first.connect(&server_peer().to_string()).await.unwrap();

        let second = test_client(&network, 2).await;
        let mut second_events = second.subscribe();
        assert_eq!(second.connect(&server_peer().to_string()).await, Err(SessionError::ConnectionRejected));
        assert_eq!(second.state().await, ClientState::Disconnected);
        assert_eq!(drain_events(&mut second_events), vec![
            ClientEvent::Disconnected,
            ClientEvent::Error(SessionError::ConnectionRejected),
        ]);

        assert_eq!(drain_events(&mut server_events), vec![ServerEvent::Connected(ConnectionId(1))]);
        assert_eq!(server.connection_count().await, 1);
        assert!(first.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_by_server() {
        let network = InMemoryNetwork::new();
        let server = test_server(&network, 4).await;
        let client = test_client(&network, 1).await;
        client.connect(&server_peer().to_string()).await.unwrap();
        let mut client_events = client.subscribe();

        assert!(server.disconnect(ConnectionId(1)).await);

        assert_eq!(next_event(&mut client_events, MAX_WAIT).await, Some(ClientEvent::Disconnected));
        assert_eq!(client.state().await, ClientState::Disconnected);
        sleep(Duration::from_millis(50)).await;
        assert!(drain_events(&mut client_events).is_empty());
        assert!(network.closed_sessions(client_peer(1)).await.contains(&server_peer()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect() {
        let network = InMemoryNetwork::new();
        let server = test_server(&network, 4).await;
        let mut server_events = server.subscribe();
        let client = test_client(&network, 1).await;

        client.connect(&server_peer().to_string()).await.unwrap();
        client.disconnect().await;
        client.connect(&server_peer().to_string()).await.unwrap();

        assert!(client.is_connected().await);
        assert_eq!(drain_events(&mut server_events), vec![
            ServerEvent::Connected(ConnectionId(1)),
            ServerEvent::Disconnected(ConnectionId(1)),
            ServerEvent::Connected(ConnectionId(2)),
        ]);

        client.send(b"again", 0).await.unwrap();
        assert!(matches!(next_event(&mut server_events, MAX_WAIT).await,
            Some(ServerEvent::DataReceived(ServerDataReceived { connection_id: ConnectionId(2), .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_channel_falls_back_to_channel_0() {
        let network = InMemoryNetwork::new();
        let server = test_server(&network, 4).await;
        let mut server_events = server.subscribe();
        let client = test_client(&network, 1).await;
        client.connect(&server_peer().to_string()).await.unwrap();
        drain_events(&mut server_events);

        client.send(b"x", 17).await.unwrap();

        let last_sent = network.sent_packets(client_peer(1)).await.pop().unwrap();
        assert_eq!((last_sent.channel, last_sent.mode), (0, DeliveryMode::Reliable));
        assert!(matches!(next_event(&mut server_events, MAX_WAIT).await,
            Some(ServerEvent::DataReceived(ServerDataReceived { channel: 0, .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_from_foreign_peers_is_ignored() {
        let network = InMemoryNetwork::new();
        let _server = test_server(&network, 4).await;
        let client = test_client(&network, 1).await;
        client.connect(&server_peer().to_string()).await.unwrap();
        let mut client_events = client.subscribe();

        let foreign = network.endpoint(test_peer_id_from_number(9)).await;
        foreign.send_packet(client_peer(1), &ControlMessage::Disconnect.ser(), CONTROL_CHANNEL, DeliveryMode::Reliable).await.unwrap();
        foreign.send_packet(client_peer(1), b"spam", 0, DeliveryMode::Reliable).await.unwrap();
        network.inject_packet(client_peer(1), server_peer(), CONTROL_CHANNEL, &[7, 7]).await;
        network.inject_packet(client_peer(1), server_peer(), 0, &[]).await;

        sleep(Duration::from_millis(50)).await;

        assert!(client.is_connected().await);
        assert!(drain_events(&mut client_events).is_empty());
        assert!(!network.has_session(client_peer(1), foreign.peer_id()).await);
        assert_eq!(network.num_pending_packets(client_peer(1), 0).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_while_connected() {
        let network = InMemoryNetwork::new();
        let _server = test_server(&network, 4).await;
        let client = test_client(&network, 1).await;
        client.connect(&server_peer().to_string()).await.unwrap();
        let mut client_events = client.subscribe();

        network.fail_session(client_peer(1), server_peer(), "timed out").await;

        assert_eq!(next_event(&mut client_events, MAX_WAIT).await, Some(ClientEvent::Error(SessionError::SessionFailed {
            peer: server_peer(),
            reason: "timed out".to_string(),
        })));
        assert_eq!(next_event(&mut client_events, MAX_WAIT).await, Some(ClientEvent::Disconnected));
        assert_eq!(client.state().await, ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_shutdown_stops_polling_quietly() {
        let network = InMemoryNetwork::new();
        let _server = test_server(&network, 4).await;
        let client = test_client(&network, 1).await;
        client.connect(&server_peer().to_string()).await.unwrap();
        let mut client_events = client.subscribe();

        network.endpoint(client_peer(1)).await.shutdown();
        sleep(Duration::from_millis(50)).await;
        assert!(drain_events(&mut client_events).is_empty());

        assert_eq!(client.send(b"x", 0).await, Err(SessionError::Transport(TransportError::Unavailable)));

        client.disconnect().await;
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(drain_events(&mut client_events), vec![ClientEvent::Disconnected]);
    }
}
