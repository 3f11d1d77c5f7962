use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use tokio::time::timeout;
use tracing::{debug, info, warn, Level};

use peer_session::session::client::Client;
use peer_session::session::server::Server;
use peer_session::session::session_config::SessionConfig;
use peer_session::session::session_events::{ClientEvent, ServerEvent};
use peer_session::transport::in_memory::InMemoryNetwork;
use peer_session::transport::PeerId;

/// Runs a server and a number of clients on an in-process network. Every client sends some
///  messages, the server echoes them back.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 3)]
    clients: u64,

    #[clap(long, default_value_t = 5)]
    messages: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const SERVER_PEER: PeerId = PeerId(1);

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let num_echoes = run_loopback(args.clients, args.messages).await?;
    info!(num_echoes, "all clients are done");
    Ok(())
}

/// returns the total number of echoes the clients received
async fn run_loopback(num_clients: u64, num_messages: usize) -> anyhow::Result<usize> {
    let network = InMemoryNetwork::new();
    let config = Arc::new(SessionConfig::default());

    let server = Server::new(config.clone(), Arc::new(network.endpoint(SERVER_PEER).await))?;
    let max_connections = usize::try_from(num_clients)?;
    server.listen(max_connections).await?;
    tokio::spawn(run_echo(server.clone()));

    let mut handles = Vec::new();
    for n in 0..num_clients {
        let transport = Arc::new(network.endpoint(PeerId(100 + n)).await);
        let client = Client::new(config.clone(), transport)?;
        handles.push(tokio::spawn(run_client(client, num_messages)));
    }

    let mut num_echoes = 0;
    for handle in handles {
        num_echoes += handle.await??;
    }

    let connections = server.connection_count().await;
    debug!(connections, "stopping the server");
    server.stop().await;
    Ok(num_echoes)
}

#[tracing::instrument(name="echo", skip(server))]
async fn run_echo(server: Server) {
    let mut events = server.subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            ServerEvent::Connected(id) => {
                let peer = server.peer_address(id).await;
                info!(?id, ?peer, "client connected");
            }
            ServerEvent::Disconnected(id) => info!(?id, "client disconnected"),
            ServerEvent::DataReceived(data) => {
                if let Err(e) = server.send(&[data.connection_id], &data.data, data.channel).await {
                    warn!("echo failed: {}", e);
                }
            }
            ServerEvent::Error(e) => warn!(connection_id = ?e.connection_id, "{}", e.error),
        }
    }
}

async fn run_client(client: Client, num_messages: usize) -> anyhow::Result<usize> {
    let mut events = client.subscribe();
    client.connect(&SERVER_PEER.to_string()).await?;

    for i in 0..num_messages {
        client.send(format!("message #{}", i).as_bytes(), 0).await?;
    }

    let mut num_echoes = 0;
    while num_echoes < num_messages {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(ClientEvent::DataReceived(data))) => {
                info!("echo: {}", String::from_utf8_lossy(&data.data));
                num_echoes += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => bail!("event channel failed: {}", e),
            Err(_) => bail!("timed out waiting for echoes"),
        }
    }

    client.disconnect().await;
    Ok(num_echoes)
}
