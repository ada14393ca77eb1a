use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, UdpSocket},
    select,
    sync::{mpsc, watch},
    task::JoinSet,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    broadcast::Broadcaster,
    datagram::DatagramListener,
    message::Message,
    peer::{PeerConfig, PeerLink},
    registry::ClientRegistry,
    stream::StreamListener,
};

/// Peer lines waiting for the broadcaster.
const PEER_INBOUND_CAPACITY: usize = 1024;
/// How long stream sessions get to flush and leave once the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub peer: PeerConfig,
    /// How long a new stream client may take to send its username.
    pub handshake_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(peer: PeerConfig) -> Self {
        Self {
            peer,
            handshake_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// The three sockets a server instance listens on.
pub struct Listeners {
    pub clients: TcpListener,
    pub datagrams: UdpSocket,
    pub peer: TcpListener,
}

impl Listeners {
    pub async fn bind(
        clients: SocketAddr,
        datagrams: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self> {
        Ok(Self {
            clients: TcpListener::bind(clients)
                .await
                .with_context(|| format!("failed to bind client listener on {clients}"))?,
            datagrams: UdpSocket::bind(datagrams)
                .await
                .with_context(|| format!("failed to bind datagram socket on {datagrams}"))?,
            peer: TcpListener::bind(peer)
                .await
                .with_context(|| format!("failed to bind peer listener on {peer}"))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddrs {
    pub stream: SocketAddr,
    pub datagram: SocketAddr,
    pub peer: SocketAddr,
}

pub struct Server {
    streams: StreamListener,
    datagrams: DatagramListener,
    peer_listener: TcpListener,
    registry: Arc<ClientRegistry>,
    peer: Arc<PeerLink>,
    broadcaster: Arc<Broadcaster>,
    peer_lines: mpsc::Receiver<String>,
    addrs: LocalAddrs,
}

impl Server {
    pub fn new(listeners: Listeners, config: ServerConfig) -> Result<Self> {
        let Listeners {
            clients,
            datagrams,
            peer: peer_listener,
        } = listeners;

        let addrs = LocalAddrs {
            stream: clients.local_addr()?,
            datagram: datagrams.local_addr()?,
            peer: peer_listener.local_addr()?,
        };

        let registry = Arc::new(ClientRegistry::new());
        let datagrams = Arc::new(datagrams);
        let (inbound, peer_lines) = mpsc::channel(PEER_INBOUND_CAPACITY);
        let peer = Arc::new(PeerLink::new(config.peer, inbound));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&datagrams),
            Arc::clone(&peer),
        ));

        Ok(Self {
            streams: StreamListener::new(
                clients,
                Arc::clone(&registry),
                Arc::clone(&broadcaster),
                config.handshake_timeout,
            ),
            datagrams: DatagramListener::new(
                datagrams,
                Arc::clone(&registry),
                Arc::clone(&broadcaster),
            ),
            peer_listener,
            registry,
            peer,
            broadcaster,
            peer_lines,
            addrs,
        })
    }

    pub fn local_addrs(&self) -> LocalAddrs {
        self.addrs
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn peer_link(&self) -> Arc<PeerLink> {
        Arc::clone(&self.peer)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            streams,
            datagrams,
            peer_listener,
            peer,
            broadcaster,
            peer_lines,
            ..
        } = self;
        tokio::pin!(shutdown);

        // Stream sessions are stopped gracefully rather than aborted, so the
        // stream listener is not part of `tasks`.
        let (stop, stop_rx) = watch::channel(false);
        let mut streams = tokio::spawn(streams.run(stop_rx));

        let mut tasks = JoinSet::new();
        tasks.spawn(datagrams.run());
        tasks.spawn(Arc::clone(&peer).run_acceptor(peer_listener));
        tasks.spawn(Arc::clone(&peer).run_connector());
        tasks.spawn(relay_peer_lines(peer_lines, Arc::clone(&broadcaster)));

        loop {
            select! {
                _ = &mut shutdown => break,
                finished = tasks.join_next() => match finished {
                    Some(Ok(())) => {}
                    Some(Err(err)) => warn!(error = ?err, "relay task failed"),
                    None => break,
                },
            }
        }

        tasks.shutdown().await;
        info!("relay shutting down");
        broadcaster.announce_local("server shutting down").await;

        // Departing sessions still announce their leave over the peer link,
        // so it is dropped last.
        let _ = stop.send(true);
        if timeout(SHUTDOWN_GRACE, &mut streams).await.is_err() {
            warn!(grace = ?SHUTDOWN_GRACE, "client sessions did not stop in time");
            streams.abort();
        }
        peer.disconnect();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Feeds lines from the sibling into local-only fan-out.
async fn relay_peer_lines(mut lines: mpsc::Receiver<String>, broadcaster: Arc<Broadcaster>) {
    while let Some(line) = lines.recv().await {
        broadcaster.deliver(Message::from_peer(line)).await;
    }
}
