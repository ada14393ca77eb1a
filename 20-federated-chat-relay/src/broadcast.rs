use std::{collections::VecDeque, sync::Arc};

use tokio::{net::UdpSocket, sync::mpsc::error::TrySendError};
use tracing::{debug, warn};

use crate::{
    error::RelayError,
    message::{Message, notice},
    peer::PeerLink,
    registry::{ClientIdentity, ClientRegistry, Endpoint},
};

/// Fans messages out to local clients and forwards them to the sibling.
pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
    datagrams: Arc<UdpSocket>,
    peer: Arc<PeerLink>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ClientRegistry>,
        datagrams: Arc<UdpSocket>,
        peer: Arc<PeerLink>,
    ) -> Self {
        Self {
            registry,
            datagrams,
            peer,
        }
    }

    /// Delivers `message` to every local client except its origin and,
    /// unless it came from the peer, forwards it to the peer once.
    ///
    /// Recipients that fail to take the message are unregistered, and a
    /// leave notice for each is delivered after this fan-out completes.
    pub async fn deliver(&self, message: Message) {
        let mut pending = VecDeque::from([message]);

        while let Some(message) = pending.pop_front() {
            let line = message.render();

            for evicted in self.fan_out(&message, &line).await {
                pending.push_back(Message::left(&evicted.username));
            }

            if message.origin.forwards_to_peer() {
                if let Err(error) = self.peer.forward(&line) {
                    debug!(%error, "message not forwarded to peer");
                }
            }
        }
    }

    /// Sends a server notice to local clients only.
    pub async fn announce_local(&self, text: &str) {
        let line = notice(text);
        for identity in self.registry.snapshot() {
            if let Err(error) = self.send(&identity, &line).await {
                debug!(%error, "failed to deliver local notice");
            }
        }
    }

    async fn fan_out(&self, message: &Message, line: &str) -> Vec<ClientIdentity> {
        let mut evicted = Vec::new();

        for identity in self.registry.snapshot() {
            if message.origin.is_client(&identity.username) {
                continue;
            }

            if let Err(error) = self.send(&identity, line).await {
                warn!(%error, transport = ?identity.transport(), "dropping unreachable client");
                let key = identity.endpoint.key();
                if let Some(removed) = self.registry.unregister_endpoint(&identity.username, &key) {
                    evicted.push(removed);
                }
            }
        }

        evicted
    }

    async fn send(&self, identity: &ClientIdentity, line: &str) -> Result<(), RelayError> {
        match &identity.endpoint {
            Endpoint::Stream(handle) => {
                handle.try_send(line.to_string()).map_err(|error| {
                    let reason = match error {
                        TrySendError::Full(_) => "client is not keeping up",
                        TrySendError::Closed(_) => "session closed",
                    };
                    RelayError::transport_send(&identity.username, reason)
                })
            }
            Endpoint::Datagram(addr) => self
                .datagrams
                .send_to(line.as_bytes(), *addr)
                .await
                .map(|_| ())
                .map_err(|error| RelayError::transport_send(&identity.username, error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use tokio::{
        io::BufReader,
        net::{TcpListener, TcpStream},
        sync::mpsc,
        time::timeout,
    };

    use super::*;
    use crate::{
        message::read_line,
        peer::{PeerConfig, Via},
        registry::StreamHandle,
    };

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        registry: Arc<ClientRegistry>,
        peer: Arc<PeerLink>,
        broadcaster: Broadcaster,
        _peer_lines: mpsc::Receiver<String>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(ClientRegistry::new());
        let datagrams = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (inbound, peer_lines) = mpsc::channel(8);
        let peer = Arc::new(PeerLink::new(
            PeerConfig::new("127.0.0.1:9".parse().unwrap()),
            inbound,
        ));
        let broadcaster = Broadcaster::new(Arc::clone(&registry), datagrams, Arc::clone(&peer));
        Fixture {
            registry,
            peer,
            broadcaster,
            _peer_lines: peer_lines,
        }
    }

    fn join(
        registry: &ClientRegistry,
        username: &str,
        port: u16,
        capacity: usize,
    ) -> mpsc::Receiver<String> {
        let (outbox, inbox) = mpsc::channel(capacity);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        registry
            .register(username, Endpoint::Stream(StreamHandle::new(addr, outbox)))
            .unwrap();
        inbox
    }

    /// Commits a loopback link and returns the sibling's end of it.
    async fn link_up(peer: &Arc<PeerLink>) -> BufReader<TcpStream> {
        let sibling = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(sibling.local_addr().unwrap()).await.unwrap();
        assert!(peer.commit(stream, Via::Connected));
        let (remote, _) = sibling.accept().await.unwrap();
        BufReader::new(remote)
    }

    #[tokio::test]
    async fn chat_skips_sender_and_is_forwarded_once() {
        let fx = fixture().await;
        let mut alice = join(&fx.registry, "alice", 1001, 8);
        let mut bob = join(&fx.registry, "bob", 1002, 8);
        let mut carol = join(&fx.registry, "carol", 1003, 8);
        let mut sibling = link_up(&fx.peer).await;

        fx.broadcaster.deliver(Message::chat("alice", "hi")).await;

        assert_eq!(bob.recv().await.as_deref(), Some("alice: hi"));
        assert_eq!(carol.recv().await.as_deref(), Some("alice: hi"));
        assert!(alice.try_recv().is_err());

        let forwarded = timeout(WAIT, read_line(&mut sibling)).await.unwrap().unwrap();
        assert_eq!(forwarded.as_deref(), Some("alice: hi"));

        // A second message is the next line on the link, so the first
        // was carried exactly once.
        fx.broadcaster.deliver(Message::chat("bob", "yo")).await;
        let next = timeout(WAIT, read_line(&mut sibling)).await.unwrap().unwrap();
        assert_eq!(next.as_deref(), Some("bob: yo"));
    }

    #[tokio::test]
    async fn peer_lines_stay_local() {
        let fx = fixture().await;
        let mut alice = join(&fx.registry, "alice", 2001, 8);
        let mut sibling = link_up(&fx.peer).await;

        fx.broadcaster.deliver(Message::from_peer("bob: hey")).await;
        assert_eq!(alice.recv().await.as_deref(), Some("bob: hey"));

        fx.broadcaster.deliver(Message::chat("alice", "back")).await;
        let first_on_link = timeout(WAIT, read_line(&mut sibling)).await.unwrap().unwrap();
        assert_eq!(first_on_link.as_deref(), Some("alice: back"));
    }

    #[tokio::test]
    async fn local_delivery_survives_missing_peer_link() {
        let fx = fixture().await;
        let mut bob = join(&fx.registry, "bob", 3001, 8);
        assert!(!fx.peer.is_established());

        fx.broadcaster.deliver(Message::chat("alice", "anyone?")).await;
        assert_eq!(bob.recv().await.as_deref(), Some("alice: anyone?"));
    }

    #[tokio::test]
    async fn unregistered_clients_miss_later_messages() {
        let fx = fixture().await;
        let mut bob = join(&fx.registry, "bob", 4001, 8);
        fx.registry.unregister("bob");

        fx.broadcaster.deliver(Message::chat("alice", "hello?")).await;
        assert!(bob.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_outbox_evicts_and_announces() {
        let fx = fixture().await;
        let _slow = join(&fx.registry, "slow", 5001, 1);
        let mut fast = join(&fx.registry, "fast", 5002, 8);

        fx.broadcaster.deliver(Message::chat("alice", "one")).await;
        fx.broadcaster.deliver(Message::chat("alice", "two")).await;

        assert!(!fx.registry.contains("slow"));
        assert_eq!(fast.recv().await.as_deref(), Some("alice: one"));
        assert_eq!(fast.recv().await.as_deref(), Some("alice: two"));
        assert_eq!(
            fast.recv().await.as_deref(),
            Some("*** slow left the chat ***")
        );
    }

    #[tokio::test]
    async fn unreachable_datagram_client_is_evicted() {
        let fx = fixture().await;
        let mut alice = join(&fx.registry, "alice", 6001, 8);
        // The fixture socket is IPv4, so sending to an IPv6 address fails.
        fx.registry
            .register("ghost", Endpoint::Datagram("[::1]:9".parse().unwrap()))
            .unwrap();

        fx.broadcaster.deliver(Message::chat("bob", "hello")).await;

        assert!(!fx.registry.contains("ghost"));
        assert_eq!(alice.recv().await.as_deref(), Some("bob: hello"));
        assert_eq!(
            alice.recv().await.as_deref(),
            Some("*** ghost left the chat ***")
        );
    }

    #[tokio::test]
    async fn datagram_clients_get_raw_payloads() {
        let fx = fixture().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        fx.registry
            .register("dgram", Endpoint::Datagram(client.local_addr().unwrap()))
            .unwrap();

        fx.broadcaster.deliver(Message::joined("alice")).await;

        let mut buf = [0u8; 256];
        let (len, _) = timeout(WAIT, client.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"*** alice joined the chat ***");
    }
}
