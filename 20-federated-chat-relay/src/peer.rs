//! The link to the sibling server instance.
//!
//! Two procedures race to establish the link:
//!
//! - the passive side accepts on the dedicated peer address for the whole
//!   life of the server ([`PeerLink::run_acceptor`]);
//! - the active side dials the sibling with a retry delay
//!   ([`PeerLink::run_connector`]).
//!
//! Both hand their connection to [`PeerLink::commit`]. The first connection
//! committed becomes the link and a later one is dropped, with one
//! exception: when both siblings dial each other at the same moment each
//! side ends up holding two sockets, and each keeps the one whose
//! [`LinkKey`] orders first. Both sides compute the same key for the same
//! socket, so they settle on the same connection.
//!
//! The link state lives in a `watch` channel. The connector waits on it
//! between attempts, so the transition to [`LinkState::Established`] is
//! what stops its retries.
//!
//! Once a link is live, a reader task turns every peer line into an inbound
//! line for the server and a writer task drains the link outbox. Either task
//! failing closes the link.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    error::{RelayError, Result},
    message::{read_line, write_line},
};

/// Lines buffered for the peer writer before forwards start being dropped.
const PEER_OUTBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unestablished,
    /// The active connector is dialing; the acceptor is also up.
    Connecting,
    /// Only the acceptor is waiting for the sibling.
    Listening,
    Established,
    Closed,
}

/// Which procedure produced a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Accepted,
    Connected,
}

/// The two endpoints of a peer connection, lower address first. Both
/// siblings derive the same key for the same socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    pub low: SocketAddr,
    pub high: SocketAddr,
}

impl LinkKey {
    pub fn of(stream: &TcpStream) -> std::io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            low: local.min(remote),
            high: local.max(remote),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The sibling's peer-listening address.
    pub remote: SocketAddr,
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to each retry.
    pub retry_jitter: Duration,
    /// Dial the sibling again after an established link closes.
    pub reconnect: bool,
}

impl PeerConfig {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            retry_delay: Duration::from_secs(1),
            retry_jitter: Duration::from_millis(250),
            reconnect: true,
        }
    }
}

struct LiveLink {
    id: u64,
    key: LinkKey,
    remote: SocketAddr,
    outbox: mpsc::Sender<String>,
    reader: JoinHandle<()>,
}

pub struct PeerLink {
    config: PeerConfig,
    state: watch::Sender<LinkState>,
    live: Mutex<Option<LiveLink>>,
    inbound: mpsc::Sender<String>,
    next_id: AtomicU64,
}

impl PeerLink {
    /// Lines read from the sibling are pushed into `inbound`.
    pub fn new(config: PeerConfig, inbound: mpsc::Sender<String>) -> Self {
        let (state, _) = watch::channel(LinkState::Unestablished);
        Self {
            config,
            state,
            live: Mutex::new(None),
            inbound,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.state() == LinkState::Established
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Resolves once the link reaches `Established`.
    pub async fn wait_established(&self) {
        let mut state = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state.wait_for(|state| *state == LinkState::Established).await;
    }

    /// Key of the live connection, if any.
    pub fn connection(&self) -> Option<LinkKey> {
        self.live().as_ref().map(|link| link.key)
    }

    fn live(&self) -> MutexGuard<'_, Option<LiveLink>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: LinkState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "peer link state changed");
            *state = next;
            true
        });
    }

    /// Queues a line for the sibling.
    ///
    /// Returns [`RelayError::PeerLinkLost`] when no link is live so callers
    /// can log it; nothing is buffered for a later link.
    pub fn forward(&self, line: &str) -> Result<()> {
        let outbox = match self.live().as_ref() {
            Some(link) => link.outbox.clone(),
            None => return Err(RelayError::PeerLinkLost),
        };

        outbox.try_send(line.to_string()).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => {
                RelayError::transport_send("peer", "peer outbox full")
            }
            mpsc::error::TrySendError::Closed(_) => RelayError::PeerLinkLost,
        })
    }

    /// Offers `stream` as the link. Returns whether it was kept; a stream
    /// that is not kept is dropped, which closes it.
    pub fn commit(self: &Arc<Self>, stream: TcpStream, via: Via) -> bool {
        let addrs = LinkKey::of(&stream)
            .and_then(|key| stream.peer_addr().map(|remote| (key, remote)));
        let (key, remote) = match addrs {
            Ok(addrs) => addrs,
            Err(error) => {
                warn!(?via, ?error, "discarding peer connection without an address");
                return false;
            }
        };

        // Held while the tasks spawn so a task that fails instantly still
        // finds its own link when it calls `close`.
        let mut live = self.live();
        if let Some((current_key, current)) = live.as_ref().map(|link| (link.key, link.remote)) {
            if current_key <= key {
                debug!(?via, %remote, %current, "discarding surplus peer connection");
                return false;
            }
            debug!(
                ?via,
                %remote,
                replaced = %current,
                "both siblings dialed; keeping the lower connection"
            );
            if let Some(replaced) = live.take() {
                replaced.reader.abort();
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (outbox, pending) = mpsc::channel(PEER_OUTBOX_CAPACITY);

        tokio::spawn(run_writer(Arc::clone(self), id, writer, pending));
        let reader = tokio::spawn(run_reader(Arc::clone(self), id, reader));

        *live = Some(LiveLink {
            id,
            key,
            remote,
            outbox,
            reader,
        });
        self.set_state(LinkState::Established);
        drop(live);

        info!(?via, %remote, "peer link established");
        true
    }

    /// Tears down link `id` if it is still the live one.
    fn close(&self, id: u64, reason: &str) {
        let closed = {
            let mut live = self.live();
            if live.as_ref().is_some_and(|link| link.id == id) {
                self.set_state(LinkState::Closed);
                live.take()
            } else {
                None
            }
        };

        if let Some(link) = closed {
            warn!(remote = %link.remote, reason, "peer link lost");
            link.reader.abort();
        }
    }

    /// Drops the live link, if any. The connector must already be stopped
    /// or it will dial again.
    pub fn disconnect(&self) {
        let closed = {
            let mut live = self.live();
            if live.is_some() {
                self.set_state(LinkState::Closed);
            }
            live.take()
        };

        if let Some(link) = closed {
            info!(remote = %link.remote, "peer link closed");
            link.reader.abort();
        }
    }

    /// Moves to `next` unless a link is live. State changes that do not
    /// install or remove a link go through here so they can never
    /// overwrite `Established`.
    fn set_idle_state(&self, next: LinkState, from: &[LinkState]) {
        let live = self.live();
        if live.is_none() && from.contains(&self.state()) {
            self.set_state(next);
        }
    }

    /// Accepts sibling connections until the listener fails.
    pub async fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        self.set_idle_state(LinkState::Listening, &[LinkState::Unestablished]);

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "peer connection accepted");
                    self.commit(stream, Via::Accepted);
                }
                Err(error) => {
                    warn!(?error, "failed to accept peer connection");
                }
            }
        }
    }

    /// Dials the sibling until a link is established by either procedure.
    ///
    /// With `reconnect` set, waits for the link to close and dials again.
    pub async fn run_connector(self: Arc<Self>) {
        let mut state = self.subscribe();

        loop {
            self.dial(&mut state).await;

            if !self.config.reconnect {
                return;
            }
            if state.wait_for(|state| *state == LinkState::Closed).await.is_err() {
                return;
            }

            // The sibling notices the loss at about the same moment.
            sleep(self.retry_delay()).await;
            info!(remote = %self.config.remote, "re-dialing peer");
        }
    }

    async fn dial(self: &Arc<Self>, state: &mut watch::Receiver<LinkState>) {
        let mut attempts = 0u64;

        while !self.is_established() {
            self.set_idle_state(
                LinkState::Connecting,
                &[
                    LinkState::Unestablished,
                    LinkState::Listening,
                    LinkState::Closed,
                ],
            );
            attempts += 1;

            // An attempt in flight is allowed to finish even if the passive
            // side wins meanwhile; `commit` settles which socket stays.
            match TcpStream::connect(self.config.remote).await {
                Ok(stream) => {
                    if self.commit(stream, Via::Connected) || self.is_established() {
                        return;
                    }
                }
                Err(error) => {
                    debug!(
                        remote = %self.config.remote,
                        attempts,
                        ?error,
                        "peer not reachable yet"
                    );
                }
            }

            select! {
                _ = state.wait_for(|state| *state == LinkState::Established) => {
                    debug!(
                        attempts,
                        "peer link established by the acceptor; connector standing down"
                    );
                    return;
                }
                _ = sleep(self.retry_delay()) => {}
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let spread: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.config.retry_delay + self.config.retry_jitter.mul_f64(spread)
    }
}

async fn run_reader(link: Arc<PeerLink>, id: u64, reader: OwnedReadHalf) {
    let mut reader = BufReader::new(reader);
    let reason = loop {
        match read_line(&mut reader).await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if link.inbound.send(line).await.is_err() {
                    break "server stopped consuming peer lines";
                }
            }
            Ok(None) => break "peer closed the connection",
            Err(error) => {
                debug!(?error, "peer read failed");
                break "peer read failed";
            }
        }
    };
    link.close(id, reason);
}

async fn run_writer(
    link: Arc<PeerLink>,
    id: u64,
    mut writer: OwnedWriteHalf,
    mut pending: mpsc::Receiver<String>,
) {
    while let Some(line) = pending.recv().await {
        if let Err(error) = write_line(&mut writer, &line).await {
            debug!(?error, "peer write failed");
            link.close(id, "peer write failed");
            return;
        }
    }
    // Outbox dropped: the link was closed from the reader side.
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn quick(remote: SocketAddr) -> PeerConfig {
        PeerConfig {
            retry_delay: Duration::from_millis(20),
            retry_jitter: Duration::ZERO,
            reconnect: false,
            ..PeerConfig::new(remote)
        }
    }

    #[test]
    fn retry_delay_stays_within_jitter() {
        let (inbound, _rx) = mpsc::channel(8);
        let config = PeerConfig {
            retry_delay: Duration::from_millis(100),
            retry_jitter: Duration::from_millis(50),
            ..PeerConfig::new("127.0.0.1:9".parse().unwrap())
        };
        let link = PeerLink::new(config, inbound);

        for _ in 0..100 {
            let delay = link.retry_delay();
            assert!(delay >= Duration::from_millis(100), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }

        let (inbound, _rx) = mpsc::channel(8);
        let fixed = PeerLink::new(quick("127.0.0.1:9".parse().unwrap()), inbound);
        assert_eq!(fixed.retry_delay(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn forward_without_link_reports_loss() {
        let (inbound, _rx) = mpsc::channel(8);
        let link = PeerLink::new(quick("127.0.0.1:9".parse().unwrap()), inbound);

        assert_eq!(link.state(), LinkState::Unestablished);
        assert!(matches!(link.forward("alice: hi"), Err(RelayError::PeerLinkLost)));
    }

    #[tokio::test]
    async fn surplus_connection_settles_on_lower_key() {
        let sibling = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = sibling.local_addr().unwrap();
        let (inbound, _rx) = mpsc::channel(8);
        let link = Arc::new(PeerLink::new(quick(addr), inbound));

        let first = TcpStream::connect(addr).await.unwrap();
        let (first_remote, _) = sibling.accept().await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();
        let (second_remote, _) = sibling.accept().await.unwrap();

        let first_key = LinkKey::of(&first).unwrap();
        let second_key = LinkKey::of(&second).unwrap();
        assert_eq!(first_key, LinkKey::of(&first_remote).unwrap());

        assert!(link.commit(first, Via::Connected));
        let replaced = link.commit(second, Via::Accepted);
        assert_eq!(replaced, second_key < first_key);
        assert_eq!(link.connection(), Some(first_key.min(second_key)));
        assert!(link.is_established());

        // Whichever socket lost was dropped, so its far end sees EOF.
        let loser = if replaced { first_remote } else { second_remote };
        let mut reader = BufReader::new(loser);
        let eof = timeout(WAIT, read_line(&mut reader)).await.unwrap().unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn connector_retries_until_sibling_listens() {
        // Reserve a port, release it, and only listen there after the
        // connector has started failing.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let (inbound, _rx) = mpsc::channel(8);
        let link = Arc::new(PeerLink::new(quick(addr), inbound));
        let connector = tokio::spawn(Arc::clone(&link).run_connector());

        sleep(Duration::from_millis(60)).await;
        assert_eq!(link.state(), LinkState::Connecting);

        let sibling = TcpListener::bind(addr).await.unwrap();
        let _accepted = timeout(WAIT, sibling.accept()).await.unwrap().unwrap();

        timeout(WAIT, link.wait_established()).await.unwrap();
        timeout(WAIT, connector).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn accepted_link_stops_the_connector() {
        let unreachable = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = unreachable.local_addr().unwrap();
        drop(unreachable);

        let own = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let own_addr = own.local_addr().unwrap();

        let (inbound, _rx) = mpsc::channel(8);
        let link = Arc::new(PeerLink::new(quick(remote), inbound));
        tokio::spawn(Arc::clone(&link).run_acceptor(own));
        let connector = tokio::spawn(Arc::clone(&link).run_connector());

        let _sibling = TcpStream::connect(own_addr).await.unwrap();

        timeout(WAIT, link.wait_established()).await.unwrap();
        timeout(WAIT, connector)
            .await
            .expect("connector should stop once the passive side wins")
            .unwrap();
    }

    #[tokio::test]
    async fn lines_flow_both_ways_and_eof_closes() {
        let sibling = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = sibling.local_addr().unwrap();
        let (inbound, mut lines) = mpsc::channel(8);
        let link = Arc::new(PeerLink::new(quick(addr), inbound));

        assert!(link.commit(TcpStream::connect(addr).await.unwrap(), Via::Connected));
        let (remote, _) = sibling.accept().await.unwrap();
        let (remote_reader, mut remote_writer) = remote.into_split();
        let mut remote_reader = BufReader::new(remote_reader);

        link.forward("alice: hi").unwrap();
        let forwarded = timeout(WAIT, read_line(&mut remote_reader)).await.unwrap().unwrap();
        assert_eq!(forwarded.as_deref(), Some("alice: hi"));

        write_line(&mut remote_writer, "bob: hey").await.unwrap();
        let received = timeout(WAIT, lines.recv()).await.unwrap();
        assert_eq!(received.as_deref(), Some("bob: hey"));

        drop(remote_writer);
        drop(remote_reader);
        let mut state = link.subscribe();
        timeout(WAIT, state.wait_for(|state| *state == LinkState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(link.forward("late"), Err(RelayError::PeerLinkLost)));
    }
}
