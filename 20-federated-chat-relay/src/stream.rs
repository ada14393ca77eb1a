//! Connection-oriented clients.
//!
//! Each accepted connection gets its own task that walks
//! `AwaitingUsername → Registered → Closed`. The first line is the
//! username; afterwards every line is chat text. Lines for the client
//! arrive through a bounded outbox that the broadcaster fills, and the
//! session task multiplexes the socket and the outbox with `select!`.
//!
//! Sessions live in a `JoinSet` owned by the listener. When the stop
//! signal fires the listener stops accepting, every session flushes what is
//! already queued for its client and leaves, and the listener returns once
//! all sessions are done.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, watch},
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    message::{
        Message, QUIT_COMMAND, USERNAME_ACCEPTED, USERNAME_TAKEN, normalize_username, read_line,
        write_line,
    },
    registry::{ClientRegistry, Endpoint, EndpointKey, StreamHandle},
};

/// Lines queued for one client before the broadcaster gives up on it.
pub const OUTBOX_CAPACITY: usize = 128;

pub struct StreamListener {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    broadcaster: Arc<Broadcaster>,
    handshake_timeout: Option<Duration>,
}

impl StreamListener {
    pub fn new(
        listener: TcpListener,
        registry: Arc<ClientRegistry>,
        broadcaster: Arc<Broadcaster>,
        handshake_timeout: Option<Duration>,
    ) -> Self {
        Self {
            listener,
            registry,
            broadcaster,
            handshake_timeout,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `stop` turns true, then waits for every
    /// session to finish.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();

        loop {
            select! {
                accepted = self.listener.accept() => {
                    self.handle_accept_result(accepted, &mut sessions, &stop);
                }
                Some(finished) = sessions.join_next() => handle_session_exit(finished),
                _ = stopped(&mut stop) => break,
            }
        }

        debug!(sessions = sessions.len(), "draining client sessions");
        while let Some(finished) = sessions.join_next().await {
            handle_session_exit(finished);
        }
    }

    fn handle_accept_result(
        &self,
        result: std::io::Result<(TcpStream, SocketAddr)>,
        sessions: &mut JoinSet<()>,
        stop: &watch::Receiver<bool>,
    ) {
        match result {
            Ok((stream, peer)) => self.spawn_session(stream, peer, sessions, stop),
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    fn spawn_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        sessions: &mut JoinSet<()>,
        stop: &watch::Receiver<bool>,
    ) {
        let session = Session {
            registry: Arc::clone(&self.registry),
            broadcaster: Arc::clone(&self.broadcaster),
            handshake_timeout: self.handshake_timeout,
            peer,
            stop: stop.clone(),
        };
        sessions.spawn(async move {
            if let Err(err) = session.run(stream).await {
                warn!(peer = %peer, error = ?err, "client connection closed with error");
            }
        });
    }
}

fn handle_session_exit(result: Result<(), JoinError>) {
    if let Err(err) = result {
        warn!(error = ?err, "client session task failed");
    }
}

struct Session {
    registry: Arc<ClientRegistry>,
    broadcaster: Arc<Broadcaster>,
    handshake_timeout: Option<Duration>,
    peer: SocketAddr,
    stop: watch::Receiver<bool>,
}

/// Why a registered session stopped.
#[derive(Debug)]
enum Exit {
    Hangup,
    Quit,
    Evicted,
    Shutdown,
}

impl Session {
    async fn run(mut self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let Some(username) = self.await_username(&mut reader).await? else {
            return Ok(());
        };

        let (outbox, mut inbox) = mpsc::channel(OUTBOX_CAPACITY);
        let endpoint = Endpoint::Stream(StreamHandle::new(self.peer, outbox));
        let key = endpoint.key();

        if !self.register(&username, endpoint, &mut writer).await? {
            return Ok(());
        }

        info!(peer = %self.peer, %username, "client joined");
        self.broadcaster.deliver(Message::joined(&username)).await;

        let exit = self
            .run_registered(&username, reader.lines(), &mut writer, &mut inbox)
            .await;
        self.cleanup(&username, &key, &exit).await;
        let _ = writer.shutdown().await;

        exit.map(|_| ())
    }

    /// Reads the registration line. `None` means the client went away,
    /// timed out, or the server is stopping.
    async fn await_username(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<String>> {
        let first_line = select! {
            line = read_first_line(reader, self.handshake_timeout) => line,
            _ = stopped(&mut self.stop) => return Ok(None),
        };
        let Some(first_line) = first_line else {
            info!(
                peer = %self.peer,
                limit = ?self.handshake_timeout,
                "no username before timeout"
            );
            return Ok(None);
        };

        match first_line.context("failed to read username")? {
            Some(line) => Ok(Some(normalize_username(&line))),
            None => {
                debug!(peer = %self.peer, "connection closed before registration");
                Ok(None)
            }
        }
    }

    /// Registers the username and replies with the acceptance or rejection
    /// token. Returns whether the session continues.
    async fn register(
        &self,
        username: &str,
        endpoint: Endpoint,
        writer: &mut OwnedWriteHalf,
    ) -> Result<bool> {
        let key = endpoint.key();
        match self.registry.register(username, endpoint) {
            Ok(()) => {}
            Err(err) if err.is_rejection() => {
                info!(peer = %self.peer, %err, "registration rejected");
                write_line(writer, USERNAME_TAKEN)
                    .await
                    .context("failed to send rejection")?;
                let _ = writer.shutdown().await;
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = write_line(writer, USERNAME_ACCEPTED).await {
            self.registry.unregister_endpoint(username, &key);
            return Err(err).context("failed to send acceptance");
        }
        Ok(true)
    }

    async fn run_registered(
        &mut self,
        username: &str,
        mut lines: Lines<BufReader<OwnedReadHalf>>,
        writer: &mut OwnedWriteHalf,
        inbox: &mut mpsc::Receiver<String>,
    ) -> Result<Exit> {
        loop {
            select! {
                line = lines.next_line() => {
                    match line.context("failed to read from client")? {
                        Some(text) if text.trim() == QUIT_COMMAND => return Ok(Exit::Quit),
                        Some(text) if text.trim().is_empty() => {}
                        Some(text) => {
                            self.broadcaster.deliver(Message::chat(username, text)).await
                        }
                        None => return Ok(Exit::Hangup),
                    }
                }
                outgoing = inbox.recv() => {
                    match outgoing {
                        Some(line) => write_line(writer, &line)
                            .await
                            .context("failed to deliver to client")?,
                        // The broadcaster dropped this client.
                        None => return Ok(Exit::Evicted),
                    }
                }
                _ = stopped(&mut self.stop) => {
                    while let Ok(line) = inbox.try_recv() {
                        write_line(writer, &line)
                            .await
                            .context("failed to deliver to client")?;
                    }
                    return Ok(Exit::Shutdown);
                }
            }
        }
    }

    async fn cleanup(&self, username: &str, key: &EndpointKey, exit: &Result<Exit>) {
        match self.registry.unregister_endpoint(username, key) {
            Some(_) => {
                info!(peer = %self.peer, %username, ?exit, "client disconnected");
                self.broadcaster.deliver(Message::left(username)).await;
            }
            None => debug!(peer = %self.peer, %username, "client already removed"),
        }
    }
}

/// `None` when the handshake timeout expired first.
async fn read_first_line(
    reader: &mut BufReader<OwnedReadHalf>,
    limit: Option<Duration>,
) -> Option<std::io::Result<Option<String>>> {
    match limit {
        Some(limit) => timeout(limit, read_line(reader)).await.ok(),
        None => Some(read_line(reader).await),
    }
}

/// Resolves once the stop signal is raised or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
