//! Connectionless clients.
//!
//! All datagram clients share one socket, so identity comes from the source
//! address: the first datagram from an unknown address is its username, and
//! every later datagram from that address is chat text. There is no
//! disconnect signal; a client leaves by sending `/quit` or by failing a
//! send during fan-out.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    message::{
        Message, QUIT_COMMAND, USERNAME_ACCEPTED, USERNAME_TAKEN, decode_datagram,
        normalize_username,
    },
    registry::{ClientRegistry, Endpoint, EndpointKey},
};

const MAX_DATAGRAM: usize = 65_535;

pub struct DatagramListener {
    socket: Arc<UdpSocket>,
    registry: Arc<ClientRegistry>,
    broadcaster: Arc<Broadcaster>,
}

impl DatagramListener {
    /// `socket` must be the same socket the broadcaster replies through,
    /// otherwise clients would see chat arrive from a different address.
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<ClientRegistry>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            socket,
            registry,
            broadcaster,
        }
    }

    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                // Some platforms report an earlier send's ICMP error here.
                Err(error) => debug!(?error, "datagram receive failed"),
            }
        }
    }

    async fn handle_datagram(&self, payload: &[u8], from: SocketAddr) {
        let text = decode_datagram(payload);
        match self.registry.lookup_by_endpoint(&EndpointKey::datagram(from)) {
            Some(username) => self.handle_chat(username, text, from).await,
            None => self.handle_registration(&text, from).await,
        }
    }

    async fn handle_registration(&self, text: &str, from: SocketAddr) {
        let username = normalize_username(text);
        match self.registry.register(&username, Endpoint::Datagram(from)) {
            Ok(()) => {
                info!(peer = %from, %username, "datagram client joined");
                self.reply(USERNAME_ACCEPTED, from).await;
                self.broadcaster.deliver(Message::joined(&username)).await;
            }
            Err(err) => {
                info!(peer = %from, %err, "registration rejected");
                self.reply(USERNAME_TAKEN, from).await;
            }
        }
    }

    async fn handle_chat(&self, username: String, text: String, from: SocketAddr) {
        if text.trim() == QUIT_COMMAND {
            if self
                .registry
                .unregister_endpoint(&username, &EndpointKey::datagram(from))
                .is_some()
            {
                info!(peer = %from, %username, "datagram client left");
                self.broadcaster.deliver(Message::left(&username)).await;
            }
            return;
        }

        if text.trim().is_empty() {
            return;
        }

        self.broadcaster.deliver(Message::chat(&username, text)).await;
    }

    async fn reply(&self, token: &str, to: SocketAddr) {
        if let Err(error) = self.socket.send_to(token.as_bytes(), to).await {
            warn!(peer = %to, ?error, "failed to reply to datagram client");
        }
    }
}
