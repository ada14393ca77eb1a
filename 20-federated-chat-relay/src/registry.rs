//! Registered chat identities for one server instance.
//!
//! The registry is the only structure every listener task mutates, so it
//! owns a single lock. The lock is never held across an `.await`; callers
//! that need to send to clients take a [`ClientRegistry::snapshot`] first.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Stream,
    Datagram,
}

/// Handle to a connected stream client's session task.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    addr: SocketAddr,
    outbox: mpsc::Sender<String>,
}

impl StreamHandle {
    pub fn new(addr: SocketAddr, outbox: mpsc::Sender<String>) -> Self {
        Self { addr, outbox }
    }

    /// Queues a line for the session's writer without waiting. A full
    /// outbox means the client is not keeping up and counts as a failure.
    pub fn try_send(
        &self,
        line: String,
    ) -> std::result::Result<(), mpsc::error::TrySendError<String>> {
        self.outbox.try_send(line)
    }
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    Stream(StreamHandle),
    Datagram(SocketAddr),
}

impl Endpoint {
    pub fn transport(&self) -> Transport {
        match self {
            Endpoint::Stream(_) => Transport::Stream,
            Endpoint::Datagram(_) => Transport::Datagram,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        match self {
            Endpoint::Stream(handle) => handle.addr,
            Endpoint::Datagram(addr) => *addr,
        }
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            transport: self.transport(),
            addr: self.addr(),
        }
    }
}

/// Identifies an endpoint independently of its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub transport: Transport,
    pub addr: SocketAddr,
}

impl EndpointKey {
    pub fn datagram(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Datagram,
            addr,
        }
    }

    pub fn stream(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Stream,
            addr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub username: String,
    pub endpoint: Endpoint,
}

impl ClientIdentity {
    pub fn transport(&self) -> Transport {
        self.endpoint.transport()
    }
}

#[derive(Default)]
struct Entries {
    by_name: BTreeMap<String, ClientIdentity>,
    by_endpoint: HashMap<EndpointKey, String>,
}

#[derive(Default)]
pub struct ClientRegistry {
    entries: Mutex<Entries>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        // Every critical section leaves both maps consistent, so a panic
        // elsewhere cannot leave them half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically checks the username and inserts the identity.
    pub fn register(&self, username: &str, endpoint: Endpoint) -> Result<()> {
        if username.is_empty() {
            return Err(RelayError::MalformedRegistration);
        }

        let mut entries = self.entries();
        if entries.by_name.contains_key(username) {
            return Err(RelayError::UsernameTaken(username.to_string()));
        }

        let key = endpoint.key();
        if entries.by_endpoint.contains_key(&key) {
            // An address can only speak for one identity at a time.
            return Err(RelayError::UsernameTaken(username.to_string()));
        }

        entries.by_endpoint.insert(key, username.to_string());
        entries.by_name.insert(
            username.to_string(),
            ClientIdentity {
                username: username.to_string(),
                endpoint,
            },
        );
        Ok(())
    }

    /// Removes `username` if present. Calling it twice is harmless.
    pub fn unregister(&self, username: &str) -> Option<ClientIdentity> {
        let mut entries = self.entries();
        let removed = entries.by_name.remove(username)?;
        entries.by_endpoint.remove(&removed.endpoint.key());
        Some(removed)
    }

    /// Removes `username` only while it is still bound to `key`.
    ///
    /// Session cleanup and send-failure eviction go through here so a
    /// late cleanup never removes a newer client that reused the name.
    pub fn unregister_endpoint(
        &self,
        username: &str,
        key: &EndpointKey,
    ) -> Option<ClientIdentity> {
        let mut entries = self.entries();
        match entries.by_name.get(username) {
            Some(identity) if identity.endpoint.key() == *key => {}
            _ => return None,
        }
        entries.by_endpoint.remove(key);
        entries.by_name.remove(username)
    }

    pub fn lookup_by_endpoint(&self, key: &EndpointKey) -> Option<String> {
        self.entries().by_endpoint.get(key).cloned()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries().by_name.contains_key(username)
    }

    /// Point-in-time copy ordered by username.
    pub fn snapshot(&self) -> Vec<ClientIdentity> {
        self.entries().by_name.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
