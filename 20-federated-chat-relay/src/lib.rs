//! Two-instance federated chat relay.
//!
//! A relay instance accepts chat clients over TCP (one line per message)
//! and UDP (one datagram per message), broadcasts every message to its
//! other local clients, and forwards it once over a TCP link to a sibling
//! instance. Lines arriving from the sibling are broadcast locally and
//! never sent back, so the two instances share one conversation without
//! echoing each other.
//!
//! - [`registry`] holds the registered usernames and how to reach them.
//! - [`stream`] runs the TCP listener and one session task per client.
//! - [`datagram`] runs the UDP listener, telling registrations from chat
//!   by source address.
//! - [`peer`] establishes and maintains the link to the sibling.
//! - [`broadcast`] fans messages out locally and forwards them to the peer.
//! - [`server`] wires the above together around one registry.
//! - [`message`] defines message origins, rendering, and line helpers.
//! - [`cli`] and [`client`] provide the command-line entry points.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod datagram;
pub mod error;
pub mod message;
pub mod peer;
pub mod registry;
pub mod server;
pub mod stream;
