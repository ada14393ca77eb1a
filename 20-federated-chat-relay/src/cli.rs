use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{peer::PeerConfig, server::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one relay instance, federated with a sibling instance.
    Server(ServerArgs),
    /// Connect to a relay and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address for stream clients. Datagram clients use it too unless
    /// `--udp-listen` is given.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub listen: SocketAddr,

    /// Address for datagram clients.
    #[arg(long)]
    pub udp_listen: Option<SocketAddr>,

    /// Address the sibling instance dials to reach this one.
    #[arg(long, default_value = "127.0.0.1:9100")]
    pub peer_listen: SocketAddr,

    /// The sibling's `--peer-listen` address.
    #[arg(long, default_value = "127.0.0.1:9101")]
    pub peer: SocketAddr,

    /// Delay between attempts to reach the sibling.
    #[arg(long, default_value_t = 1000)]
    pub peer_retry_ms: u64,

    /// Stop dialing the sibling once an established link is lost.
    #[arg(long)]
    pub no_peer_reconnect: bool,

    /// Seconds a new stream client has to send its username. 0 waits forever.
    #[arg(long, default_value_t = 30)]
    pub handshake_timeout_secs: u64,
}

impl ServerArgs {
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_listen.unwrap_or(self.listen)
    }

    pub fn config(&self) -> ServerConfig {
        let peer = PeerConfig {
            retry_delay: Duration::from_millis(self.peer_retry_ms),
            reconnect: !self.no_peer_reconnect,
            ..PeerConfig::new(self.peer)
        };
        let handshake_timeout = (self.handshake_timeout_secs > 0)
            .then(|| Duration::from_secs(self.handshake_timeout_secs));

        ServerConfig {
            peer,
            handshake_timeout,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to register with.
    #[arg(long)]
    pub username: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,

    /// Talk to the relay over datagrams instead of a stream.
    #[arg(long)]
    pub udp: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_args_build_config() {
        let cli = Cli::parse_from([
            "relay",
            "server",
            "--listen",
            "127.0.0.1:7000",
            "--peer",
            "127.0.0.1:7101",
            "--peer-retry-ms",
            "50",
            "--handshake-timeout-secs",
            "0",
            "--no-peer-reconnect",
        ]);

        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.udp_addr(), "127.0.0.1:7000".parse::<SocketAddr>().unwrap());

        let config = args.config();
        assert_eq!(config.peer.remote, "127.0.0.1:7101".parse::<SocketAddr>().unwrap());
        assert_eq!(config.peer.retry_delay, Duration::from_millis(50));
        assert!(!config.peer.reconnect);
        assert_eq!(config.handshake_timeout, None);
    }

    #[test]
    fn client_defaults_to_stream() {
        let cli = Cli::parse_from(["relay", "client", "--username", "alice"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert!(!args.udp);
        assert_eq!(args.server, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }
}
