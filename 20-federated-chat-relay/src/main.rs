use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use federated_chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    server::{Listeners, Server},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let listeners = Listeners::bind(args.listen, args.udp_addr(), args.peer_listen).await?;
    let server = Server::new(listeners, args.config())?;
    let addrs = server.local_addrs();
    info!(
        "relay listening on tcp={} udp={} peer={}",
        addrs.stream, addrs.datagram, addrs.peer
    );
    info!(sibling = %args.peer, "federating with sibling");

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
