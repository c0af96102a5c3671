use anyhow::Result;
use clap::Parser;
use tracing::warn;

use rpc_kv_server::{cli::Cli, server::Server};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().into_config()?;
    let server = Server::bind(config)?;
    if let Err(err) = server.run() {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
