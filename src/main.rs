use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use crate::config::Cli;
use crate::toy_redis::Server;

mod config;
mod toy_redis;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().resolve()?;
    let server = Server::bind(&config).await?;
    let stats = server.stats();
    let addr = server.local_addr()?;

    info!(
        %addr,
        idle_timeout = ?config.idle_timeout(),
        accept_errors = ?config.accept_errors,
        "listening"
    );
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    info!(
        active_sessions = stats.active(),
        total_sessions = stats.total(),
        "server stopped"
    );
    Ok(())
}
