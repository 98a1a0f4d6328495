use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roulette_match::cli::Cli;
use roulette_match::MatchServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.to_config();
    info!(
        interval_ms = config.match_interval.as_millis() as u64,
        handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
        "starting roulette matchmaker"
    );

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    info!(addr = %cli.bind, "roulette matchmaker listening");

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down");
        stop.cancel();
    });
    roulette_match::serve(listener, MatchServer::new(config), shutdown)
        .await
        .context("http server failed")
}
