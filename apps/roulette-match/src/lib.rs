pub mod cli;
pub mod config;
pub mod conn;
pub mod lobby;
pub mod metrics;
pub mod routes;
pub mod server;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub use config::MatchConfig;
pub use conn::MatchError;
pub use server::{MatchServer, MatchStats};

/// Runs the matching loop and the HTTP listener until `shutdown` fires,
/// then waits for both to wind down.
pub async fn serve(
    listener: TcpListener,
    server: Arc<MatchServer>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let matching = tokio::spawn(Arc::clone(&server).run(shutdown.clone()));
    let app = routes::build_router(server);
    let stop = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await;
    shutdown.cancel();
    matching.await.ok();
    result
}

/// Starts [`serve`] on a background task and returns the server so callers
/// can inspect it.
pub fn spawn(listener: TcpListener, config: MatchConfig, shutdown: CancellationToken) -> Arc<MatchServer> {
    let server = MatchServer::new(config);
    let background = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(err) = serve(listener, background, shutdown).await {
            error!(error = %err, "http server stopped");
        }
    });
    server
}
