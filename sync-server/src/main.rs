use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use sync_server::{AppState, InMemoryChangeLogStore, InMemoryEntityRepository, InMemoryIdempotencyStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let change_log = Arc::new(InMemoryChangeLogStore::new());
    let state = Arc::new(AppState {
        change_log: change_log.clone(),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        repository: Arc::new(InMemoryEntityRepository::new(change_log)),
    });

    let addr: SocketAddr = std::env::var("SYNC_SERVER_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

    let app = sync_server::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("sync-server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("sync-server: received ctrl-c, shutting down");
}
