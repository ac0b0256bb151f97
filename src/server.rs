use std::future::Future;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::migration::{commands::migrate_handler, MigrationEngine};

pub fn router(engine: MigrationEngine) -> Router {
    Router::new()
        .route("/migrate", post(migrate_handler))
        .route("/health", get(health))
        .with_state(engine)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serves `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("listening on http://{addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")
}
