pub mod alerts;
pub mod app;
pub mod db;
pub mod error;
pub mod migration;
pub mod proctor;
pub mod progress;
pub mod remote;
pub mod server;
pub mod session;
pub mod settings;
pub mod sync;
pub mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;

pub use app::App;
use settings::{EngineSettings, SettingsStore};

const DEFAULT_CONFIG_PATH: &str = "studyguard.json";

/// Entry point of the `studyguard` binary: serves the HTTP surface until Ctrl-C.
pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("studyguard starting up...");

    let config_path = std::env::var("STUDYGUARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let settings_store = SettingsStore::new(config_path)?;
    let mut settings = settings_store.settings();
    settings.apply_env_overrides();
    info!("settings loaded from {}", settings_store.path().display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(serve_until_shutdown(settings))
}

async fn serve_until_shutdown(settings: EngineSettings) -> Result<()> {
    let app = App::open(settings).await?;
    let bind_addr = app.settings().bind_addr.clone();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;

    server::serve(listener, app.router(), shutdown_signal()).await?;

    // give queued alerts a chance to reach the remote store
    app.alerts().flush().await;
    info!("studyguard stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => {
            warn!("could not listen for Ctrl-C ({err}); running until killed");
            std::future::pending::<()>().await;
        }
    }
}
