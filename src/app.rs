use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use log::{info, warn};

use crate::{
    alerts::{AlertSink, DEFAULT_QUEUE_CAPACITY},
    db::Database,
    migration::{LocalStorage, MigrationEngine},
    proctor::{CameraSlot, CommandPresenceCapability, PresenceCapability, ProctorController},
    progress::ProgressStore,
    remote::{MemoryRemoteStore, RestRemoteStore, SharedRemote},
    server,
    session::SessionController,
    settings::{EngineSettings, ProctorSettings, RemoteSettings},
    sync::{SyncController, SyncEngine},
    utils::{SharedClock, SystemClock},
};

/// Shared services built once per process from `EngineSettings`.
#[derive(Clone)]
pub struct App {
    settings: EngineSettings,
    clock: SharedClock,
    store: ProgressStore,
    remote: SharedRemote,
    alerts: AlertSink,
    migration: MigrationEngine,
    capability: Option<Arc<dyn PresenceCapability>>,
}

impl App {
    /// Opens the database at `settings.database_path` and picks the remote store.
    pub async fn open(settings: EngineSettings) -> Result<Self> {
        if let Some(parent) = settings.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory {}", parent.display())
                })?;
            }
        }
        let db = Database::new(settings.database_path.clone())?;
        let remote = remote_from_settings(&settings.remote)?;
        Self::with_parts(settings, db, remote, Arc::new(SystemClock)).await
    }

    pub async fn with_parts(
        settings: EngineSettings,
        db: Database,
        remote: SharedRemote,
        clock: SharedClock,
    ) -> Result<Self> {
        let store = ProgressStore::open(db.clone(), clock.clone(), settings.progress).await?;
        let alerts = AlertSink::spawn(remote.clone(), DEFAULT_QUEUE_CAPACITY);
        let migration = MigrationEngine::new(
            LocalStorage::new(db),
            remote.clone(),
            store.clone(),
            Some(alerts.clone()),
        );
        let capability = presence_capability(&settings.proctoring);

        Ok(Self {
            settings,
            clock,
            store,
            remote,
            alerts,
            migration,
            capability,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn remote(&self) -> &SharedRemote {
        &self.remote
    }

    pub fn alerts(&self) -> &AlertSink {
        &self.alerts
    }

    pub fn migration(&self) -> &MigrationEngine {
        &self.migration
    }

    pub fn router(&self) -> Router {
        server::router(self.migration.clone())
    }

    /// A fresh session orchestrator sharing this process's stores.
    pub fn session_controller(&self) -> SessionController {
        let sync = SyncController::new(
            SyncEngine::new(self.store.clone(), self.remote.clone(), &self.settings.sync),
            self.settings.sync.clone(),
        );
        let proctor = ProctorController::new(
            self.settings.proctoring.clone(),
            self.store.clone(),
            self.alerts.clone(),
            self.clock.clone(),
            self.capability.clone(),
            CameraSlot::global(),
        );
        SessionController::new(self.store.clone(), self.migration.clone(), sync, proctor)
    }
}

fn remote_from_settings(settings: &RemoteSettings) -> Result<SharedRemote> {
    match settings.base_url.as_deref() {
        Some(url) => {
            info!("using remote store at {url}");
            let remote = RestRemoteStore::new(url, settings.auth_token.clone())
                .context("Failed to build remote store client")?;
            Ok(Arc::new(remote))
        }
        None => {
            warn!("no remote base_url configured; progress is only mirrored in memory");
            Ok(Arc::new(MemoryRemoteStore::new()))
        }
    }
}

fn presence_capability(settings: &ProctorSettings) -> Option<Arc<dyn PresenceCapability>> {
    let command = settings.presence_command.as_deref()?;
    match CommandPresenceCapability::from_command_line(command) {
        Some(capability) => Some(Arc::new(capability)),
        None => {
            warn!("presence_command is empty; face detection disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_database_and_defaults_to_memory_remote() {
        let dir = tempdir().unwrap();
        let settings = EngineSettings {
            database_path: dir.path().join("nested").join("progress.sqlite3"),
            ..EngineSettings::default()
        };

        let app = App::open(settings).await.unwrap();
        assert!(dir.path().join("nested").join("progress.sqlite3").exists());
        assert!(app.remote().get("users").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_presence_command_disables_face_detection() {
        let mut settings = EngineSettings::default();
        settings.proctoring.presence_command = Some(Vec::new());
        assert!(presence_capability(&settings.proctoring).is_none());

        settings.proctoring.presence_command = Some(vec!["detector".into(), "--json".into()]);
        assert!(presence_capability(&settings.proctoring).is_some());

        let app = App::with_parts(
            EngineSettings::default(),
            Database::open_in_memory().unwrap(),
            Arc::new(MemoryRemoteStore::new()),
            Arc::new(ManualClock::new(0)),
        )
        .await
        .unwrap();
        assert!(app.capability.is_none());
    }
}
