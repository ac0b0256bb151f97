use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};

use crate::{
    db::{CourseProgress, MigrationResult, OverallProgress, VideoProgress, VideoProgressPatch},
    migration::MigrationEngine,
    proctor::{HostSignal, MonitorStatus, ProctorContext, ProctorController, ProctorEvent},
    progress::ProgressStore,
    remote::validate_key,
    sync::{SyncController, SyncReport, VideoAnalytics},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user_id: String,
    pub course_id: String,
    pub video_id: String,
    pub started_at: i64,
    pub migration: Option<MigrationResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session: SessionInfo,
    pub ended_at: i64,
    pub course: CourseProgress,
    pub overall: OverallProgress,
    pub final_sync: Option<SyncReport>,
}

/// Ties migration, sync and proctoring to the lifetime of a learning session.
#[derive(Clone)]
pub struct SessionController {
    state: Arc<Mutex<Option<SessionInfo>>>,
    store: ProgressStore,
    migration: MigrationEngine,
    sync: Arc<Mutex<SyncController>>,
    proctor: Arc<Mutex<ProctorController>>,
}

impl SessionController {
    pub fn new(
        store: ProgressStore,
        migration: MigrationEngine,
        sync: SyncController,
        proctor: ProctorController,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            store,
            migration,
            sync: Arc::new(Mutex::new(sync)),
            proctor: Arc::new(Mutex::new(proctor)),
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub async fn current(&self) -> Option<SessionInfo> {
        self.state.lock().await.clone()
    }

    pub async fn start_session(
        &self,
        user_id: &str,
        course_id: &str,
        video_id: &str,
    ) -> Result<SessionInfo> {
        // ids become remote path segments
        validate_key("userId", user_id)?;
        validate_key("courseId", course_id)?;
        validate_key("videoId", video_id)?;

        let mut state = self.state.lock().await;
        if state.is_some() {
            bail!("session already active");
        }

        // a failed migration keeps its legacy data and is retried next session
        let migration = match self.migration.run_at_session_start(user_id).await {
            Ok(result) => result,
            Err(err) => {
                warn!("session-start migration for {user_id} failed: {err:#}");
                None
            }
        };

        self.sync.lock().await.start(user_id)?;

        let ctx = ProctorContext {
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            video_id: video_id.to_string(),
        };
        if let Err(err) = self.proctor.lock().await.start(ctx).await {
            let _ = self.sync.lock().await.stop().await;
            return Err(err);
        }

        let info = SessionInfo {
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            video_id: video_id.to_string(),
            started_at: self.store.clock().now_ms(),
            migration,
        };
        info!("session started for {user_id} on {course_id}/{video_id}");
        *state = Some(info.clone());
        Ok(info)
    }

    /// Playback tick for the session's current video.
    pub async fn record_playback(&self, patch: &VideoProgressPatch) -> Result<VideoProgress> {
        let session = self
            .current()
            .await
            .ok_or_else(|| anyhow!("no active session"))?;
        self.store
            .save_video_progress(&session.user_id, &session.course_id, &session.video_id, patch)
            .await
    }

    pub async fn signal(&self, signal: HostSignal) -> Result<()> {
        self.proctor.lock().await.signal(signal).await
    }

    pub async fn subscribe_events(&self) -> broadcast::Receiver<ProctorEvent> {
        self.proctor.lock().await.subscribe()
    }

    pub async fn face_status(&self) -> MonitorStatus {
        self.proctor.lock().await.face_status()
    }

    pub async fn subscribe_analytics(&self) -> watch::Receiver<Option<VideoAnalytics>> {
        self.sync.lock().await.subscribe_analytics()
    }

    pub async fn set_dashboard_visible(&self, visible: bool) {
        self.sync.lock().await.set_dashboard_visible(visible);
    }

    /// Stops proctoring (releasing the camera) then sync, and pushes what is left.
    pub async fn end_session(&self) -> Result<SessionSummary> {
        let mut state = self.state.lock().await;
        let session = state.take().ok_or_else(|| anyhow!("no active session to end"))?;

        if let Err(err) = self.proctor.lock().await.stop().await {
            warn!("proctoring did not stop cleanly: {err:#}");
        }

        let final_sync = {
            let mut sync = self.sync.lock().await;
            if let Err(err) = sync.stop().await {
                warn!("sync did not stop cleanly: {err:#}");
            }
            match sync.sync_now(&session.user_id).await {
                Ok(report) => report,
                Err(err) => {
                    warn!("final sync for {} failed: {err:#}", session.user_id);
                    None
                }
            }
        };

        let (courses, overall) = self.store.cache_aggregates(&session.user_id).await?;
        let course = courses
            .into_iter()
            .find(|course| course.course_id == session.course_id)
            .unwrap_or_else(|| {
                CourseProgress::from_counts(&session.course_id, 0, 0, self.store.clock().now_ms())
            });

        info!("session ended for {}", session.user_id);
        Ok(SessionSummary {
            ended_at: self.store.clock().now_ms(),
            session,
            course,
            overall,
            final_sync,
        })
    }
}
