use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{bail, Context, Result};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::settings::SyncSettings;

use super::{
    analytics::VideoAnalytics,
    engine::{SyncEngine, SyncReport},
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Held while a sync pass runs; a second pass is skipped rather than queued.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the periodic sync task for one learning session.
pub struct SyncController {
    engine: SyncEngine,
    settings: SyncSettings,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    user_id: Option<String>,
    busy: Arc<AtomicBool>,
    dashboard_tx: Arc<watch::Sender<bool>>,
    analytics_tx: Arc<watch::Sender<Option<VideoAnalytics>>>,
}

impl SyncController {
    pub fn new(engine: SyncEngine, settings: SyncSettings) -> Self {
        let (dashboard_tx, _) = watch::channel(false);
        let (analytics_tx, _) = watch::channel(None);
        Self {
            engine,
            settings,
            handle: None,
            cancel_token: None,
            user_id: None,
            busy: Arc::new(AtomicBool::new(false)),
            dashboard_tx: Arc::new(dashboard_tx),
            analytics_tx: Arc::new(analytics_tx),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self, user_id: &str) -> Result<()> {
        if self.handle.is_some() {
            bail!("sync already active");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sync_loop(
            self.engine.clone(),
            user_id.to_string(),
            self.settings.clone(),
            self.busy.clone(),
            self.dashboard_tx.subscribe(),
            self.analytics_tx.clone(),
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.user_id = Some(user_id.to_string());
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.user_id = None;

        if let Some(handle) = self.handle.take() {
            handle.await.context("sync task failed to join")
        } else {
            Ok(())
        }
    }

    /// Analytics are only gathered while a dashboard is showing them.
    pub fn set_dashboard_visible(&self, visible: bool) {
        self.dashboard_tx.send_replace(visible);
    }

    pub fn subscribe_analytics(&self) -> watch::Receiver<Option<VideoAnalytics>> {
        self.analytics_tx.subscribe()
    }

    /// Runs a video and aggregate pass now. `None` when a pass is already running.
    pub async fn sync_now(&self, user_id: &str) -> Result<Option<SyncReport>> {
        let Some(_guard) = BusyGuard::try_acquire(&self.busy) else {
            log_info!("sync already in progress, skipping manual sync");
            return Ok(None);
        };
        let report = self.engine.sync_videos().await;
        self.engine.sync_aggregates(user_id).await?;
        Ok(Some(report))
    }
}

async fn sync_loop(
    engine: SyncEngine,
    user_id: String,
    settings: SyncSettings,
    busy: Arc<AtomicBool>,
    dashboard_rx: watch::Receiver<bool>,
    analytics_tx: Arc<watch::Sender<Option<VideoAnalytics>>>,
    cancel_token: CancellationToken,
) {
    let mut video_ticker = ticker(settings.video_interval_ms);
    let mut aggregate_ticker = ticker(settings.aggregate_interval_ms);
    let mut analytics_ticker = ticker(settings.analytics_interval_ms);

    log_info!("sync loop started for {user_id}");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log_info!("sync loop shutting down for {user_id}");
                break;
            }
            _ = video_ticker.tick() => {
                let Some(_guard) = BusyGuard::try_acquire(&busy) else {
                    continue;
                };
                engine.sync_videos().await;
            }
            _ = aggregate_ticker.tick() => {
                let Some(_guard) = BusyGuard::try_acquire(&busy) else {
                    continue;
                };
                if let Err(err) = engine.sync_aggregates(&user_id).await {
                    log_warn!("aggregate sync for {user_id} failed: {err:#}");
                }
            }
            _ = analytics_ticker.tick() => {
                if !*dashboard_rx.borrow() {
                    continue;
                }
                match engine.collect_analytics(&user_id).await {
                    Ok(analytics) => {
                        analytics_tx.send_replace(Some(analytics));
                    }
                    Err(err) => log_error!("analytics refresh for {user_id} failed: {err:#}"),
                }
            }
        }
    }
}

fn ticker(period_ms: u64) -> time::Interval {
    let mut interval = time::interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{Database, VideoProgressPatch},
        progress::ProgressStore,
        remote::{MemoryRemoteStore, RemoteStore},
        settings::ProgressPolicy,
        utils::ManualClock,
    };

    async fn controller() -> (SyncController, ProgressStore, Arc<MemoryRemoteStore>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = Arc::new(MemoryRemoteStore::new());
        let store = ProgressStore::open(
            Database::open_in_memory().unwrap(),
            clock,
            ProgressPolicy::default(),
        )
        .await
        .unwrap();
        let engine = SyncEngine::new(store.clone(), remote.clone(), &SyncSettings::default());
        (
            SyncController::new(engine, SyncSettings::default()),
            store,
            remote,
        )
    }

    #[test]
    fn busy_guard_is_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = BusyGuard::try_acquire(&flag);
        assert!(first.is_some());
        assert!(BusyGuard::try_acquire(&flag).is_none());
        drop(first);
        assert!(BusyGuard::try_acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn start_twice_fails_and_stop_joins() {
        let (mut sync, _, _) = controller().await;
        sync.start("u1").unwrap();
        assert!(sync.start("u1").is_err());
        sync.stop().await.unwrap();
        assert!(!sync.is_running());
        sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sync_now_pushes_dirty_records() {
        let (sync, store, remote) = controller().await;
        store
            .save_video_progress("u1", "rust", "video-1", &VideoProgressPatch::playback(5.0, 10.0, 5.0))
            .await
            .unwrap();

        let report = sync.sync_now("u1").await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert!(remote.get("users/u1/overall").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_now_skips_while_busy() {
        let (sync, _, _) = controller().await;
        let _held = BusyGuard::try_acquire(&sync.busy).unwrap();
        assert!(sync.sync_now("u1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_pushes_without_manual_sync() {
        let (mut sync, store, remote) = controller().await;
        sync.start("u1").unwrap();

        store
            .save_video_progress("u1", "rust", "video-1", &VideoProgressPatch::playback(5.0, 10.0, 5.0))
            .await
            .unwrap();

        time::sleep(Duration::from_millis(5_100)).await;
        sync.stop().await.unwrap();

        assert!(store.dirty_records().await.is_empty());
        assert!(remote
            .get("users/u1/videos/rust_video-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn analytics_only_while_dashboard_visible() {
        let (mut sync, store, _) = controller().await;
        let mut analytics = sync.subscribe_analytics();
        store
            .save_video_progress("u1", "rust", "video-1", &VideoProgressPatch::playback(10.0, 10.0, 10.0))
            .await
            .unwrap();
        sync.start("u1").unwrap();

        time::sleep(Duration::from_millis(10_500)).await;
        assert!(analytics.borrow_and_update().is_none());

        sync.set_dashboard_visible(true);
        time::sleep(Duration::from_millis(10_500)).await;
        sync.stop().await.unwrap();

        let snapshot = analytics.borrow_and_update().clone().unwrap();
        assert_eq!(snapshot.videos_tracked, 1);
        assert_eq!(snapshot.videos_completed, 1);
    }
}
