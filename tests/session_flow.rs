use std::sync::Arc;

use studyguard_lib::{
    db::{Database, VideoProgress, VideoProgressPatch},
    migration::legacy_key,
    proctor::{HostSignal, ProctorEvent},
    remote::{MemoryRemoteStore, RemoteStore},
    settings::EngineSettings,
    sync::SyncEngine,
    utils::{Clock, ManualClock},
    App,
};

struct Fixture {
    app: App,
    remote: Arc<MemoryRemoteStore>,
    clock: Arc<ManualClock>,
}

async fn fixture() -> Fixture {
    let remote = Arc::new(MemoryRemoteStore::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let app = App::with_parts(
        EngineSettings::default(),
        Database::open_in_memory().unwrap(),
        remote.clone(),
        clock.clone(),
    )
    .await
    .unwrap();
    Fixture { app, remote, clock }
}

async fn remote_video(remote: &MemoryRemoteStore, path: &str) -> Option<VideoProgress> {
    remote
        .get(path)
        .await
        .unwrap()
        .map(|value| serde_json::from_value(value).unwrap())
}

#[tokio::test]
async fn progress_recorded_offline_reaches_remote_after_outage() {
    let f = fixture().await;
    let engine = SyncEngine::new(
        f.app.store().clone(),
        f.app.remote().clone(),
        &f.app.settings().sync,
    );

    f.remote.set_available(false);
    let saved = f
        .app
        .store()
        .save_video_progress("u1", "rust", "video-2", &VideoProgressPatch::playback(320.0, 600.0, 300.0))
        .await
        .unwrap();
    assert_eq!(saved.valid_watch_time, 300.0);

    let report = engine.sync_videos().await;
    assert_eq!(report.failed, 1);
    assert_eq!(engine.outbox_entries().await[0].attempts, 1);

    // still backing off, nothing is attempted
    f.remote.set_available(true);
    let report = engine.sync_videos().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(report.deferred, 1);

    f.clock.advance_ms(6_000);
    let report = engine.sync_videos().await;
    assert_eq!(report.synced, 1);
    assert!(f.app.store().dirty_records().await.is_empty());
    assert!(engine.outbox_entries().await.is_empty());

    let pushed = remote_video(&f.remote, "users/u1/videos/rust_video-2").await.unwrap();
    assert_eq!(pushed.valid_watch_time, 300.0);
    assert_eq!(pushed.last_position, 320.0);
}

#[tokio::test]
async fn other_device_progress_is_never_lowered() {
    let f = fixture().await;
    let engine = SyncEngine::new(
        f.app.store().clone(),
        f.app.remote().clone(),
        &f.app.settings().sync,
    );

    let other_device = VideoProgress {
        valid_watch_time: 580.0,
        total_duration: 600.0,
        last_position: 590.0,
        completed: true,
        last_sync_time: f.clock.now_ms() + 60_000,
        updated_at: f.clock.now_ms() + 60_000,
        ..VideoProgress::new("rust", "video-1")
    };
    f.remote
        .set(
            "users/u1/videos/rust_video-1",
            serde_json::to_value(&other_device).unwrap(),
        )
        .await
        .unwrap();

    f.app
        .store()
        .save_video_progress("u1", "rust", "video-1", &VideoProgressPatch::playback(100.0, 600.0, 100.0))
        .await
        .unwrap();
    assert_eq!(engine.sync_videos().await.synced, 1);

    let merged = remote_video(&f.remote, "users/u1/videos/rust_video-1").await.unwrap();
    assert_eq!(merged.valid_watch_time, 580.0);
    assert!(merged.completed);
    // the remote write is newer than the local edit, so its position wins
    assert_eq!(merged.last_position, 590.0);

    let local = f
        .app
        .store()
        .get_video_progress("u1", "rust", "video-1")
        .await
        .unwrap();
    assert_eq!(local.valid_watch_time, 580.0);
    assert_eq!(local.last_position, 590.0);
    assert!(local.completed);
}

#[tokio::test]
async fn full_session_migrates_proctors_and_syncs() {
    let f = fixture().await;
    f.app
        .migration()
        .storage()
        .set(
            &legacy_key("web-development"),
            r#"{"completedVideos":["a","b","c"],"totalVideos":10}"#,
        )
        .await
        .unwrap();

    let session = f.app.session_controller();
    let info = session
        .start_session("u1", "web-development", "video-4")
        .await
        .unwrap();
    assert_eq!(info.migration.unwrap().completed_videos, 3);

    let mut events = session.subscribe_events().await;
    session
        .signal(HostSignal::VisibilityChanged { hidden: true })
        .await
        .unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        ProctorEvent::TabSwitchDetected { count: 1, max: 3 }
    );

    session
        .record_playback(&VideoProgressPatch::playback(590.0, 600.0, 560.0))
        .await
        .unwrap();

    let summary = session.end_session().await.unwrap();
    assert_eq!(summary.course.completed_videos, 4);
    assert_eq!(summary.overall.overall_progress, 40);

    let video = remote_video(&f.remote, "users/u1/videos/web-development_video-4")
        .await
        .unwrap();
    assert!(video.completed);
    assert_eq!(video.violations.tab_switches, 1);
}
