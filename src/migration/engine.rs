use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use crate::{
    alerts::AlertSink,
    db::{Alert, AlertKind, CourseProgress, MigrationResult, OldCourseProgress, OverallProgress, VideoKey, VideoProgress},
    progress::{merge, ProgressStore},
    remote::{courses_path, overall_path, validate_key, video_path, SharedRemote},
};

use super::legacy::{legacy_key, parse_legacy_record, LocalStorage};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// One-shot converter from the legacy per-course format to per-video records.
///
/// Re-running with the same input is safe: synthesised records are merged
/// monotonically into whatever already exists and course aggregates are
/// overwritten rather than accumulated.
#[derive(Clone)]
pub struct MigrationEngine {
    storage: LocalStorage,
    remote: SharedRemote,
    store: ProgressStore,
    alerts: Option<AlertSink>,
}

impl MigrationEngine {
    pub fn new(
        storage: LocalStorage,
        remote: SharedRemote,
        store: ProgressStore,
        alerts: Option<AlertSink>,
    ) -> Self {
        Self {
            storage,
            remote,
            store,
            alerts,
        }
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub fn max_legacy_videos(&self) -> u32 {
        self.store.policy().max_legacy_videos
    }

    /// Legacy keys are per device, not per user: any key means migration is due.
    pub async fn is_migration_needed(&self, user_id: &str) -> Result<bool> {
        let ids = self.storage.legacy_course_ids().await?;
        if !ids.is_empty() {
            log_info!("{} legacy course entries found for {user_id}", ids.len());
        }
        Ok(!ids.is_empty())
    }

    pub async fn legacy_course_ids(&self) -> Result<Vec<String>> {
        self.storage.legacy_course_ids().await
    }

    /// Reads legacy entries; an unreadable or malformed course is skipped.
    pub async fn get_old_local_storage_data(
        &self,
        course_ids: &[String],
    ) -> BTreeMap<String, OldCourseProgress> {
        let mut data = BTreeMap::new();
        for course_id in course_ids {
            if let Err(err) = validate_key("courseId", course_id) {
                log_warn!("skipping legacy progress for {course_id:?}: {err}");
                continue;
            }
            let raw = match self.storage.get(&legacy_key(course_id)).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    log_warn!("failed to read legacy progress for {course_id}: {err:#}");
                    continue;
                }
            };
            match parse_legacy_record(&raw, self.max_legacy_videos()) {
                Ok(parsed) => {
                    data.insert(course_id.clone(), parsed);
                }
                Err(err) => log_warn!("skipping legacy progress for {course_id}: {err:#}"),
            }
        }
        data
    }

    /// Converts the legacy map for `user_id`. Never returns an error: failures
    /// come back as `success: false` with zero counts.
    pub async fn migrate_old_data(
        &self,
        user_id: &str,
        data: &BTreeMap<String, OldCourseProgress>,
    ) -> MigrationResult {
        match self.try_migrate(user_id, data).await {
            Ok(result) => {
                log_info!(
                    "migrated {} courses for {user_id} ({} / {} videos complete)",
                    result.migrated_courses,
                    result.completed_videos,
                    result.total_videos
                );
                if let Some(alerts) = &self.alerts {
                    alerts.submit(Alert::new(
                        user_id,
                        AlertKind::ProgressMigrated,
                        format!("Migrated progress for {} courses", result.migrated_courses),
                        None,
                        None,
                        self.store.clock().now(),
                    ));
                }
                result
            }
            Err(err) => {
                log_warn!("migration for {user_id} failed: {err:#}");
                MigrationResult::failed(format!("{err:#}"), self.store.clock().now_ms())
            }
        }
    }

    async fn try_migrate(
        &self,
        user_id: &str,
        data: &BTreeMap<String, OldCourseProgress>,
    ) -> Result<MigrationResult> {
        let policy = *self.store.policy();
        let now_ms = self.store.clock().now_ms();
        let duration = policy.legacy_video_duration_secs;

        // reject the whole batch before the first write
        validate_key("userId", user_id)?;
        for (course_id, legacy) in data {
            validate_key("courseId", course_id)?;
            if legacy.total_videos > policy.max_legacy_videos {
                bail!(
                    "course {course_id} claims {} videos, more than the {} allowed",
                    legacy.total_videos,
                    policy.max_legacy_videos
                );
            }
        }

        let mut course_fields = Map::new();
        let mut merged_records = Vec::new();
        let mut total_videos = 0u32;
        let mut completed_videos = 0u32;

        for (course_id, legacy) in data {
            let total = legacy.total_videos;
            let completed_legacy = legacy.completed_videos.min(total);
            let mut completed_here = 0u32;

            for n in 1..=total {
                let video_id = format!("video-{n}");
                let key = VideoKey::new(user_id, course_id, &video_id);
                let synthesised = synthesise(course_id, &video_id, n <= completed_legacy, duration, now_ms);

                let path = video_path(&key);
                let existing = self
                    .remote
                    .get(&path)
                    .await
                    .with_context(|| format!("failed to read {path}"))?
                    .and_then(|value| serde_json::from_value::<VideoProgress>(value).ok());

                // an existing record keeps its position and anything it already earned
                let merged = merge::absorb(existing.as_ref(), &synthesised, existing.is_some(), &policy);
                self.remote
                    .set(&path, serde_json::to_value(&merged)?)
                    .await
                    .with_context(|| format!("failed to write {path}"))?;

                if merged.completed {
                    completed_here += 1;
                }
                merged_records.push(merged);
            }

            let course = CourseProgress::from_counts(course_id, total, completed_here, now_ms);
            course_fields.insert(course_id.clone(), serde_json::to_value(&course)?);
            total_videos = total_videos.saturating_add(total);
            completed_videos = completed_videos.saturating_add(completed_here);
        }

        if !course_fields.is_empty() {
            self.remote
                .update(&courses_path(user_id), course_fields)
                .await
                .context("failed to write course aggregates")?;
        }

        let courses = self.remote_courses(user_id).await?;
        let overall = OverallProgress::from_courses(courses.values(), now_ms);
        self.remote
            .set(&overall_path(user_id), serde_json::to_value(&overall)?)
            .await
            .context("failed to write overall aggregate")?;

        for (course_id, legacy) in data {
            self.store
                .set_course_video_count(user_id, course_id, legacy.total_videos)
                .await?;
        }
        for record in &merged_records {
            self.store.absorb(user_id, record).await?;
        }
        self.store.cache_aggregates(user_id).await?;

        Ok(MigrationResult {
            success: true,
            migrated_courses: u32::try_from(data.len()).unwrap_or(u32::MAX),
            total_videos,
            completed_videos,
            timestamp: now_ms,
            error: None,
        })
    }

    async fn remote_courses(&self, user_id: &str) -> Result<BTreeMap<String, CourseProgress>> {
        let Some(Value::Object(children)) = self.remote.get(&courses_path(user_id)).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(children
            .into_iter()
            .filter_map(|(course_id, value)| {
                serde_json::from_value::<CourseProgress>(value)
                    .ok()
                    .map(|course| (course_id, course))
            })
            .collect())
    }

    /// Removes legacy keys. Only call after a successful migration.
    pub async fn clear_old_local_storage_data(&self, course_ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for course_id in course_ids {
            if self.storage.remove(&legacy_key(course_id)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Session-start hook: migrate if needed and clear legacy keys on success.
    ///
    /// Malformed entries are left in place for inspection.
    pub async fn run_at_session_start(&self, user_id: &str) -> Result<Option<MigrationResult>> {
        if !self.is_migration_needed(user_id).await? {
            return Ok(None);
        }

        let course_ids = self.legacy_course_ids().await?;
        let data = self.get_old_local_storage_data(&course_ids).await;
        if data.is_empty() {
            log_warn!("legacy entries for {user_id} were all unreadable, nothing migrated");
            return Ok(None);
        }

        let result = self.migrate_old_data(user_id, &data).await;
        if result.success {
            let migrated: Vec<String> = data.keys().cloned().collect();
            let removed = self.clear_old_local_storage_data(&migrated).await?;
            log_info!("cleared {removed} legacy entries for {user_id}");
        }
        Ok(Some(result))
    }
}

fn synthesise(course_id: &str, video_id: &str, completed: bool, duration: f64, now_ms: i64) -> VideoProgress {
    let watched = if completed { duration } else { 0.0 };
    VideoProgress {
        total_duration: duration,
        last_position: watched,
        valid_watch_time: watched,
        completed,
        last_sync_time: now_ms,
        updated_at: now_ms,
        ..VideoProgress::new(course_id, video_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{Database, VideoProgressPatch},
        remote::{MemoryRemoteStore, RemoteStore},
        settings::ProgressPolicy,
        utils::ManualClock,
    };
    use std::sync::Arc;

    struct Harness {
        remote: Arc<MemoryRemoteStore>,
        store: ProgressStore,
        engine: MigrationEngine,
    }

    async fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(50_000));
        let remote = Arc::new(MemoryRemoteStore::new());
        let store = ProgressStore::open(db.clone(), clock, ProgressPolicy::default())
            .await
            .unwrap();
        let engine = MigrationEngine::new(LocalStorage::new(db), remote.clone(), store.clone(), None);
        Harness {
            remote,
            store,
            engine,
        }
    }

    fn web_development() -> BTreeMap<String, OldCourseProgress> {
        BTreeMap::from([(
            "web-development".to_string(),
            OldCourseProgress {
                progress: 30.0,
                completed_videos: 3,
                total_videos: 10,
            },
        )])
    }

    #[tokio::test]
    async fn synthesises_per_video_records() {
        let h = harness().await;
        let result = h.engine.migrate_old_data("u1", &web_development()).await;

        assert!(result.success);
        assert_eq!(result.migrated_courses, 1);
        assert_eq!(result.total_videos, 10);
        assert_eq!(result.completed_videos, 3);

        for n in 1..=10 {
            let video = h
                .remote
                .get(&format!("users/u1/videos/web-development_video-{n}"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(video["completed"], n <= 3, "video-{n}");
        }

        let overall = h.remote.get("users/u1/overall").await.unwrap().unwrap();
        assert_eq!(overall["overallProgress"], 30);

        let local = h.store.get_course_progress("u1", "web-development").await.unwrap();
        assert_eq!(local.progress, 30);
        assert_eq!(local.total_videos, 10);
    }

    #[tokio::test]
    async fn running_twice_does_not_accumulate() {
        let h = harness().await;
        h.engine.migrate_old_data("u1", &web_development()).await;
        let courses_once = h.remote.get("users/u1/courses").await.unwrap();
        let overall_once = h.remote.get("users/u1/overall").await.unwrap();

        let second = h.engine.migrate_old_data("u1", &web_development()).await;
        assert!(second.success);
        assert_eq!(second.completed_videos, 3);
        assert_eq!(h.remote.get("users/u1/courses").await.unwrap(), courses_once);
        assert_eq!(h.remote.get("users/u1/overall").await.unwrap(), overall_once);
    }

    #[tokio::test]
    async fn existing_completion_is_kept() {
        let h = harness().await;
        h.store
            .save_video_progress(
                "u1",
                "web-development",
                "video-7",
                &VideoProgressPatch::playback(600.0, 600.0, 600.0),
            )
            .await
            .unwrap();
        let record = h.store.get_video_progress("u1", "web-development", "video-7").await.unwrap();
        h.remote
            .set(
                "users/u1/videos/web-development_video-7",
                serde_json::to_value(&record).unwrap(),
            )
            .await
            .unwrap();

        let result = h.engine.migrate_old_data("u1", &web_development()).await;
        assert_eq!(result.completed_videos, 4);

        let video = h
            .remote
            .get("users/u1/videos/web-development_video-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(video["completed"], true);
        assert!(h.store.get_video_progress("u1", "web-development", "video-7").await.unwrap().completed);
    }

    #[tokio::test]
    async fn remote_failure_reports_zero_counts() {
        let h = harness().await;
        h.remote.set_available(false);
        let result = h.engine.migrate_old_data("u1", &web_development()).await;
        assert!(!result.success);
        assert_eq!(result.migrated_courses, 0);
        assert_eq!(result.total_videos, 0);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn session_start_clears_only_after_success() {
        let h = harness().await;
        let storage = h.engine.storage().clone();
        storage
            .set(&legacy_key("web-development"), r#"{"completedVideos":3,"totalVideos":10,"progress":30}"#)
            .await
            .unwrap();
        storage.set(&legacy_key("broken"), "{oops").await.unwrap();

        h.remote.set_available(false);
        let failed = h.engine.run_at_session_start("u1").await.unwrap().unwrap();
        assert!(!failed.success);
        assert!(storage.get(&legacy_key("web-development")).await.unwrap().is_some());

        h.remote.set_available(true);
        let done = h.engine.run_at_session_start("u1").await.unwrap().unwrap();
        assert!(done.success);
        assert_eq!(done.migrated_courses, 1);
        assert!(storage.get(&legacy_key("web-development")).await.unwrap().is_none());
        // malformed entries stay behind
        assert!(storage.get(&legacy_key("broken")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unsafe_ids_and_oversized_courses_fail_without_writes() {
        let h = harness().await;

        let mut traversal = web_development();
        traversal.insert(
            "../../../alerts/x".to_string(),
            OldCourseProgress {
                progress: 50.0,
                completed_videos: 1,
                total_videos: 2,
            },
        );
        let result = h.engine.migrate_old_data("u1", &traversal).await;
        assert!(!result.success);
        assert_eq!(result.total_videos, 0);

        let result = h.engine.migrate_old_data("a/b", &web_development()).await;
        assert!(!result.success);

        let oversized = BTreeMap::from([(
            "web-development".to_string(),
            OldCourseProgress {
                progress: 0.0,
                completed_videos: 0,
                total_videos: u32::MAX,
            },
        )]);
        let result = h.engine.migrate_old_data("u1", &oversized).await;
        assert!(!result.success);

        assert_eq!(h.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn unsafe_legacy_keys_are_skipped() {
        let h = harness().await;
        let storage = h.engine.storage().clone();
        storage
            .set(&legacy_key("web-development"), r#"{"completedVideos":3,"totalVideos":10}"#)
            .await
            .unwrap();
        storage
            .set(&legacy_key("a/b"), r#"{"completedVideos":1,"totalVideos":2}"#)
            .await
            .unwrap();
        storage
            .set(&legacy_key("endless"), r#"{"completedVideos":1,"totalVideos":1e12}"#)
            .await
            .unwrap();

        let ids = h.engine.legacy_course_ids().await.unwrap();
        let data = h.engine.get_old_local_storage_data(&ids).await;
        assert_eq!(data.keys().collect::<Vec<_>>(), ["web-development"]);
    }

    #[tokio::test]
    async fn nothing_to_do_without_legacy_keys() {
        let h = harness().await;
        assert!(!h.engine.is_migration_needed("u1").await.unwrap());
        assert!(h.engine.run_at_session_start("u1").await.unwrap().is_none());
    }
}
