use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{
    db::{CourseProgress, OverallProgress, VideoProgress},
    progress::{merge, DirtyRecord, ProgressStore},
    remote::{courses_path, overall_path, user_videos_path, video_path, SharedRemote},
    settings::SyncSettings,
};

use super::{
    analytics::VideoAnalytics,
    outbox::{Outbox, OutboxEntry},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Outcome of one video sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Dirty records still waiting out a retry delay.
    pub deferred: usize,
}

/// Reconciles dirty local records and aggregates with the remote store.
#[derive(Clone)]
pub struct SyncEngine {
    store: ProgressStore,
    remote: SharedRemote,
    outbox: Arc<Mutex<Outbox>>,
}

impl SyncEngine {
    pub fn new(store: ProgressStore, remote: SharedRemote, settings: &SyncSettings) -> Self {
        Self {
            store,
            remote,
            outbox: Arc::new(Mutex::new(Outbox::new(
                settings.retry_base_ms,
                settings.retry_max_ms,
            ))),
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn remote(&self) -> &SharedRemote {
        &self.remote
    }

    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.outbox.lock().await.entries()
    }

    /// Pushes every due dirty record. Failures stay dirty and are retried later.
    pub async fn sync_videos(&self) -> SyncReport {
        let dirty = self.store.dirty_records().await;
        let now_ms = self.store.clock().now_ms();

        let due: Vec<DirtyRecord> = {
            let mut outbox = self.outbox.lock().await;
            let live: BTreeSet<_> = dirty.iter().map(|record| record.key.clone()).collect();
            outbox.retain_keys(&live);
            for record in &dirty {
                outbox.enqueue(&record.key, now_ms);
            }
            dirty
                .into_iter()
                .filter(|record| outbox.is_due(&record.key, now_ms))
                .collect()
        };

        let mut report = SyncReport {
            deferred: self.outbox.lock().await.len().saturating_sub(due.len()),
            ..Default::default()
        };

        for record in due {
            report.attempted += 1;
            match self.push_record(&record).await {
                Ok(clean) => {
                    report.synced += 1;
                    let mut outbox = self.outbox.lock().await;
                    outbox.record_success(&record.key);
                    if !clean {
                        // changed during the write; goes out on the next tick
                        outbox.enqueue(&record.key, now_ms);
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    let delay = self.outbox.lock().await.record_failure(
                        &record.key,
                        &format!("{err:#}"),
                        self.store.clock().now_ms(),
                    );
                    log_warn!(
                        "sync of {} failed, retrying in {}ms: {err:#}",
                        record.key,
                        delay
                    );
                }
            }
        }

        if report.attempted > 0 {
            log_info!(
                "video sync: attempted={} synced={} failed={} deferred={}",
                report.attempted,
                report.synced,
                report.failed,
                report.deferred
            );
        }
        report
    }

    /// Read-merge-write of one record. Returns whether it ended up clean locally.
    async fn push_record(&self, dirty: &DirtyRecord) -> Result<bool> {
        let path = video_path(&dirty.key);
        let remote = self.remote.get(&path).await?;
        let remote = remote.and_then(|value| match serde_json::from_value::<VideoProgress>(value) {
            Ok(record) => Some(record),
            Err(err) => {
                log_warn!("ignoring malformed remote record at {path}: {err}");
                None
            }
        });

        let mut merged = merge::reconcile(&dirty.record, remote.as_ref(), self.store.policy());
        merged.last_sync_time = self.store.clock().now_ms().max(merged.last_sync_time);

        self.remote
            .set(&path, serde_json::to_value(&merged)?)
            .await?;

        self.store
            .apply_synced(&dirty.key, &merged, dirty.revision)
            .await
            .context("remote write succeeded but local update failed")
    }

    /// Writes course aggregates and the overall aggregate for `user_id`.
    ///
    /// A remote course with more completed videos than the local view keeps its
    /// counts, so a device with a stale cache never lowers `completedVideos`.
    pub async fn sync_aggregates(&self, user_id: &str) -> Result<OverallProgress> {
        let now_ms = self.store.clock().now_ms();
        let local = self.store.get_all_course_progress(user_id).await?;
        let mut remote = self.fetch_remote_courses(user_id).await?;

        let mut fields = Map::new();
        for course in local {
            let merged = match remote.get(&course.course_id) {
                Some(existing) => CourseProgress::from_counts(
                    &course.course_id,
                    course.total_videos.max(existing.total_videos),
                    course.completed_videos.max(existing.completed_videos),
                    now_ms,
                ),
                None => course,
            };
            fields.insert(merged.course_id.clone(), serde_json::to_value(&merged)?);
            remote.insert(merged.course_id.clone(), merged);
        }

        if !fields.is_empty() {
            self.remote.update(&courses_path(user_id), fields).await?;
        }

        let overall = OverallProgress::from_courses(remote.values(), now_ms);
        self.remote
            .set(&overall_path(user_id), serde_json::to_value(&overall)?)
            .await?;

        self.store.cache_aggregates(user_id).await?;
        log_debug!(
            "aggregates synced for {user_id}: overall={} courses={}",
            overall.overall_progress,
            overall.total_courses
        );
        Ok(overall)
    }

    pub async fn fetch_remote_courses(&self, user_id: &str) -> Result<BTreeMap<String, CourseProgress>> {
        let Some(Value::Object(children)) = self.remote.get(&courses_path(user_id)).await? else {
            return Ok(BTreeMap::new());
        };

        let mut courses = BTreeMap::new();
        for (course_id, value) in children {
            match serde_json::from_value::<CourseProgress>(value) {
                Ok(mut course) => {
                    course.course_id = course_id.clone();
                    courses.insert(course_id, course);
                }
                Err(err) => log_warn!("skipping malformed course aggregate {course_id}: {err}"),
            }
        }
        Ok(courses)
    }

    /// Rolls up the remote copy of the user's video records.
    pub async fn collect_analytics(&self, user_id: &str) -> Result<VideoAnalytics> {
        let records: Vec<VideoProgress> = match self.remote.get(&user_videos_path(user_id)).await? {
            Some(Value::Object(children)) => children
                .into_iter()
                .filter_map(|(id, value)| match serde_json::from_value(value) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        log_warn!("skipping malformed remote video {id}: {err}");
                        None
                    }
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(VideoAnalytics::from_records(
            &records,
            self.store.clock().now_ms(),
        ))
    }
}
