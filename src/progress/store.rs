use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::{
    db::{
        ContinueLearning, CourseProgress, Database, OverallProgress, VideoKey, VideoProgress,
        VideoProgressPatch, ViolationCounter,
    },
    settings::ProgressPolicy,
    utils::SharedClock,
};

use super::merge;

#[derive(Debug, Clone)]
struct TrackedVideo {
    record: VideoProgress,
    dirty: bool,
    revision: u64,
}

/// Local record awaiting a confirmed remote write.
#[derive(Debug, Clone)]
pub struct DirtyRecord {
    pub key: VideoKey,
    pub record: VideoProgress,
    pub revision: u64,
}

/// In-process cache of per-video progress, write-through to SQLite.
///
/// Every mutation happens under one async lock and is flushed to the database
/// before the call returns, so a record is never observed half-updated and
/// never acknowledged before it is durable.
#[derive(Clone)]
pub struct ProgressStore {
    db: Database,
    clock: SharedClock,
    policy: ProgressPolicy,
    cache: Arc<Mutex<HashMap<VideoKey, TrackedVideo>>>,
}

impl ProgressStore {
    /// Opens the store and hydrates the cache from the database.
    pub async fn open(db: Database, clock: SharedClock, policy: ProgressPolicy) -> Result<Self> {
        let rows = db
            .load_all_video_progress()
            .await
            .context("failed to load video progress")?;

        let cache = rows
            .into_iter()
            .map(|row| {
                let key = VideoKey::new(&row.user_id, &row.record.course_id, &row.record.video_id);
                let tracked = TrackedVideo {
                    record: row.record,
                    dirty: row.dirty,
                    revision: row.revision,
                };
                (key, tracked)
            })
            .collect();

        Ok(Self {
            db,
            clock,
            policy,
            cache: Arc::new(Mutex::new(cache)),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn policy(&self) -> &ProgressPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub async fn get_video_progress(
        &self,
        user_id: &str,
        course_id: &str,
        video_id: &str,
    ) -> Option<VideoProgress> {
        let key = VideoKey::new(user_id, course_id, video_id);
        self.cache
            .lock()
            .await
            .get(&key)
            .map(|tracked| tracked.record.clone())
    }

    /// Merges `patch` into the stored record and marks it dirty.
    pub async fn save_video_progress(
        &self,
        user_id: &str,
        course_id: &str,
        video_id: &str,
        patch: &VideoProgressPatch,
    ) -> Result<VideoProgress> {
        let key = VideoKey::new(user_id, course_id, video_id);
        let now_ms = self.clock.now_ms();

        let mut cache = self.cache.lock().await;
        let current = cache.get(&key);
        let next = merge::apply_patch(
            current.map(|tracked| &tracked.record),
            course_id,
            video_id,
            patch,
            now_ms,
            &self.policy,
        );
        let revision = current.map_or(0, |tracked| tracked.revision) + 1;

        self.db
            .upsert_video_progress(user_id, &next, true, revision)
            .await
            .with_context(|| format!("failed to persist progress for {key}"))?;

        cache.insert(
            key,
            TrackedVideo {
                record: next.clone(),
                dirty: true,
                revision,
            },
        );
        Ok(next)
    }

    /// Bumps one violation counter on the record, creating it if needed.
    pub async fn record_violation(
        &self,
        user_id: &str,
        course_id: &str,
        video_id: &str,
        counter: ViolationCounter,
    ) -> Result<VideoProgress> {
        let key = VideoKey::new(user_id, course_id, video_id);
        let now_ms = self.clock.now_ms();

        let mut cache = self.cache.lock().await;
        let current = cache.get(&key);
        let mut violations = current
            .map(|tracked| tracked.record.violations)
            .unwrap_or_default();
        violations.increment(counter);

        let patch = VideoProgressPatch {
            violations: Some(violations),
            ..Default::default()
        };
        let next = merge::apply_patch(
            current.map(|tracked| &tracked.record),
            course_id,
            video_id,
            &patch,
            now_ms,
            &self.policy,
        );
        let revision = current.map_or(0, |tracked| tracked.revision) + 1;

        self.db
            .upsert_video_progress(user_id, &next, true, revision)
            .await
            .with_context(|| format!("failed to persist violation for {key}"))?;

        cache.insert(
            key,
            TrackedVideo {
                record: next.clone(),
                dirty: true,
                revision,
            },
        );
        Ok(next)
    }

    pub async fn set_course_video_count(
        &self,
        user_id: &str,
        course_id: &str,
        total_videos: u32,
    ) -> Result<()> {
        self.db
            .set_course_video_count(user_id, course_id, total_videos)
            .await
    }

    /// Recomputed from the course's video records and the catalog size.
    pub async fn get_course_progress(&self, user_id: &str, course_id: &str) -> Result<CourseProgress> {
        let catalog = self.db.get_course_catalog(user_id).await?;
        let tallies = self.course_tallies(user_id).await;
        let (known, completed) = tallies.get(course_id).copied().unwrap_or((0, 0));
        let total = catalog.get(course_id).copied().unwrap_or(0).max(known);
        Ok(CourseProgress::from_counts(
            course_id,
            total,
            completed,
            self.clock.now_ms(),
        ))
    }

    /// Every course the user has records or catalog entries for, ordered by id.
    pub async fn get_all_course_progress(&self, user_id: &str) -> Result<Vec<CourseProgress>> {
        let catalog = self.db.get_course_catalog(user_id).await?;
        let tallies = self.course_tallies(user_id).await;
        let now_ms = self.clock.now_ms();

        let mut course_ids: Vec<&String> = catalog.keys().chain(tallies.keys()).collect();
        course_ids.sort();
        course_ids.dedup();

        Ok(course_ids
            .into_iter()
            .map(|course_id| {
                let (known, completed) = tallies.get(course_id).copied().unwrap_or((0, 0));
                let total = catalog.get(course_id).copied().unwrap_or(0).max(known);
                CourseProgress::from_counts(course_id, total, completed, now_ms)
            })
            .collect())
    }

    pub async fn get_overall_progress(&self, user_id: &str) -> Result<OverallProgress> {
        let courses = self.get_all_course_progress(user_id).await?;
        Ok(OverallProgress::from_courses(&courses, self.clock.now_ms()))
    }

    /// Most recently touched incomplete video.
    pub async fn get_continue_learning_data(&self, user_id: &str) -> Option<ContinueLearning> {
        let cache = self.cache.lock().await;
        cache
            .iter()
            .filter(|(key, tracked)| key.user_id == user_id && !tracked.record.completed)
            .max_by(|(a_key, a), (b_key, b)| {
                a.record
                    .updated_at
                    .cmp(&b.record.updated_at)
                    .then_with(|| b_key.cmp(a_key))
            })
            .map(|(_, tracked)| ContinueLearning {
                course_id: tracked.record.course_id.clone(),
                video_id: tracked.record.video_id.clone(),
                last_position: tracked.record.last_position,
            })
    }

    /// Destructive wipe of everything stored locally for `user_id`.
    pub async fn clear_all_progress(&self, user_id: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.db
            .delete_user_progress(user_id)
            .await
            .with_context(|| format!("failed to clear progress for {user_id}"))?;
        cache.retain(|key, _| key.user_id != user_id);
        Ok(())
    }

    pub async fn videos_for_user(&self, user_id: &str) -> Vec<VideoProgress> {
        let cache = self.cache.lock().await;
        let mut videos: Vec<VideoProgress> = cache
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(_, tracked)| tracked.record.clone())
            .collect();
        videos.sort_by(|a, b| {
            (a.course_id.as_str(), a.video_id.as_str()).cmp(&(b.course_id.as_str(), b.video_id.as_str()))
        });
        videos
    }

    pub async fn dirty_records(&self) -> Vec<DirtyRecord> {
        let cache = self.cache.lock().await;
        let mut dirty: Vec<DirtyRecord> = cache
            .iter()
            .filter(|(_, tracked)| tracked.dirty)
            .map(|(key, tracked)| DirtyRecord {
                key: key.clone(),
                record: tracked.record.clone(),
                revision: tracked.revision,
            })
            .collect();
        dirty.sort_by(|a, b| a.key.cmp(&b.key));
        dirty
    }

    pub async fn dirty_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .dirty_records()
            .await
            .into_iter()
            .map(|dirty| dirty.key.user_id)
            .collect();
        users.dedup();
        users
    }

    /// Stores the remote-acknowledged version of a record.
    ///
    /// The record is only marked clean when `revision` is still current;
    /// otherwise local edits made during the write are kept and stay dirty.
    /// Returns whether the record is now clean.
    pub async fn apply_synced(
        &self,
        key: &VideoKey,
        synced: &VideoProgress,
        revision: u64,
    ) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        let Some(current) = cache.get(key) else {
            // cleared while the write was in flight
            return Ok(false);
        };

        let unchanged = current.revision == revision;
        let next = merge::absorb(Some(&current.record), synced, !unchanged, &self.policy);
        let tracked = TrackedVideo {
            record: next,
            dirty: !unchanged,
            revision: current.revision,
        };

        self.db
            .upsert_video_progress(&key.user_id, &tracked.record, tracked.dirty, tracked.revision)
            .await
            .with_context(|| format!("failed to persist synced record {key}"))?;
        cache.insert(key.clone(), tracked);
        Ok(unchanged)
    }

    /// Folds a record that already lives remotely into the local store.
    pub async fn absorb(&self, user_id: &str, incoming: &VideoProgress) -> Result<VideoProgress> {
        let key = VideoKey::new(user_id, &incoming.course_id, &incoming.video_id);
        let mut cache = self.cache.lock().await;
        let current = cache.get(&key);

        let (next, dirty, revision) = match current {
            Some(tracked) if tracked.dirty => (
                merge::absorb(Some(&tracked.record), incoming, true, &self.policy),
                true,
                tracked.revision + 1,
            ),
            Some(tracked) => (
                merge::absorb(Some(&tracked.record), incoming, false, &self.policy),
                false,
                tracked.revision,
            ),
            None => (merge::absorb(None, incoming, false, &self.policy), false, 0),
        };

        self.db
            .upsert_video_progress(user_id, &next, dirty, revision)
            .await
            .with_context(|| format!("failed to absorb record {key}"))?;
        cache.insert(
            key,
            TrackedVideo {
                record: next.clone(),
                dirty,
                revision,
            },
        );
        Ok(next)
    }

    /// Persists the denormalised course and overall copies for fast reads.
    pub async fn cache_aggregates(
        &self,
        user_id: &str,
    ) -> Result<(Vec<CourseProgress>, OverallProgress)> {
        let courses = self.get_all_course_progress(user_id).await?;
        let overall = OverallProgress::from_courses(&courses, self.clock.now_ms());
        self.db
            .replace_progress_cache(user_id, &courses, &overall)
            .await
            .with_context(|| format!("failed to cache aggregates for {user_id}"))?;
        Ok((courses, overall))
    }

    pub async fn cached_course_progress(&self, user_id: &str) -> Result<Vec<CourseProgress>> {
        self.db.get_cached_course_progress(user_id).await
    }

    pub async fn cached_overall_progress(&self, user_id: &str) -> Result<Option<OverallProgress>> {
        self.db.get_cached_overall_progress(user_id).await
    }

    /// (known videos, completed videos) per course for one user.
    async fn course_tallies(&self, user_id: &str) -> BTreeMap<String, (u32, u32)> {
        let cache = self.cache.lock().await;
        let mut tallies: BTreeMap<String, (u32, u32)> = BTreeMap::new();
        for (key, tracked) in cache.iter().filter(|(key, _)| key.user_id == user_id) {
            let entry = tallies.entry(key.course_id.clone()).or_default();
            entry.0 += 1;
            if tracked.record.completed {
                entry.1 += 1;
            }
        }
        tallies
    }
}
