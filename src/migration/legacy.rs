use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::db::{Database, OldCourseProgress};

pub const LEGACY_KEY_PREFIX: &str = "course_progress_";

pub fn legacy_key(course_id: &str) -> String {
    format!("{LEGACY_KEY_PREFIX}{course_id}")
}

/// Browser-style string key/value storage, backed by the `local_storage` table.
#[derive(Clone)]
pub struct LocalStorage {
    db: Database,
}

impl LocalStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.kv_get(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.kv_set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.db.kv_remove(key).await
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.db.kv_keys_with_prefix(prefix).await
    }

    /// Course ids that still have a legacy progress entry.
    pub async fn legacy_course_ids(&self) -> Result<Vec<String>> {
        let keys = self.keys_with_prefix(LEGACY_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(LEGACY_KEY_PREFIX)
                    .filter(|course_id| !course_id.is_empty())
                    .map(str::to_string)
            })
            .collect())
    }
}

/// `completedVideos` was written either as a count or as the list of watched ids.
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyCount {
    Number(f64),
    List(Vec<Value>),
}

impl LegacyCount {
    fn count(&self) -> f64 {
        match self {
            LegacyCount::Number(value) => *value,
            LegacyCount::List(items) => items.len() as f64,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLegacyCourse {
    #[serde(default)]
    completed_videos: Option<LegacyCount>,
    total_videos: Option<f64>,
    #[serde(default)]
    progress: Option<f64>,
}

fn to_count(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.floor().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

/// Parses one legacy record, clamping counts into range.
///
/// `progress` is recomputed from the counts when `totalVideos > 0`, so a stale
/// stored percentage cannot disagree with them. A `totalVideos` above
/// `max_videos` marks the record as malformed.
pub fn parse_legacy_value(value: Value, max_videos: u32) -> Result<OldCourseProgress> {
    if !value.is_object() {
        bail!("legacy record is not an object");
    }
    let raw: RawLegacyCourse = serde_json::from_value(value).context("malformed legacy record")?;

    let Some(total) = raw.total_videos else {
        bail!("legacy record has no totalVideos");
    };
    if !total.is_finite() || total > f64::from(max_videos) {
        bail!("legacy record claims {total} videos, more than the {max_videos} allowed");
    }
    let total_videos = to_count(total);
    let completed_videos = raw
        .completed_videos
        .map_or(0, |count| to_count(count.count()))
        .min(total_videos);

    let progress = if total_videos > 0 {
        (f64::from(completed_videos) / f64::from(total_videos) * 100.0).round()
    } else {
        raw.progress
            .filter(|p| p.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 100.0)
    };

    Ok(OldCourseProgress {
        progress,
        completed_videos,
        total_videos,
    })
}

pub fn parse_legacy_record(raw: &str, max_videos: u32) -> Result<OldCourseProgress> {
    let value: Value = serde_json::from_str(raw).context("legacy record is not JSON")?;
    parse_legacy_value(value, max_videos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: u32 = 1_000;

    #[test]
    fn parses_numeric_counts() {
        let parsed =
            parse_legacy_record(r#"{"completedVideos": 3, "totalVideos": 10, "progress": 30}"#, MAX)
                .unwrap();
        assert_eq!(parsed.completed_videos, 3);
        assert_eq!(parsed.total_videos, 10);
        assert_eq!(parsed.progress, 30.0);
    }

    #[test]
    fn array_length_counts_as_completed() {
        let parsed = parse_legacy_value(json!({
            "completedVideos": ["video-1", "video-4"],
            "totalVideos": 5
        }), MAX)
        .unwrap();
        assert_eq!(parsed.completed_videos, 2);
        assert_eq!(parsed.progress, 40.0);
    }

    #[test]
    fn counts_are_clamped() {
        let parsed = parse_legacy_value(json!({
            "completedVideos": 12,
            "totalVideos": 10,
            "progress": 250
        }), MAX)
        .unwrap();
        assert_eq!(parsed.completed_videos, 10);
        assert_eq!(parsed.progress, 100.0);

        let negative = parse_legacy_value(json!({"completedVideos": -4, "totalVideos": 3}), MAX).unwrap();
        assert_eq!(negative.completed_videos, 0);
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert!(parse_legacy_record("not json", MAX).is_err());
        assert!(parse_legacy_record("[1,2]", MAX).is_err());
        assert!(parse_legacy_record(r#"{"completedVideos": 2}"#, MAX).is_err());
        assert!(parse_legacy_record(r#"{"completedVideos": "two", "totalVideos": 4}"#, MAX).is_err());
    }

    #[test]
    fn oversized_courses_are_rejected() {
        assert!(parse_legacy_value(json!({"completedVideos": 3, "totalVideos": 1e12}), MAX).is_err());
        assert!(parse_legacy_value(json!({"completedVideos": 0, "totalVideos": 1_001}), MAX).is_err());

        let at_limit = parse_legacy_value(json!({"completedVideos": 1_000, "totalVideos": 1_000}), MAX)
            .unwrap();
        assert_eq!(at_limit.total_videos, 1_000);
        assert_eq!(at_limit.progress, 100.0);
    }

    #[tokio::test]
    async fn discovers_course_ids_from_keys() {
        let storage = LocalStorage::new(Database::open_in_memory().unwrap());
        storage.set(&legacy_key("web-development"), "{}").await.unwrap();
        storage.set(&legacy_key("data_science"), "{}").await.unwrap();
        storage.set("course_progress_", "{}").await.unwrap();
        storage.set("theme", "dark").await.unwrap();

        let mut ids = storage.legacy_course_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["data_science".to_string(), "web-development".to_string()]);
    }
}
