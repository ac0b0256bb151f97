//! Per-video progress record and the patch type used to update it.
//!
//! Field names serialise in camelCase because the same JSON shape is written
//! to `users/{uid}/videos/{courseId}_{videoId}` in the remote store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ViolationCounts {
    pub tab_switches: u32,
    pub face_missing_events: u32,
    pub auto_pauses: u32,
    pub skip_count: u32,
}

impl ViolationCounts {
    /// Field-wise maximum; counters never go backwards.
    pub fn max(self, other: ViolationCounts) -> ViolationCounts {
        ViolationCounts {
            tab_switches: self.tab_switches.max(other.tab_switches),
            face_missing_events: self.face_missing_events.max(other.face_missing_events),
            auto_pauses: self.auto_pauses.max(other.auto_pauses),
            skip_count: self.skip_count.max(other.skip_count),
        }
    }

    pub fn get(&self, counter: ViolationCounter) -> u32 {
        match counter {
            ViolationCounter::TabSwitch => self.tab_switches,
            ViolationCounter::FaceMissing => self.face_missing_events,
            ViolationCounter::AutoPause => self.auto_pauses,
            ViolationCounter::Skip => self.skip_count,
        }
    }

    pub fn increment(&mut self, counter: ViolationCounter) {
        let slot = match counter {
            ViolationCounter::TabSwitch => &mut self.tab_switches,
            ViolationCounter::FaceMissing => &mut self.face_missing_events,
            ViolationCounter::AutoPause => &mut self.auto_pauses,
            ViolationCounter::Skip => &mut self.skip_count,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        u64::from(self.tab_switches)
            + u64::from(self.face_missing_events)
            + u64::from(self.auto_pauses)
            + u64::from(self.skip_count)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ViolationCounter {
    TabSwitch,
    FaceMissing,
    AutoPause,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoProgress {
    pub video_id: String,
    pub course_id: String,
    #[serde(default)]
    pub last_position: f64,
    #[serde(default)]
    pub total_duration: f64,
    #[serde(default)]
    pub valid_watch_time: f64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub violations: ViolationCounts,
    /// Epoch millis of the last acknowledged remote write; 0 when never synced.
    #[serde(default)]
    pub last_sync_time: i64,
    /// Epoch millis of the last local modification.
    #[serde(default)]
    pub updated_at: i64,
}

impl VideoProgress {
    pub fn new(course_id: &str, video_id: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            course_id: course_id.to_string(),
            last_position: 0.0,
            total_duration: 0.0,
            valid_watch_time: 0.0,
            completed: false,
            violations: ViolationCounts::default(),
            last_sync_time: 0,
            updated_at: 0,
        }
    }
}

/// Partial update from a playback tick. Absent fields leave the record alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoProgressPatch {
    pub last_position: Option<f64>,
    pub total_duration: Option<f64>,
    pub valid_watch_time: Option<f64>,
    pub violations: Option<ViolationCounts>,
}

impl VideoProgressPatch {
    pub fn playback(last_position: f64, total_duration: f64, valid_watch_time: f64) -> Self {
        Self {
            last_position: Some(last_position),
            total_duration: Some(total_duration),
            valid_watch_time: Some(valid_watch_time),
            violations: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VideoKey {
    pub user_id: String,
    pub course_id: String,
    pub video_id: String,
}

impl VideoKey {
    pub fn new(user_id: &str, course_id: &str, video_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            video_id: video_id.to_string(),
        }
    }
}

impl std::fmt::Display for VideoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}_{}", self.user_id, self.course_id, self.video_id)
    }
}

/// Where the learner should resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContinueLearning {
    pub course_id: String,
    pub video_id: String,
    pub last_position: f64,
}

/// Row as persisted locally, including sync bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredVideoProgress {
    pub user_id: String,
    pub record: VideoProgress,
    pub dirty: bool,
    pub revision: u64,
}
