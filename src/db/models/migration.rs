use serde::{Deserialize, Serialize};

/// Course progress in the legacy flat format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OldCourseProgress {
    #[serde(default)]
    pub progress: f64,
    pub completed_videos: u32,
    pub total_videos: u32,
}

/// Outcome of one migration run. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub migrated_courses: u32,
    pub total_videos: u32,
    pub completed_videos: u32,
    /// Epoch millis when the run finished.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationResult {
    pub fn failed(error: impl Into<String>, timestamp: i64) -> Self {
        Self {
            success: false,
            migrated_courses: 0,
            total_videos: 0,
            completed_videos: 0,
            timestamp,
            error: Some(error.into()),
        }
    }
}
