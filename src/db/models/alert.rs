use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of academic-integrity alert. Cooldowns are keyed by this value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TabSwitchDetected,
    MaxWarningsReached,
    FaceNotDetected,
    CopyAttempt,
    PasteAttempt,
    ProgressMigrated,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::TabSwitchDetected => "tab_switch_detected",
            AlertKind::MaxWarningsReached => "max_warnings_reached",
            AlertKind::FaceNotDetected => "face_not_detected",
            AlertKind::CopyAttempt => "copy_attempt",
            AlertKind::PasteAttempt => "paste_attempt",
            AlertKind::ProgressMigrated => "progress_migrated",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only alert record, stored in the remote `alerts` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
}

impl Alert {
    pub fn new(
        user_id: &str,
        kind: AlertKind,
        message: impl Into<String>,
        course_id: Option<&str>,
        video_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind,
            message: message.into(),
            course_id: course_id.map(str::to_string),
            video_id: video_id.map(str::to_string),
            created_at,
            resolved: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serialises_with_remote_field_names() {
        let alert = Alert::new(
            "u1",
            AlertKind::TabSwitchDetected,
            "Tab switch detected (1/3)",
            Some("web-development"),
            Some("video-2"),
            Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        );

        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["type"], "tab_switch_detected");
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert_eq!(value["resolved"], false);

        let back: Alert = serde_json::from_value(value).unwrap();
        assert_eq!(back, alert);
    }
}
