use serde::Serialize;

use crate::db::{VideoProgress, ViolationCounts};

/// Dashboard roll-up of a user's remote video records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAnalytics {
    pub videos_tracked: u32,
    pub videos_completed: u32,
    pub total_valid_watch_time: f64,
    /// Mean of per-video watch ratios, capped at 100 each.
    pub average_completion_percent: f64,
    pub violations: ViolationCounts,
    pub generated_at: i64,
}

impl VideoAnalytics {
    pub fn from_records<'a, I>(records: I, generated_at: i64) -> Self
    where
        I: IntoIterator<Item = &'a VideoProgress>,
    {
        let mut analytics = VideoAnalytics {
            generated_at,
            ..Default::default()
        };
        let mut ratio_sum = 0.0;
        let mut with_duration = 0u32;

        for record in records {
            analytics.videos_tracked += 1;
            if record.completed {
                analytics.videos_completed += 1;
            }
            analytics.total_valid_watch_time += record.valid_watch_time;
            if record.total_duration > 0.0 {
                ratio_sum += (record.valid_watch_time / record.total_duration).min(1.0);
                with_duration += 1;
            }

            let v = &mut analytics.violations;
            v.tab_switches = v.tab_switches.saturating_add(record.violations.tab_switches);
            v.face_missing_events = v
                .face_missing_events
                .saturating_add(record.violations.face_missing_events);
            v.auto_pauses = v.auto_pauses.saturating_add(record.violations.auto_pauses);
            v.skip_count = v.skip_count.saturating_add(record.violations.skip_count);
        }

        if with_duration > 0 {
            let mean = ratio_sum / f64::from(with_duration) * 100.0;
            analytics.average_completion_percent = (mean * 10.0).round() / 10.0;
        }
        analytics
    }
}
