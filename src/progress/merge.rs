//! Field-level merge rules for `VideoProgress`.
//!
//! Counters and durations only move forward (monotonic max); the playback
//! position is last-write-wins; `completed` is derived from watch time and
//! never reverts.

use crate::db::{VideoProgress, VideoProgressPatch};
use crate::settings::ProgressPolicy;

fn finite_non_negative(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

fn watch_time_cap(duration: f64, policy: &ProgressPolicy) -> Option<f64> {
    (duration > 0.0).then(|| duration * policy.replay_tolerance)
}

pub fn reaches_completion(record: &VideoProgress, policy: &ProgressPolicy) -> bool {
    record.total_duration > 0.0
        && record.valid_watch_time >= record.total_duration * policy.completion_ratio
}

fn normalise(record: &mut VideoProgress, policy: &ProgressPolicy) {
    record.last_position = record.last_position.max(0.0);
    if record.total_duration > 0.0 {
        record.last_position = record.last_position.min(record.total_duration);
    }
    record.completed = record.completed || reaches_completion(record, policy);
}

/// Applies a local playback patch on top of the current record.
pub fn apply_patch(
    current: Option<&VideoProgress>,
    course_id: &str,
    video_id: &str,
    patch: &VideoProgressPatch,
    now_ms: i64,
    policy: &ProgressPolicy,
) -> VideoProgress {
    let mut next = current
        .cloned()
        .unwrap_or_else(|| VideoProgress::new(course_id, video_id));

    if let Some(duration) = patch.total_duration.and_then(finite_non_negative) {
        if duration > 0.0 {
            next.total_duration = duration;
        }
    }

    if let Some(position) = patch.last_position.and_then(finite_non_negative) {
        next.last_position = position;
    }

    if let Some(watched) = patch.valid_watch_time.and_then(finite_non_negative) {
        let watched = match watch_time_cap(next.total_duration, policy) {
            Some(cap) => watched.min(cap),
            None => watched,
        };
        next.valid_watch_time = next.valid_watch_time.max(watched);
    }

    if let Some(violations) = patch.violations {
        next.violations = next.violations.max(violations);
    }

    next.updated_at = now_ms.max(next.updated_at);
    normalise(&mut next, policy);
    next
}

/// Merges a dirty local record with its remote counterpart.
///
/// Position goes to whichever side is newer: the local edit time against the
/// remote copy's `lastSyncTime`. Ties keep the local value.
pub fn reconcile(
    local: &VideoProgress,
    remote: Option<&VideoProgress>,
    policy: &ProgressPolicy,
) -> VideoProgress {
    let Some(remote) = remote else {
        let mut merged = local.clone();
        normalise(&mut merged, policy);
        return merged;
    };

    let mut merged = local.clone();
    merged.total_duration = local.total_duration.max(remote.total_duration);
    merged.valid_watch_time = local.valid_watch_time.max(remote.valid_watch_time);
    merged.violations = local.violations.max(remote.violations);
    merged.completed = local.completed || remote.completed;
    if remote.last_sync_time > local.updated_at {
        merged.last_position = remote.last_position;
    }
    merged.updated_at = local.updated_at.max(remote.updated_at);
    merged.last_sync_time = local.last_sync_time.max(remote.last_sync_time);

    normalise(&mut merged, policy);
    merged
}

/// Folds an already-reconciled record back into the local copy.
///
/// `local_is_newer` is set when the local record changed while the remote
/// write was in flight; its position then wins and its counters are kept if larger.
pub fn absorb(
    local: Option<&VideoProgress>,
    incoming: &VideoProgress,
    local_is_newer: bool,
    policy: &ProgressPolicy,
) -> VideoProgress {
    let Some(local) = local else {
        let mut record = incoming.clone();
        normalise(&mut record, policy);
        return record;
    };

    let mut merged = incoming.clone();
    merged.total_duration = local.total_duration.max(incoming.total_duration);
    merged.valid_watch_time = local.valid_watch_time.max(incoming.valid_watch_time);
    merged.violations = local.violations.max(incoming.violations);
    merged.completed = local.completed || incoming.completed;
    if local_is_newer {
        merged.last_position = local.last_position;
    }
    merged.updated_at = local.updated_at.max(incoming.updated_at);
    merged.last_sync_time = local.last_sync_time.max(incoming.last_sync_time);

    normalise(&mut merged, policy);
    merged
}
