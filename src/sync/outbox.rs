use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use serde::Serialize;

use crate::db::VideoKey;

/// Pending remote write for one video record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEntry {
    pub key: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_ms: i64,
}

/// Queue of dirty records waiting for a confirmed remote write.
///
/// Entries are keyed by video; a failed write pushes the entry's next attempt
/// out exponentially (`base * 2^(attempts-1)`, capped) plus up to 10% jitter.
#[derive(Debug)]
pub struct Outbox {
    entries: BTreeMap<VideoKey, OutboxEntry>,
    base_ms: i64,
    max_ms: i64,
}

impl Outbox {
    pub fn new(base_ms: i64, max_ms: i64) -> Self {
        let base_ms = base_ms.max(1);
        Self {
            entries: BTreeMap::new(),
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    /// Tracks `key` if it is not queued already. Returns true when newly added.
    pub fn enqueue(&mut self, key: &VideoKey, now_ms: i64) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(
            key.clone(),
            OutboxEntry {
                key: key.to_string(),
                attempts: 0,
                last_error: None,
                next_attempt_ms: now_ms,
            },
        );
        true
    }

    pub fn is_due(&self, key: &VideoKey, now_ms: i64) -> bool {
        self.entries
            .get(key)
            .map_or(true, |entry| entry.next_attempt_ms <= now_ms)
    }

    /// Drops the entry after a confirmed write.
    pub fn record_success(&mut self, key: &VideoKey) {
        self.entries.remove(key);
    }

    /// Schedules the next attempt and returns the delay chosen.
    pub fn record_failure(&mut self, key: &VideoKey, error: &str, now_ms: i64) -> i64 {
        let entry = self.entries.entry(key.clone()).or_insert_with(|| OutboxEntry {
            key: key.to_string(),
            attempts: 0,
            last_error: None,
            next_attempt_ms: now_ms,
        });
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = Some(error.to_string());

        let delay = backoff_delay(entry.attempts, self.base_ms, self.max_ms);
        let jitter = rand::thread_rng().gen_range(0..=delay / 10);
        entry.next_attempt_ms = now_ms.saturating_add(delay + jitter);
        delay + jitter
    }

    /// Forgets entries whose records are no longer dirty (synced elsewhere or cleared).
    pub fn retain_keys(&mut self, live: &BTreeSet<VideoKey>) {
        self.entries.retain(|key, _| live.contains(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &VideoKey) -> Option<&OutboxEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.entries.values().cloned().collect()
    }
}

/// Exponential delay before jitter.
pub fn backoff_delay(attempts: u32, base_ms: i64, max_ms: i64) -> i64 {
    let exponent = attempts.saturating_sub(1).min(30);
    base_ms.saturating_mul(1i64 << exponent).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(video: &str) -> VideoKey {
        VideoKey::new("u1", "rust", video)
    }

    #[test]
    fn backoff_doubles_until_cap() {
        assert_eq!(backoff_delay(1, 5_000, 60_000), 5_000);
        assert_eq!(backoff_delay(2, 5_000, 60_000), 10_000);
        assert_eq!(backoff_delay(4, 5_000, 60_000), 40_000);
        assert_eq!(backoff_delay(5, 5_000, 60_000), 60_000);
        assert_eq!(backoff_delay(40, 5_000, 60_000), 60_000);
    }

    #[test]
    fn failure_defers_next_attempt() {
        let mut outbox = Outbox::new(5_000, 60_000);
        let k = key("video-1");
        assert!(outbox.enqueue(&k, 0));
        assert!(!outbox.enqueue(&k, 0));
        assert!(outbox.is_due(&k, 0));

        let delay = outbox.record_failure(&k, "offline", 0);
        assert!((5_000..=5_500).contains(&delay));
        assert!(!outbox.is_due(&k, 4_999));
        assert!(outbox.is_due(&k, 5_500));

        let entry = outbox.get(&k).unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("offline"));

        let delay = outbox.record_failure(&k, "offline", 6_000);
        assert!((10_000..=11_000).contains(&delay));
    }

    #[test]
    fn success_and_retain_drop_entries() {
        let mut outbox = Outbox::new(5_000, 60_000);
        outbox.enqueue(&key("video-1"), 0);
        outbox.enqueue(&key("video-2"), 0);
        outbox.record_success(&key("video-1"));
        assert_eq!(outbox.len(), 1);

        outbox.retain_keys(&BTreeSet::new());
        assert!(outbox.is_empty());
        // unknown keys are always due
        assert!(outbox.is_due(&key("video-9"), 0));
    }
}
