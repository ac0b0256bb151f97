use std::collections::BTreeMap;

use crate::db::AlertKind;

/// Per-kind suppression window for violation alerts.
///
/// A violation arriving within `window_ms` of the last admitted violation of
/// the same kind is dropped. Kinds do not affect each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownFilter {
    window_ms: i64,
    last_admitted: BTreeMap<AlertKind, i64>,
}

impl CooldownFilter {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms: window_ms.max(0),
            last_admitted: BTreeMap::new(),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Next filter state if `kind` is admitted at `now_ms`, `None` if suppressed.
    pub fn admit(&self, kind: AlertKind, now_ms: i64) -> Option<CooldownFilter> {
        if let Some(&last) = self.last_admitted.get(&kind) {
            if now_ms.saturating_sub(last) < self.window_ms {
                return None;
            }
        }

        let mut next = self.clone();
        next.last_admitted.insert(kind, now_ms);
        Some(next)
    }
}
