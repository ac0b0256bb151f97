use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabEvent {
    TabSwitchDetected { count: u32, max: u32 },
    MaxWarningsReached { count: u32, max: u32 },
    TabFocusRestored { count: u32 },
}

/// Tab-visibility warning counter for one detector instance.
///
/// The count only grows; `max_warnings_reached` is reported the first time
/// the count reaches `max` and never again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabWarnings {
    count: u32,
    max: u32,
    hidden: bool,
    max_reported: bool,
}

impl TabWarnings {
    pub fn new(max: u32) -> Self {
        Self {
            count: 0,
            max: max.max(1),
            hidden: false,
            max_reported: false,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Document became hidden. A repeated hidden signal is not a new switch.
    pub fn on_hidden(self) -> (Self, Vec<TabEvent>) {
        if self.hidden {
            return (self, Vec::new());
        }

        let count = self.count.saturating_add(1);
        let mut events = Vec::new();
        if count <= self.max {
            events.push(TabEvent::TabSwitchDetected {
                count,
                max: self.max,
            });
        }

        let crossing = count >= self.max && !self.max_reported;
        if crossing {
            events.push(TabEvent::MaxWarningsReached {
                count,
                max: self.max,
            });
        }

        let next = Self {
            count,
            hidden: true,
            max_reported: self.max_reported || crossing,
            ..self
        };
        (next, events)
    }

    pub fn on_visible(self) -> (Self, Vec<TabEvent>) {
        if !self.hidden {
            return (self, Vec::new());
        }

        let events = if self.count > 0 {
            vec![TabEvent::TabFocusRestored { count: self.count }]
        } else {
            Vec::new()
        };
        (
            Self {
                hidden: false,
                ..self
            },
            events,
        )
    }
}
