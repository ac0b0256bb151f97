use serde::Serialize;

use crate::db::{AlertKind, ViolationCounter};

use super::{
    cooldown::CooldownFilter,
    face::PresenceChange,
    visibility::{TabEvent, TabWarnings},
};

/// Raw signal from the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    VisibilityChanged { hidden: bool },
    CopyAttempted,
    PasteAttempted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineInput {
    Host(HostSignal),
    Presence(PresenceChange),
}

/// Event broadcast to proctoring subscribers (player UI, overlays).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProctorEvent {
    TabSwitchDetected { count: u32, max: u32 },
    MaxWarningsReached { count: u32, max: u32 },
    TabFocusRestored { count: u32 },
    FaceLost,
    FaceRestored,
    CopyAttempt,
    PasteAttempt,
    CapabilityFailed { message: String },
}

impl From<TabEvent> for ProctorEvent {
    fn from(event: TabEvent) -> Self {
        match event {
            TabEvent::TabSwitchDetected { count, max } => ProctorEvent::TabSwitchDetected { count, max },
            TabEvent::MaxWarningsReached { count, max } => ProctorEvent::MaxWarningsReached { count, max },
            TabEvent::TabFocusRestored { count } => ProctorEvent::TabFocusRestored { count },
        }
    }
}

impl ProctorEvent {
    /// Alert raised for this event, if it is a violation.
    fn violation(&self) -> Option<(AlertKind, String)> {
        match self {
            ProctorEvent::TabSwitchDetected { count, max } => Some((
                AlertKind::TabSwitchDetected,
                format!("Tab switch detected ({count}/{max})"),
            )),
            ProctorEvent::MaxWarningsReached { max, .. } => Some((
                AlertKind::MaxWarningsReached,
                format!("Maximum tab switch warnings reached ({max})"),
            )),
            ProctorEvent::FaceLost => Some((
                AlertKind::FaceNotDetected,
                "Face not detected in camera view".to_string(),
            )),
            ProctorEvent::CopyAttempt => {
                Some((AlertKind::CopyAttempt, "Copy attempt detected".to_string()))
            }
            ProctorEvent::PasteAttempt => {
                Some((AlertKind::PasteAttempt, "Paste attempt detected".to_string()))
            }
            ProctorEvent::TabFocusRestored { .. }
            | ProctorEvent::FaceRestored
            | ProctorEvent::CapabilityFailed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAlert {
    pub kind: AlertKind,
    pub message: String,
}

/// What one input produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub events: Vec<ProctorEvent>,
    /// Alerts that survived the cooldown.
    pub alerts: Vec<PendingAlert>,
    /// Progress counters to bump; independent of the cooldown.
    pub counters: Vec<ViolationCounter>,
}

/// Turns raw signals into events, cooled-down alerts and counter bumps.
#[derive(Debug, Clone)]
pub struct ViolationPipeline {
    tabs: TabWarnings,
    cooldown: CooldownFilter,
}

impl ViolationPipeline {
    pub fn new(max_tab_warnings: u32, cooldown_ms: i64) -> Self {
        Self {
            tabs: TabWarnings::new(max_tab_warnings),
            cooldown: CooldownFilter::new(cooldown_ms),
        }
    }

    pub fn tab_warnings(&self) -> &TabWarnings {
        &self.tabs
    }

    pub fn handle(&mut self, input: PipelineInput, now_ms: i64) -> PipelineOutput {
        let mut output = PipelineOutput::default();

        match input {
            PipelineInput::Host(HostSignal::VisibilityChanged { hidden: true }) => {
                let (next, events) = self.tabs.on_hidden();
                if next.count() > self.tabs.count() {
                    output.counters.push(ViolationCounter::TabSwitch);
                }
                self.tabs = next;
                output.events.extend(events.into_iter().map(ProctorEvent::from));
            }
            PipelineInput::Host(HostSignal::VisibilityChanged { hidden: false }) => {
                let (next, events) = self.tabs.on_visible();
                self.tabs = next;
                output.events.extend(events.into_iter().map(ProctorEvent::from));
            }
            PipelineInput::Host(HostSignal::CopyAttempted) => output.events.push(ProctorEvent::CopyAttempt),
            PipelineInput::Host(HostSignal::PasteAttempted) => output.events.push(ProctorEvent::PasteAttempt),
            PipelineInput::Presence(PresenceChange::Lost) => {
                output.events.push(ProctorEvent::FaceLost);
                output.counters.push(ViolationCounter::FaceMissing);
                output.counters.push(ViolationCounter::AutoPause);
            }
            PipelineInput::Presence(PresenceChange::Restored) => output.events.push(ProctorEvent::FaceRestored),
        }

        for event in &output.events {
            let Some((kind, message)) = event.violation() else {
                continue;
            };
            if let Some(next) = self.cooldown.admit(kind, now_ms) {
                self.cooldown = next;
                output.alerts.push(PendingAlert { kind, message });
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hide() -> PipelineInput {
        PipelineInput::Host(HostSignal::VisibilityChanged { hidden: true })
    }

    fn show() -> PipelineInput {
        PipelineInput::Host(HostSignal::VisibilityChanged { hidden: false })
    }

    fn alert_kinds(output: &PipelineOutput) -> Vec<AlertKind> {
        output.alerts.iter().map(|alert| alert.kind).collect()
    }

    #[test]
    fn tab_switches_two_seconds_apart_produce_one_alert() {
        let mut pipeline = ViolationPipeline::new(3, 10_000);
        let first = pipeline.handle(hide(), 0);
        pipeline.handle(show(), 1_000);
        let second = pipeline.handle(hide(), 2_000);

        assert_eq!(alert_kinds(&first), vec![AlertKind::TabSwitchDetected]);
        assert!(second.alerts.is_empty());
        // still counted and still broadcast
        assert_eq!(second.counters, vec![ViolationCounter::TabSwitch]);
        assert_eq!(second.events, vec![ProctorEvent::TabSwitchDetected { count: 2, max: 3 }]);
    }

    #[test]
    fn tab_switches_eleven_seconds_apart_produce_two_alerts() {
        let mut pipeline = ViolationPipeline::new(5, 10_000);
        let first = pipeline.handle(hide(), 0);
        pipeline.handle(show(), 1_000);
        let second = pipeline.handle(hide(), 11_000);
        assert_eq!(first.alerts.len(), 1);
        assert_eq!(second.alerts.len(), 1);
    }

    #[test]
    fn max_warning_alert_is_separate_kind() {
        let mut pipeline = ViolationPipeline::new(1, 10_000);
        let output = pipeline.handle(hide(), 0);
        assert_eq!(
            alert_kinds(&output),
            vec![AlertKind::TabSwitchDetected, AlertKind::MaxWarningsReached]
        );
    }

    #[test]
    fn face_loss_counts_and_alerts() {
        let mut pipeline = ViolationPipeline::new(3, 10_000);
        let lost = pipeline.handle(PipelineInput::Presence(PresenceChange::Lost), 0);
        assert_eq!(lost.events, vec![ProctorEvent::FaceLost]);
        assert_eq!(
            lost.counters,
            vec![ViolationCounter::FaceMissing, ViolationCounter::AutoPause]
        );
        assert_eq!(alert_kinds(&lost), vec![AlertKind::FaceNotDetected]);

        let restored = pipeline.handle(PipelineInput::Presence(PresenceChange::Restored), 500);
        assert_eq!(restored.events, vec![ProctorEvent::FaceRestored]);
        assert!(restored.alerts.is_empty());
        assert!(restored.counters.is_empty());
    }

    #[test]
    fn clipboard_kinds_cool_down_independently() {
        let mut pipeline = ViolationPipeline::new(3, 10_000);
        let copy = pipeline.handle(PipelineInput::Host(HostSignal::CopyAttempted), 0);
        let paste = pipeline.handle(PipelineInput::Host(HostSignal::PasteAttempted), 100);
        let copy_again = pipeline.handle(PipelineInput::Host(HostSignal::CopyAttempted), 200);

        assert_eq!(alert_kinds(&copy), vec![AlertKind::CopyAttempt]);
        assert_eq!(alert_kinds(&paste), vec![AlertKind::PasteAttempt]);
        assert!(copy_again.alerts.is_empty());
        assert_eq!(copy_again.events, vec![ProctorEvent::CopyAttempt]);
    }

    #[test]
    fn focus_restore_is_not_a_violation() {
        let mut pipeline = ViolationPipeline::new(3, 10_000);
        pipeline.handle(hide(), 0);
        let output = pipeline.handle(show(), 100);
        assert_eq!(output.events, vec![ProctorEvent::TabFocusRestored { count: 1 }]);
        assert!(output.alerts.is_empty());
        assert!(output.counters.is_empty());
    }
}
