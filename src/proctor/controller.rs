use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    alerts::AlertSink,
    db::Alert,
    progress::ProgressStore,
    settings::ProctorSettings,
    utils::SharedClock,
};

use super::{
    camera::CameraSlot,
    capability::PresenceCapability,
    face::{FacePresenceMonitor, MonitorStatus, PresenceChange},
    pipeline::{HostSignal, PipelineInput, ProctorEvent, ViolationPipeline},
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const SIGNAL_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 64;

/// The video the learner is watching while proctored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProctorContext {
    pub user_id: String,
    pub course_id: String,
    pub video_id: String,
}

struct Dispatcher {
    ctx: ProctorContext,
    store: ProgressStore,
    alerts: AlertSink,
    clock: SharedClock,
    events_tx: broadcast::Sender<ProctorEvent>,
}

/// Runs the violation detectors for one proctored session.
pub struct ProctorController {
    settings: ProctorSettings,
    store: ProgressStore,
    alerts: AlertSink,
    clock: SharedClock,
    capability: Option<Arc<dyn PresenceCapability>>,
    slot: CameraSlot,
    monitor: Option<FacePresenceMonitor>,
    signal_tx: Option<mpsc::Sender<HostSignal>>,
    events_tx: broadcast::Sender<ProctorEvent>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl ProctorController {
    pub fn new(
        settings: ProctorSettings,
        store: ProgressStore,
        alerts: AlertSink,
        clock: SharedClock,
        capability: Option<Arc<dyn PresenceCapability>>,
        slot: CameraSlot,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            settings,
            store,
            alerts,
            clock,
            capability,
            slot,
            monitor: None,
            signal_tx: None,
            events_tx,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProctorEvent> {
        self.events_tx.subscribe()
    }

    /// Face detector status; `Idle` when no presence capability is configured.
    pub fn face_status(&self) -> MonitorStatus {
        self.monitor
            .as_ref()
            .map_or(MonitorStatus::Idle, FacePresenceMonitor::status)
    }

    pub async fn start(&mut self, ctx: ProctorContext) -> Result<()> {
        if self.handle.is_some() {
            bail!("proctoring already active");
        }

        let (presence_tx, presence_rx) = mpsc::channel(SIGNAL_QUEUE);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);

        let dispatcher = Dispatcher {
            ctx,
            store: self.store.clone(),
            alerts: self.alerts.clone(),
            clock: self.clock.clone(),
            events_tx: self.events_tx.clone(),
        };

        let mut presence_rx = Some(presence_rx);
        if let Some(capability) = &self.capability {
            let mut monitor = FacePresenceMonitor::new(
                capability.clone(),
                self.slot.clone(),
                Duration::from_millis(self.settings.face_poll_interval_ms.max(1)),
                self.settings.face_miss_threshold,
            );
            if let Err(err) = monitor.start(presence_tx).await {
                // terminal for this session; tab and clipboard detection keep running
                log_error!("face detection disabled for {}: {err}", dispatcher.ctx.user_id);
                let _ = self.events_tx.send(ProctorEvent::CapabilityFailed {
                    message: err.to_string(),
                });
                presence_rx = None;
            }
            self.monitor = Some(monitor);
        } else {
            presence_rx = None;
        }

        let pipeline = ViolationPipeline::new(
            self.settings.max_tab_warnings,
            self.settings.violation_cooldown_ms,
        );
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            dispatcher,
            pipeline,
            signal_rx,
            presence_rx,
            cancel_token.clone(),
        ));

        self.signal_tx = Some(signal_tx);
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Feeds a host signal (visibility change, clipboard use) to the detectors.
    pub async fn signal(&self, signal: HostSignal) -> Result<()> {
        let tx = self
            .signal_tx
            .as_ref()
            .ok_or_else(|| anyhow!("proctoring is not active"))?;
        tx.send(signal)
            .await
            .map_err(|_| anyhow!("proctoring dispatcher stopped"))
    }

    /// Releases the camera first, then drains and stops the dispatcher.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop().await;
        }

        // closing the inbox lets the dispatcher finish queued signals
        self.signal_tx = None;
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle.await.context("proctor dispatcher failed to join")
        } else {
            Ok(())
        }
    }
}

async fn dispatch_loop(
    dispatcher: Dispatcher,
    mut pipeline: ViolationPipeline,
    mut signal_rx: mpsc::Receiver<HostSignal>,
    mut presence_rx: Option<mpsc::Receiver<PresenceChange>>,
    cancel_token: CancellationToken,
) {
    log_info!(
        "proctoring {} on {}/{}",
        dispatcher.ctx.user_id,
        dispatcher.ctx.course_id,
        dispatcher.ctx.video_id
    );

    loop {
        let input = tokio::select! {
            _ = cancel_token.cancelled() => break,
            signal = signal_rx.recv() => match signal {
                Some(signal) => PipelineInput::Host(signal),
                None => break,
            },
            change = recv_presence(&mut presence_rx) => match change {
                Some(change) => PipelineInput::Presence(change),
                None => {
                    presence_rx = None;
                    continue;
                }
            },
        };

        dispatcher.dispatch(&mut pipeline, input).await;
    }

    // signals queued before stop still count
    while let Ok(signal) = signal_rx.try_recv() {
        dispatcher
            .dispatch(&mut pipeline, PipelineInput::Host(signal))
            .await;
    }
    log_info!("proctor dispatcher stopped for {}", dispatcher.ctx.user_id);
}

async fn recv_presence(rx: &mut Option<mpsc::Receiver<PresenceChange>>) -> Option<PresenceChange> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    async fn dispatch(&self, pipeline: &mut ViolationPipeline, input: PipelineInput) {
        let now_ms = self.clock.now_ms();
        let output = pipeline.handle(input, now_ms);
        let ctx = &self.ctx;

        for counter in output.counters {
            if let Err(err) = self
                .store
                .record_violation(&ctx.user_id, &ctx.course_id, &ctx.video_id, counter)
                .await
            {
                log_warn!("failed to record {counter:?} for {}: {err:#}", ctx.user_id);
            }
        }

        for pending in output.alerts {
            self.alerts.submit(Alert::new(
                &ctx.user_id,
                pending.kind,
                pending.message,
                Some(&ctx.course_id),
                Some(&ctx.video_id),
                self.clock.now(),
            ));
        }

        for event in output.events {
            // no subscribers is fine
            let _ = self.events_tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{AlertKind, Database},
        error::CapabilityError,
        proctor::capability::ScriptedPresenceCapability,
        remote::MemoryRemoteStore,
        settings::ProgressPolicy,
        utils::ManualClock,
    };

    struct Harness {
        clock: Arc<ManualClock>,
        store: ProgressStore,
        alerts: AlertSink,
        slot: CameraSlot,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let store = ProgressStore::open(
            Database::open_in_memory().unwrap(),
            clock.clone(),
            ProgressPolicy::default(),
        )
        .await
        .unwrap();
        let alerts = AlertSink::spawn(Arc::new(MemoryRemoteStore::new()), 16);
        Harness {
            clock,
            store,
            alerts,
            slot: CameraSlot::new(),
        }
    }

    fn ctx() -> ProctorContext {
        ProctorContext {
            user_id: "u1".into(),
            course_id: "rust".into(),
            video_id: "video-1".into(),
        }
    }

    fn controller(h: &Harness, capability: Option<Arc<dyn PresenceCapability>>) -> ProctorController {
        ProctorController::new(
            ProctorSettings::default(),
            h.store.clone(),
            h.alerts.clone(),
            h.clock.clone(),
            capability,
            h.slot.clone(),
        )
    }

    #[tokio::test]
    async fn tab_switches_count_every_time_but_alert_once_per_window() {
        let h = harness().await;
        let mut proctor = controller(&h, None);
        let mut events = proctor.subscribe();
        proctor.start(ctx()).await.unwrap();

        proctor.signal(HostSignal::VisibilityChanged { hidden: true }).await.unwrap();
        proctor.signal(HostSignal::VisibilityChanged { hidden: false }).await.unwrap();
        h.clock.advance_ms(2_000);
        proctor.signal(HostSignal::VisibilityChanged { hidden: true }).await.unwrap();
        proctor.stop().await.unwrap();
        h.alerts.flush().await;

        let record = h.store.get_video_progress("u1", "rust", "video-1").await.unwrap();
        assert_eq!(record.violations.tab_switches, 2);

        let alerts = h.alerts.recent_alerts("u1", 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::TabSwitchDetected);
        assert_eq!(alerts[0].video_id.as_deref(), Some("video-1"));

        assert_eq!(
            events.recv().await.unwrap(),
            ProctorEvent::TabSwitchDetected { count: 1, max: 3 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ProctorEvent::TabFocusRestored { count: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn face_loss_pauses_and_alerts() {
        let h = harness().await;
        let capability = ScriptedPresenceCapability::new([false, false, false]);
        let mut proctor = controller(&h, Some(Arc::new(capability.clone())));
        let mut events = proctor.subscribe();
        proctor.start(ctx()).await.unwrap();
        assert_eq!(proctor.face_status(), MonitorStatus::Active);

        assert_eq!(events.recv().await.unwrap(), ProctorEvent::FaceLost);
        proctor.stop().await.unwrap();
        h.alerts.flush().await;

        assert!(!h.slot.is_held());
        assert_eq!(capability.releases(), 1);

        let record = h.store.get_video_progress("u1", "rust", "video-1").await.unwrap();
        assert_eq!(record.violations.face_missing_events, 1);
        assert_eq!(record.violations.auto_pauses, 1);

        let alerts = h.alerts.recent_alerts("u1", 10).await.unwrap();
        assert_eq!(alerts[0].kind, AlertKind::FaceNotDetected);
    }

    #[tokio::test]
    async fn denied_camera_keeps_tab_detection() {
        let h = harness().await;
        let capability =
            ScriptedPresenceCapability::failing(CapabilityError::PermissionDenied("denied".into()));
        let mut proctor = controller(&h, Some(Arc::new(capability)));
        let mut events = proctor.subscribe();
        proctor.start(ctx()).await.unwrap();

        assert!(matches!(proctor.face_status(), MonitorStatus::Error(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            ProctorEvent::CapabilityFailed { .. }
        ));

        proctor.signal(HostSignal::CopyAttempted).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ProctorEvent::CopyAttempt);
        proctor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_fails_and_signal_needs_start() {
        let h = harness().await;
        let mut proctor = controller(&h, None);
        assert!(proctor.signal(HostSignal::PasteAttempted).await.is_err());

        proctor.start(ctx()).await.unwrap();
        assert!(proctor.start(ctx()).await.is_err());
        proctor.stop().await.unwrap();
        assert!(!proctor.is_active());
    }
}
