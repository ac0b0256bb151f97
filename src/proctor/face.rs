use std::sync::Arc;

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::error::CapabilityError;

use super::{
    camera::{CameraLease, CameraSlot},
    capability::{PresenceCapability, PresenceSensor},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceChange {
    Lost,
    Restored,
}

/// Consecutive-miss debounce over raw presence polls.
///
/// `face_detected` only drops after `threshold` misses in a row; a single
/// positive poll restores it and clears the miss count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceDebounce {
    face_detected: bool,
    misses: u32,
    threshold: u32,
}

impl FaceDebounce {
    pub fn new(threshold: u32) -> Self {
        Self {
            face_detected: true,
            misses: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn face_detected(&self) -> bool {
        self.face_detected
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn observe(self, present: bool) -> (Self, Option<PresenceChange>) {
        if present {
            let change = (!self.face_detected).then_some(PresenceChange::Restored);
            let next = Self {
                face_detected: true,
                misses: 0,
                ..self
            };
            return (next, change);
        }

        let misses = self.misses.saturating_add(1);
        let lost = self.face_detected && misses >= self.threshold;
        let next = Self {
            face_detected: self.face_detected && !lost,
            misses,
            ..self
        };
        (next, lost.then_some(PresenceChange::Lost))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum MonitorStatus {
    Idle,
    Loading,
    Active,
    Error(String),
}

/// Polls a presence capability while active and reports debounced changes.
///
/// Owns the camera lease for as long as polling runs; `stop` (or dropping the
/// monitor) cancels the poller, which releases the sensor and the lease
/// before it exits.
pub struct FacePresenceMonitor {
    capability: Arc<dyn PresenceCapability>,
    slot: CameraSlot,
    poll_interval: Duration,
    miss_threshold: u32,
    status_tx: Arc<watch::Sender<MonitorStatus>>,
    face_tx: Arc<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl FacePresenceMonitor {
    pub fn new(
        capability: Arc<dyn PresenceCapability>,
        slot: CameraSlot,
        poll_interval: Duration,
        miss_threshold: u32,
    ) -> Self {
        let (status_tx, _) = watch::channel(MonitorStatus::Idle);
        let (face_tx, _) = watch::channel(true);
        Self {
            capability,
            slot,
            poll_interval,
            miss_threshold,
            status_tx: Arc::new(status_tx),
            face_tx: Arc::new(face_tx),
            handle: None,
            cancel_token: None,
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MonitorStatus> {
        self.status_tx.subscribe()
    }

    pub fn face_detected(&self) -> bool {
        *self.face_tx.borrow()
    }

    /// Acquires camera and model, then starts polling.
    ///
    /// Failure leaves the monitor in `Error` and is not retried.
    pub async fn start(&mut self, changes: mpsc::Sender<PresenceChange>) -> Result<(), CapabilityError> {
        if self.handle.is_some() {
            return Err(CapabilityError::Busy);
        }

        self.status_tx.send_replace(MonitorStatus::Loading);

        let lease = match self.slot.try_claim() {
            Ok(lease) => lease,
            Err(err) => return Err(self.fail(err)),
        };

        let sensor = match self.capability.acquire().await {
            Ok(sensor) => sensor,
            Err(err) => {
                drop(lease);
                return Err(self.fail(err));
            }
        };

        self.face_tx.send_replace(true);
        self.status_tx.send_replace(MonitorStatus::Active);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(presence_loop(
            sensor,
            lease,
            FaceDebounce::new(self.miss_threshold),
            self.poll_interval,
            changes,
            self.status_tx.clone(),
            self.face_tx.clone(),
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancels polling and waits until the camera has been released.
    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                log_error!("presence loop failed to join: {err}");
            }
        }
        if !matches!(self.status(), MonitorStatus::Error(_)) {
            self.status_tx.send_replace(MonitorStatus::Idle);
        }
    }

    fn fail(&self, err: CapabilityError) -> CapabilityError {
        log_error!("face presence unavailable: {err}");
        self.status_tx
            .send_replace(MonitorStatus::Error(err.to_string()));
        err
    }
}

impl Drop for FacePresenceMonitor {
    fn drop(&mut self) {
        // teardown without stop(): the poller still releases on its way out
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn presence_loop(
    mut sensor: Box<dyn PresenceSensor>,
    lease: CameraLease,
    mut debounce: FaceDebounce,
    poll_interval: Duration,
    changes: mpsc::Sender<PresenceChange>,
    status_tx: Arc<watch::Sender<MonitorStatus>>,
    face_tx: Arc<watch::Sender<bool>>,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let probe = tokio::select! {
            _ = cancel_token.cancelled() => break,
            probe = sensor.probe() => probe,
        };

        let present = match probe {
            Ok(present) => present,
            Err(err) => {
                log_error!("presence probe failed, stopping detector: {err}");
                status_tx.send_replace(MonitorStatus::Error(err.to_string()));
                break;
            }
        };

        let (next, change) = debounce.observe(present);
        debounce = next;
        log_debug!(
            "presence poll: present={present} misses={} detected={}",
            debounce.misses(),
            debounce.face_detected()
        );

        if let Some(change) = change {
            face_tx.send_replace(debounce.face_detected());
            if changes.send(change).await.is_err() {
                log_info!("presence listener gone, stopping detector");
                break;
            }
        }
    }

    sensor.release().await;
    drop(lease);
    log_info!("face presence polling stopped");
}
