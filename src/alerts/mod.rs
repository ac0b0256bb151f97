//! Best-effort delivery of alerts to the remote `alerts` collection.
//!
//! `submit` never waits on the network: alerts go through a bounded inbox to a
//! single delivery task. A failed write is logged and the alert dropped.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::{
    db::Alert,
    error::RemoteError,
    remote::{SharedRemote, ALERTS_PATH},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

enum AlertCommand {
    Deliver(Alert),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct AlertSink {
    inbox: mpsc::Sender<AlertCommand>,
    remote: SharedRemote,
}

impl AlertSink {
    /// Spawns the delivery task. It exits once every clone of the sink is dropped.
    pub fn spawn(remote: SharedRemote, capacity: usize) -> Self {
        let (inbox, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(delivery_loop(remote.clone(), rx));
        Self { inbox, remote }
    }

    /// Queues an alert. Returns false when it was dropped.
    pub fn submit(&self, alert: Alert) -> bool {
        match self.inbox.try_send(AlertCommand::Deliver(alert)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(AlertCommand::Deliver(alert))) => {
                log_warn!(
                    "alert queue full, dropping {} for {}",
                    alert.kind,
                    alert.user_id
                );
                false
            }
            Err(_) => {
                log_warn!("alert worker stopped, dropping alert");
                false
            }
        }
    }

    /// Resolves once everything submitted earlier has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inbox.send(AlertCommand::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Most recent alerts for `user_id`, newest first.
    pub async fn recent_alerts(&self, user_id: &str, limit: usize) -> Result<Vec<Alert>, RemoteError> {
        let matches = self
            .remote
            .query_equal(ALERTS_PATH, "user_id", &Value::String(user_id.to_string()))
            .await?;

        let mut alerts: Vec<Alert> = matches
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value(value) {
                Ok(alert) => Some(alert),
                Err(err) => {
                    log_warn!("skipping malformed alert {id}: {err}");
                    None
                }
            })
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts.truncate(limit);
        Ok(alerts)
    }
}

async fn delivery_loop(remote: SharedRemote, mut rx: mpsc::Receiver<AlertCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            AlertCommand::Deliver(alert) => deliver(&remote, alert).await,
            AlertCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log_debug!("alert delivery loop finished");
}

async fn deliver(remote: &SharedRemote, alert: Alert) {
    let payload = match serde_json::to_value(&alert) {
        Ok(payload) => payload,
        Err(err) => {
            log_warn!("failed to encode {} alert: {err}", alert.kind);
            return;
        }
    };

    match remote.push(ALERTS_PATH, payload).await {
        Ok(id) => log_debug!("alert {} stored as {id}", alert.kind),
        Err(err) => log_warn!(
            "dropping {} alert for {}: {err}",
            alert.kind,
            alert.user_id
        ),
    }
}
