//! Fire-and-forget publishing
//!
//! The emitter owns a bounded queue drained by a publisher task, so the
//! session never waits on the transport. Failed publishes are logged and
//! dropped.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::hrv::HrvMetrics;

use super::{EventKind, TelemetryChannel, TelemetryMessage};

const QUEUE_DEPTH: usize = 256;

/// Heart rate plus HRV metrics rounded for display and interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub heart_rate: i32,
    pub hrv: i64,
    pub lf_power: i64,
    pub hf_power: i64,
    pub window_size: usize,
}

impl MetricsReport {
    pub fn new(heart_rate: i32, metrics: &HrvMetrics, window_size: usize) -> Self {
        Self {
            heart_rate,
            hrv: metrics.rmssd.round() as i64,
            lf_power: metrics.lf.round() as i64,
            hf_power: metrics.hf.round() as i64,
            window_size,
        }
    }

    /// Package as an event of the given kind.
    pub fn into_message(self, event: EventKind, device_code: &str) -> TelemetryMessage {
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        TelemetryMessage::new(event, device_code, payload)
    }
}

enum Outgoing {
    Publish(TelemetryMessage),
    Flush(oneshot::Sender<()>),
}

pub struct TelemetryEmitter {
    queue: mpsc::Sender<Outgoing>,
    publisher: JoinHandle<()>,
}

impl TelemetryEmitter {
    /// Start the publisher task for `channel`.
    pub fn spawn(channel: Arc<dyn TelemetryChannel>) -> Self {
        let (queue, mut rx) = mpsc::channel::<Outgoing>(QUEUE_DEPTH);
        let publisher = tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                match outgoing {
                    Outgoing::Publish(message) => {
                        if let Err(e) = channel.publish(&message).await {
                            log::warn!("Dropped {} message: {}", message.event, e);
                        }
                    }
                    Outgoing::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { queue, publisher }
    }

    /// Queue a message without waiting. Drops it when the queue is full.
    pub fn emit(&self, message: TelemetryMessage) {
        let event = message.event;
        if let Err(e) = self.queue.try_send(Outgoing::Publish(message)) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "publisher stopped",
            };
            log::warn!("Dropped {} message: {}", event, reason);
        }
    }

    /// Wait until everything queued so far has been handed to the channel.
    pub async fn flush(&self) {
        let (done, acked) = oneshot::channel();
        if self.queue.send(Outgoing::Flush(done)).await.is_ok() {
            let _ = acked.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.publisher.is_finished()
    }
}
