//! In-process telemetry channel
//!
//! Records every published message under the subject's private topic and
//! re-broadcasts it to local subscribers. Used by the simulator and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use super::{EventKind, TelemetryChannel, TelemetryError, TelemetryMessage, TelemetryStatus};

#[derive(Default)]
struct LoopbackState {
    topic: Option<String>,
    published: Vec<(String, TelemetryMessage)>,
    connects: usize,
    closes: usize,
    refuse_connect: bool,
    fail_publish: bool,
}

pub struct LoopbackChannel {
    status_tx: watch::Sender<TelemetryStatus>,
    feed: broadcast::Sender<TelemetryMessage>,
    state: Mutex<LoopbackState>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(TelemetryStatus::Disconnected);
        let (feed, _) = broadcast::channel(1024);
        Self {
            status_tx,
            feed,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Receive every message as it is published.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryMessage> {
        self.feed.subscribe()
    }

    pub fn published(&self) -> Vec<TelemetryMessage> {
        self.lock().published.iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn published_of(&self, event: EventKind) -> Vec<TelemetryMessage> {
        self.lock()
            .published
            .iter()
            .filter(|(_, m)| m.event == event)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Messages recorded under `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<TelemetryMessage> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn topic(&self) -> Option<String> {
        self.lock().topic.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn current_status(&self) -> TelemetryStatus {
        *self.status_tx.borrow()
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Drop the connection from the transport side.
    pub fn drop_link(&self) {
        self.lock().topic = None;
        self.status_tx.send_replace(TelemetryStatus::Disconnected);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryChannel for LoopbackChannel {
    async fn connect(
        &self,
        _session_token: &str,
        subject_id: i64,
        device_code: &str,
    ) -> Result<(), TelemetryError> {
        self.status_tx.send_replace(TelemetryStatus::Connecting);
        let refused = {
            let mut state = self.lock();
            state.connects += 1;
            if state.refuse_connect {
                true
            } else {
                state.topic = Some(format!("private:{}", subject_id));
                false
            }
        };
        if refused {
            self.status_tx.send_replace(TelemetryStatus::Disconnected);
            return Err(TelemetryError::ConnectionError(format!(
                "connection refused for {}",
                device_code
            )));
        }
        self.status_tx.send_replace(TelemetryStatus::Connected);
        Ok(())
    }

    async fn publish(&self, message: &TelemetryMessage) -> Result<(), TelemetryError> {
        if *self.status_tx.borrow() != TelemetryStatus::Connected {
            return Err(TelemetryError::NotConnected);
        }
        {
            let mut state = self.lock();
            if state.fail_publish {
                return Err(TelemetryError::PublishError("publish rejected".to_string()));
            }
            let topic = state.topic.clone().ok_or(TelemetryError::NotConnected)?;
            state.published.push((topic, message.clone()));
        }
        // No subscribers is fine.
        let _ = self.feed.send(message.clone());
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.lock();
            state.topic = None;
            state.closes += 1;
        }
        self.status_tx.send_replace(TelemetryStatus::Disconnected);
    }

    fn status(&self) -> watch::Receiver<TelemetryStatus> {
        self.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn message(event: EventKind) -> TelemetryMessage {
        TelemetryMessage::new(event, "K7Q2", Value::Null)
    }

    #[tokio::test]
    async fn test_connect_and_publish_on_private_topic() {
        let channel = LoopbackChannel::new();
        let mut status = channel.status();
        assert_eq!(*status.borrow(), TelemetryStatus::Disconnected);

        channel.connect("session-abc", 42, "K7Q2").await.unwrap();
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), TelemetryStatus::Connected);
        assert_eq!(channel.topic().as_deref(), Some("private:42"));

        let mut feed = channel.subscribe();
        channel.publish(&message(EventKind::StreamStarted)).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().event, EventKind::StreamStarted);
        assert_eq!(channel.published_on("private:42").len(), 1);
        assert!(channel.published_on("private:7").is_empty());
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let channel = LoopbackChannel::new();
        assert_eq!(
            channel.publish(&message(EventKind::HeartRate)).await,
            Err(TelemetryError::NotConnected)
        );

        channel.connect("session-abc", 42, "K7Q2").await.unwrap();
        channel.close().await;
        assert_eq!(channel.current_status(), TelemetryStatus::Disconnected);
        assert_eq!(
            channel.publish(&message(EventKind::HeartRate)).await,
            Err(TelemetryError::NotConnected)
        );
        assert_eq!(channel.close_count(), 1);
    }

    #[tokio::test]
    async fn test_refused_connect_and_publish_failure() {
        let channel = LoopbackChannel::new();
        channel.set_refuse_connect(true);
        assert!(matches!(
            channel.connect("session-abc", 42, "K7Q2").await,
            Err(TelemetryError::ConnectionError(_))
        ));
        assert_eq!(channel.current_status(), TelemetryStatus::Disconnected);

        channel.set_refuse_connect(false);
        channel.connect("session-abc", 42, "K7Q2").await.unwrap();
        channel.set_publish_failure(true);
        assert!(matches!(
            channel.publish(&message(EventKind::HeartRate)).await,
            Err(TelemetryError::PublishError(_))
        ));
        assert!(channel.published_of(EventKind::HeartRate).is_empty());
        assert_eq!(channel.connect_count(), 2);
    }
}
