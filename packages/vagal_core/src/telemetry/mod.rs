//! Outbound telemetry
//!
//! Metrics and session events leave the process through a publish/subscribe
//! `TelemetryChannel`. Messages carry an event type tag, the device code of
//! the active credential, and a timestamp, flattened together with the
//! event payload into one JSON object.

pub mod emitter;
pub mod loopback;

pub use emitter::{MetricsReport, TelemetryEmitter};
pub use loopback::LoopbackChannel;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("Telemetry channel not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Publish error: {0}")]
    PublishError(String),
}

/// Connection status of the outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Wire tags of published events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ScanStarted,
    ScanStopped,
    ScanTimeout,
    DeviceFound,
    DeviceConnected,
    DeviceDisconnected,
    RadioStateChanged,
    AuthenticationCompleted,
    StreamStarted,
    IntervalStreamError,
    HeartRate,
    IntervalBatch,
    /// Metrics from one full-window recomputation.
    HeartRateComplete,
    /// Periodic snapshot of the latest vitals.
    BiometricData,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ScanStarted => "scan_started",
            EventKind::ScanStopped => "scan_stopped",
            EventKind::ScanTimeout => "scan_timeout",
            EventKind::DeviceFound => "device_found",
            EventKind::DeviceConnected => "device_connected",
            EventKind::DeviceDisconnected => "device_disconnected",
            EventKind::RadioStateChanged => "radio_state_changed",
            EventKind::AuthenticationCompleted => "authentication_completed",
            EventKind::StreamStarted => "stream_started",
            EventKind::IntervalStreamError => "interval_stream_error",
            EventKind::HeartRate => "heart_rate",
            EventKind::IntervalBatch => "interval_batch",
            EventKind::HeartRateComplete => "heart_rate_complete",
            EventKind::BiometricData => "biometric_data",
        }
    }

    /// Per-sample traffic, as opposed to session transitions. Samples are
    /// only worth publishing live.
    pub fn is_sample(&self) -> bool {
        matches!(
            self,
            EventKind::HeartRate
                | EventKind::IntervalBatch
                | EventKind::HeartRateComplete
                | EventKind::BiometricData
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    #[serde(rename = "type")]
    pub event: EventKind,
    /// Device code of the credential the session runs under.
    pub code: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl TelemetryMessage {
    /// Package `payload` for publishing. Non-object payloads are wrapped as
    /// `{"value": payload}`.
    pub fn new(event: EventKind, device_code: &str, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            event,
            code: device_code.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Real-time publish/subscribe transport for telemetry.
#[async_trait]
pub trait TelemetryChannel: Send + Sync {
    /// Open the channel for `subject_id`, authorized by `session_token`.
    async fn connect(
        &self,
        session_token: &str,
        subject_id: i64,
        device_code: &str,
    ) -> Result<(), TelemetryError>;

    async fn publish(&self, message: &TelemetryMessage) -> Result<(), TelemetryError>;

    async fn close(&self);

    /// Watch connection status changes.
    fn status(&self) -> watch::Receiver<TelemetryStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_flattens_payload() {
        let message = TelemetryMessage::new(
            EventKind::DeviceFound,
            "K7Q2",
            json!({"deviceId": "B5C7A312", "rssi": -58}),
        );
        let value = message.to_json();
        assert_eq!(value["type"], "device_found");
        assert_eq!(value["code"], "K7Q2");
        assert_eq!(value["deviceId"], "B5C7A312");
        assert_eq!(value["rssi"], -58);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_scalar_payload_is_wrapped() {
        let message = TelemetryMessage::new(EventKind::HeartRate, "K7Q2", json!(72));
        assert_eq!(message.get("value"), Some(&json!(72)));

        let empty = TelemetryMessage::new(EventKind::ScanStarted, "K7Q2", Value::Null);
        assert!(empty.payload.is_empty());
    }

    #[test]
    fn test_event_kind_tags_match_serde() {
        for kind in [
            EventKind::ScanTimeout,
            EventKind::HeartRateComplete,
            EventKind::BiometricData,
            EventKind::IntervalStreamError,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn test_transitions_are_not_samples() {
        assert!(EventKind::HeartRate.is_sample());
        assert!(EventKind::BiometricData.is_sample());
        assert!(!EventKind::DeviceConnected.is_sample());
        assert!(!EventKind::ScanTimeout.is_sample());
        assert!(!EventKind::RadioStateChanged.is_sample());
    }
}
