//! Sensor session orchestration
//!
//! One `SessionOrchestrator` owns the device session: it scans, connects,
//! authenticates, streams, and tears down, feeding the HRV window and the
//! telemetry emitter along the way. Callers drive it through a
//! `SessionHandle`.

pub mod orchestrator;
pub mod timer;

pub use orchestrator::{SessionHandle, SessionOrchestrator};
pub use timer::{DelayedTask, RepeatingTask};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::hrv::{HrvMetrics, DEFAULT_SAMPLE_RATE_HZ, DEFAULT_WINDOW_CAPACITY};
use crate::link::DeviceDescriptor;
use crate::telemetry::TelemetryStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session has stopped")]
    Stopped,
}

/// Tunables for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Intervals kept in the rolling HRV window.
    pub window_capacity: usize,
    /// Resampling rate for the spectral estimate.
    pub sample_rate_hz: f64,
    #[serde(rename = "scan_timeout_ms", with = "duration_ms")]
    pub scan_timeout: Duration,
    #[serde(rename = "pairing_poll_interval_ms", with = "duration_ms")]
    pub pairing_poll_interval: Duration,
    #[serde(rename = "emit_interval_ms", with = "duration_ms")]
    pub emit_interval: Duration,
    /// Validity horizon of a freshly paired credential.
    #[serde(rename = "credential_ttl_secs", with = "duration_secs")]
    pub credential_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            scan_timeout: Duration::from_secs(30),
            pairing_poll_interval: Duration::from_secs(5),
            emit_interval: Duration::from_secs(1),
            credential_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Where HRV input comes from while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Beat-interval telemetry from the sensor.
    Direct,
    /// Intervals synthesized from instantaneous heart rate.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting { device: DeviceDescriptor },
    Authenticating { device: DeviceDescriptor },
    Streaming { device: DeviceDescriptor, mode: StreamMode },
}

impl ConnectionState {
    /// The sensor this state refers to, if any.
    pub fn device(&self) -> Option<&DeviceDescriptor> {
        match self {
            ConnectionState::Idle | ConnectionState::Scanning => None,
            ConnectionState::Connecting { device }
            | ConnectionState::Authenticating { device }
            | ConnectionState::Streaming { device, .. } => Some(device),
        }
    }

    /// True once the link confirmed the connection.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating { .. } | ConnectionState::Streaming { .. }
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ConnectionState::Streaming { .. })
    }

    pub fn mode(&self) -> Option<StreamMode> {
        match self {
            ConnectionState::Streaming { mode, .. } => Some(*mode),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Authenticating { .. } => "authenticating",
            ConnectionState::Streaming { .. } => "streaming",
        }
    }
}

/// Observable view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub telemetry: TelemetryStatus,
    pub session_id: Option<Uuid>,
    pub heart_rate: i32,
    pub metrics: HrvMetrics,
    pub window_len: usize,
    /// Code awaiting out-of-band confirmation while pairing.
    pub pairing_code: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            telemetry: TelemetryStatus::Disconnected,
            session_id: None,
            heart_rate: 0,
            metrics: HrvMetrics::default(),
            window_len: 0,
            pairing_code: None,
        }
    }
}

/// Conditions surfaced to the human operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SessionNotice {
    PermissionDenied,
    RadioPoweredOff,
    /// The scan timed out without finding a sensor.
    ConnectionDifficulty,
    PairingCode { code: String, expires_at: i64 },
    PairingFailed { reason: String },
    Authenticated { subject_id: i64 },
}

/// User actions accepted by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    StartScan,
    Disconnect,
    ClearCredential,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.window_capacity, 30);
        assert_eq!(config.sample_rate_hz, 4.0);
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
        assert_eq!(config.pairing_poll_interval, Duration::from_secs(5));
        assert_eq!(config.emit_interval, Duration::from_secs(1));
        assert_eq!(config.credential_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_config_partial_json() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"scan_timeout_ms": 5000, "credential_ttl_secs": 60}"#)
                .unwrap();
        assert_eq!(config.scan_timeout, Duration::from_secs(5));
        assert_eq!(config.credential_ttl, Duration::from_secs(60));
        assert_eq!(config.window_capacity, 30);

        let json = serde_json::to_value(&SessionConfig::default()).unwrap();
        assert_eq!(json["emit_interval_ms"], 1000);
        assert_eq!(json["credential_ttl_secs"], 86_400);
    }

    #[test]
    fn test_state_accessors() {
        let device = DeviceDescriptor::new("B5C7A312", "Polar H10 B5C7A312", Some(-60));
        let streaming = ConnectionState::Streaming {
            device: device.clone(),
            mode: StreamMode::Fallback,
        };
        assert_eq!(streaming.device(), Some(&device));
        assert!(streaming.is_connected());
        assert_eq!(streaming.mode(), Some(StreamMode::Fallback));

        let connecting = ConnectionState::Connecting { device };
        assert!(!connecting.is_connected());
        assert_eq!(connecting.name(), "connecting");
        assert_eq!(ConnectionState::Scanning.device(), None);
    }
}
