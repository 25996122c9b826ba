//! Device link layer
//!
//! Abstracts the radio driver that discovers, connects to, and streams from
//! the wearable sensor. The orchestrator only sees the `DeviceLink` trait
//! and the ordered `LinkEvent` stream it produces; `simulated` provides an
//! in-process sensor for tests and demos.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Radio permission not granted")]
    PermissionDenied,

    #[error("Radio is powered off")]
    PoweredOff,

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Interval stream not available: {0}")]
    CapabilityUnavailable(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}

/// A discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub rssi: Option<i32>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rssi: Option<i32>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
        }
    }
}

/// One instantaneous heart-rate reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateReading {
    pub device_id: String,
    pub bpm: i32,
    pub contact_detected: bool,
    pub contact_supported: bool,
}

/// Events delivered by the link, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    PowerStateChanged { powered: bool },
    DeviceFound(DeviceDescriptor),
    DeviceConnected(DeviceDescriptor),
    DeviceDisconnected(DeviceDescriptor),
    HeartRate(HeartRateReading),
    /// A batch of beat-to-beat intervals in milliseconds.
    IntervalBatch { device_id: String, samples: Vec<f64> },
    IntervalStreamError { message: String },
}

/// Radio driver for the sensor.
///
/// `connect` and `disconnect` resolve once the driver accepted the request;
/// the confirmation itself arrives as `DeviceConnected` / `DeviceDisconnected`
/// on the event stream.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Whether the radio is currently powered on.
    async fn is_powered(&self) -> Result<bool, LinkError>;

    /// Whether the link-layer permission has been granted.
    async fn has_permission(&self) -> Result<bool, LinkError>;

    /// Ask the platform for link-layer permission. Returns the resulting grant.
    async fn request_permission(&self) -> Result<bool, LinkError>;

    async fn start_scan(&self) -> Result<(), LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    async fn connect(&self, device_id: &str) -> Result<(), LinkError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), LinkError>;

    /// Check that the device can deliver beat-interval telemetry.
    async fn request_interval_capability(&self, device_id: &str) -> Result<(), LinkError>;

    async fn start_interval_stream(&self, device_id: &str) -> Result<(), LinkError>;

    async fn stop_interval_stream(&self, device_id: &str) -> Result<(), LinkError>;

    /// Subscribe to link events.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;
}
