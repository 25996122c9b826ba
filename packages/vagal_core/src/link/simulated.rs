//! In-process sensor simulator
//!
//! `SimDeviceLink` behaves like a radio driver with one or more advertising
//! sensors. Tests and the CLI flip its power/permission/capability switches
//! and inject heart-rate and interval data, which arrive on the same ordered
//! event stream a real driver would produce.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{DeviceDescriptor, DeviceLink, HeartRateReading, LinkError, LinkEvent};

/// Switches and bookkeeping behind the simulated radio.
#[derive(Debug)]
struct SimState {
    powered: bool,
    permission: bool,
    grant_on_request: bool,
    interval_capable: bool,
    fail_connect: bool,
    advertised: Vec<DeviceDescriptor>,
    scanning: bool,
    connected: Option<DeviceDescriptor>,
    streaming: bool,
    scan_starts: usize,
    connect_attempts: Vec<String>,
    capability_requests: usize,
}

/// A simulated radio driver. Cheap to share behind an `Arc`.
pub struct SimDeviceLink {
    event_tx: broadcast::Sender<LinkEvent>,
    state: Mutex<SimState>,
}

impl SimDeviceLink {
    /// A powered radio with permission granted, nothing advertising,
    /// and interval telemetry supported.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            event_tx,
            state: Mutex::new(SimState {
                powered: true,
                permission: true,
                grant_on_request: true,
                interval_capable: true,
                fail_connect: false,
                advertised: Vec::new(),
                scanning: false,
                connected: None,
                streaming: false,
                scan_starts: 0,
                connect_attempts: Vec::new(),
                capability_requests: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A poisoned lock only means a test panicked mid-update; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Make a sensor discoverable by subsequent scans.
    pub fn advertise(&self, device: DeviceDescriptor) {
        self.state().advertised.push(device);
    }

    /// Set the current permission and whether a request would grant it.
    pub fn set_permission(&self, granted: bool, grant_on_request: bool) {
        let mut state = self.state();
        state.permission = granted;
        state.grant_on_request = grant_on_request;
    }

    pub fn set_interval_capable(&self, capable: bool) {
        self.state().interval_capable = capable;
    }

    /// Make every subsequent `connect` fail.
    pub fn set_connect_failure(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Toggle radio power. Powering off drops any live connection first.
    pub fn set_powered(&self, powered: bool) {
        let dropped = {
            let mut state = self.state();
            state.powered = powered;
            if powered {
                None
            } else {
                state.scanning = false;
                state.streaming = false;
                state.connected.take()
            }
        };
        if let Some(device) = dropped {
            self.emit(LinkEvent::DeviceDisconnected(device));
        }
        self.emit(LinkEvent::PowerStateChanged { powered });
    }

    /// Simulate the sensor going out of range.
    pub fn drop_connection(&self) {
        let dropped = {
            let mut state = self.state();
            state.streaming = false;
            state.connected.take()
        };
        if let Some(device) = dropped {
            self.emit(LinkEvent::DeviceDisconnected(device));
        }
    }

    /// Deliver a heart-rate reading from the connected sensor.
    pub fn push_heart_rate(&self, bpm: i32) {
        let device_id = self.connected_id().unwrap_or_default();
        self.push_heart_rate_from(&device_id, bpm);
    }

    /// Deliver a heart-rate reading attributed to `device_id`, connected or
    /// not, as a second sensor in range would.
    pub fn push_heart_rate_from(&self, device_id: &str, bpm: i32) {
        self.emit(LinkEvent::HeartRate(HeartRateReading {
            device_id: device_id.to_string(),
            bpm,
            contact_detected: true,
            contact_supported: true,
        }));
    }

    /// Deliver an interval batch attributed to `device_id`, whatever is
    /// streaming.
    pub fn push_intervals_from(&self, device_id: &str, samples: Vec<f64>) {
        self.emit(LinkEvent::IntervalBatch {
            device_id: device_id.to_string(),
            samples,
        });
    }

    /// Deliver a batch of intervals, only while the interval stream runs.
    pub fn push_intervals(&self, samples: Vec<f64>) {
        let device_id = {
            let state = self.state();
            if !state.streaming {
                return;
            }
            state.connected.as_ref().map(|d| d.id.clone()).unwrap_or_default()
        };
        self.emit(LinkEvent::IntervalBatch { device_id, samples });
    }

    /// Break the interval stream mid-session.
    pub fn fail_interval_stream(&self, message: &str) {
        self.state().streaming = false;
        self.emit(LinkEvent::IntervalStreamError {
            message: message.to_string(),
        });
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    pub fn connected_id(&self) -> Option<String> {
        self.state().connected.as_ref().map(|d| d.id.clone())
    }

    pub fn scan_starts(&self) -> usize {
        self.state().scan_starts
    }

    /// Device ids passed to `connect`, in call order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.state().connect_attempts.clone()
    }

    pub fn capability_requests(&self) -> usize {
        self.state().capability_requests
    }
}

impl Default for SimDeviceLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLink for SimDeviceLink {
    async fn is_powered(&self) -> Result<bool, LinkError> {
        Ok(self.state().powered)
    }

    async fn has_permission(&self) -> Result<bool, LinkError> {
        Ok(self.state().permission)
    }

    async fn request_permission(&self) -> Result<bool, LinkError> {
        let mut state = self.state();
        if state.grant_on_request {
            state.permission = true;
        }
        Ok(state.permission)
    }

    async fn start_scan(&self) -> Result<(), LinkError> {
        let found = {
            let mut state = self.state();
            if !state.powered {
                return Err(LinkError::PoweredOff);
            }
            if !state.permission {
                return Err(LinkError::PermissionDenied);
            }
            state.scanning = true;
            state.scan_starts += 1;
            state.advertised.clone()
        };
        for device in found {
            self.emit(LinkEvent::DeviceFound(device));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.state().scanning = false;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        let device = {
            let mut state = self.state();
            state.connect_attempts.push(device_id.to_string());
            if !state.powered {
                return Err(LinkError::PoweredOff);
            }
            if state.fail_connect {
                return Err(LinkError::ConnectionError(format!(
                    "{} did not respond",
                    device_id
                )));
            }
            let device = state
                .advertised
                .iter()
                .find(|d| d.id == device_id)
                .cloned()
                .ok_or_else(|| {
                    LinkError::ConnectionError(format!("unknown device {}", device_id))
                })?;
            state.connected = Some(device.clone());
            device
        };
        self.emit(LinkEvent::DeviceConnected(device));
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), LinkError> {
        let dropped = {
            let mut state = self.state();
            match &state.connected {
                Some(d) if d.id == device_id => {
                    state.streaming = false;
                    state.connected.take()
                }
                _ => None,
            }
        };
        match dropped {
            Some(device) => {
                self.emit(LinkEvent::DeviceDisconnected(device));
                Ok(())
            }
            None => Err(LinkError::Disconnected),
        }
    }

    async fn request_interval_capability(&self, device_id: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        state.capability_requests += 1;
        match &state.connected {
            Some(d) if d.id == device_id => {}
            _ => return Err(LinkError::Disconnected),
        }
        if state.interval_capable {
            Ok(())
        } else {
            Err(LinkError::CapabilityUnavailable(format!(
                "{} has no interval telemetry",
                device_id
            )))
        }
    }

    async fn start_interval_stream(&self, device_id: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        match &state.connected {
            Some(d) if d.id == device_id => {
                state.streaming = true;
                Ok(())
            }
            _ => Err(LinkError::Disconnected),
        }
    }

    async fn stop_interval_stream(&self, _device_id: &str) -> Result<(), LinkError> {
        self.state().streaming = false;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }
}
