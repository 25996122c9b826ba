//! The session actor
//!
//! All session state lives in one task that drains a single inbox: link
//! events, telemetry status changes, user commands, timer ticks and the
//! results of auth round-trips all arrive there and are handled strictly in
//! order. Async results carry the epoch they were started in; teardown bumps
//! the epoch so anything still in flight from an old session is ignored.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::hrv::{synthesize_interval, HrvMetrics, IntervalWindow};
use crate::identity::{
    AuthError, AuthProvider, CredentialStore, PairingStatus, PairingTicket, SessionCredential,
};
use crate::link::{DeviceDescriptor, DeviceLink, HeartRateReading, LinkError, LinkEvent};
use crate::telemetry::{
    EventKind, MetricsReport, TelemetryChannel, TelemetryEmitter, TelemetryMessage,
    TelemetryStatus,
};

use super::timer::{DelayedTask, RepeatingTask};
use super::{
    ConnectionState, SessionCommand, SessionConfig, SessionError, SessionNotice, SessionSnapshot,
    StreamMode,
};

/// Transition events held while nothing can be published.
const PENDING_EVENT_LIMIT: usize = 32;

/// Everything the actor reacts to.
enum Inbound {
    Link(LinkEvent),
    Telemetry(TelemetryStatus),
    Command(SessionCommand),
    ScanTimeout {
        epoch: u64,
    },
    PollTick {
        epoch: u64,
    },
    EmitTick {
        epoch: u64,
    },
    CredentialChecked {
        epoch: u64,
        credential: SessionCredential,
        result: Result<PairingStatus, AuthError>,
    },
    PairingStarted {
        epoch: u64,
        result: Result<PairingTicket, AuthError>,
    },
    PairingPolled {
        epoch: u64,
        device_token: String,
        result: Result<PairingStatus, AuthError>,
    },
}

/// Caller side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<Inbound>,
    snapshot: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    pub fn start_scan(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StartScan)
    }

    /// End the device session. The stored credential is kept.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect)
    }

    /// Erase the stored credential and end the device session.
    pub fn clear_credential(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ClearCredential)
    }

    /// Tear down and stop the orchestrator task.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown)
    }

    pub fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.inbox
            .send(Inbound::Command(command))
            .map_err(|_| SessionError::Stopped)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Wait until a snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SessionSnapshot, SessionError>
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| SessionError::Stopped)?;
        }
    }

    /// Resolve once the orchestrator task has exited.
    pub async fn stopped(&self) {
        let mut rx = self.snapshot.clone();
        while rx.changed().await.is_ok() {}
    }
}

pub struct SessionOrchestrator {
    config: SessionConfig,
    link: Arc<dyn DeviceLink>,
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn CredentialStore>,
    channel: Arc<dyn TelemetryChannel>,
    emitter: TelemetryEmitter,
    inbox: mpsc::UnboundedSender<Inbound>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notice_tx: broadcast::Sender<SessionNotice>,
    pumps: Vec<JoinHandle<()>>,

    state: ConnectionState,
    telemetry: TelemetryStatus,
    epoch: u64,
    session_id: Option<Uuid>,
    window: IntervalWindow,
    metrics: HrvMetrics,
    heart_rate: i32,
    /// Credential the current device session runs under.
    credential: Option<SessionCredential>,
    pairing: Option<PairingTicket>,
    poll_in_flight: bool,
    scan_timeout: Option<DelayedTask>,
    poll_timer: Option<RepeatingTask>,
    emit_timer: Option<RepeatingTask>,
    /// Set by an involuntary disconnect; the next power-on reconnects.
    resume_on_power: bool,
    /// Transition events that happened outside the emission gate, oldest
    /// first. Published when the next stream opens.
    pending: VecDeque<(EventKind, Value, DateTime<Utc>)>,
}

impl SessionOrchestrator {
    /// Start the orchestrator task and return its handle.
    pub fn spawn(
        config: SessionConfig,
        link: Arc<dyn DeviceLink>,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn CredentialStore>,
        channel: Arc<dyn TelemetryChannel>,
    ) -> SessionHandle {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());
        let (notice_tx, _) = broadcast::channel(64);

        // Subscribe before anything can happen on the link.
        let pumps = vec![
            spawn_link_pump(link.events(), inbox.clone()),
            spawn_status_pump(channel.status(), inbox.clone()),
        ];

        let orchestrator = Self {
            window: IntervalWindow::new(config.window_capacity),
            emitter: TelemetryEmitter::spawn(Arc::clone(&channel)),
            config,
            link,
            auth,
            store,
            channel,
            inbox: inbox.clone(),
            snapshot_tx,
            notice_tx: notice_tx.clone(),
            pumps,
            state: ConnectionState::Idle,
            telemetry: TelemetryStatus::Disconnected,
            epoch: 0,
            session_id: None,
            metrics: HrvMetrics::default(),
            heart_rate: 0,
            credential: None,
            pairing: None,
            poll_in_flight: false,
            scan_timeout: None,
            poll_timer: None,
            emit_timer: None,
            resume_on_power: false,
            pending: VecDeque::new(),
        };
        tokio::spawn(orchestrator.run(rx));

        SessionHandle {
            inbox,
            snapshot,
            notices: notice_tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        self.publish_snapshot();
        while let Some(message) = rx.recv().await {
            match message {
                Inbound::Command(SessionCommand::Shutdown) => {
                    self.end_session().await;
                    break;
                }
                other => self.handle(other).await,
            }
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        log::info!("Session orchestrator stopped");
    }

    async fn handle(&mut self, message: Inbound) {
        match message {
            Inbound::Link(event) => self.on_link_event(event).await,
            Inbound::Telemetry(status) => {
                // Late updates from a closed session.
                if self.credential.is_none() && status != TelemetryStatus::Disconnected {
                    return;
                }
                if self.telemetry != status {
                    log::debug!("Telemetry channel {:?}", status);
                    self.telemetry = status;
                    self.publish_pending();
                    self.publish_snapshot();
                }
            }
            Inbound::Command(SessionCommand::StartScan) => self.start_scan().await,
            Inbound::Command(SessionCommand::Disconnect) => {
                self.resume_on_power = false;
                self.end_session().await;
            }
            Inbound::Command(SessionCommand::ClearCredential) => {
                if let Err(e) = self.store.clear() {
                    log::error!("Failed to clear stored credential: {}", e);
                }
                self.resume_on_power = false;
                self.end_session().await;
            }
            Inbound::Command(SessionCommand::Shutdown) => {}
            Inbound::ScanTimeout { epoch } => self.on_scan_timeout(epoch).await,
            Inbound::PollTick { epoch } => self.on_poll_tick(epoch),
            Inbound::EmitTick { epoch } => self.on_emit_tick(epoch),
            Inbound::CredentialChecked {
                epoch,
                credential,
                result,
            } => self.on_credential_checked(epoch, credential, result).await,
            Inbound::PairingStarted { epoch, result } => self.on_pairing_started(epoch, result),
            Inbound::PairingPolled {
                epoch,
                device_token,
                result,
            } => self.on_pairing_polled(epoch, device_token, result).await,
        }
    }

    // Scanning

    async fn start_scan(&mut self) {
        if self.state != ConnectionState::Idle {
            log::debug!("Ignoring scan request while {}", self.state.name());
            return;
        }
        self.resume_on_power = false;

        let permitted = match self.link.has_permission().await {
            Ok(true) => true,
            Ok(false) => self.link.request_permission().await.unwrap_or(false),
            Err(e) => {
                log::warn!("Permission check failed: {}", e);
                false
            }
        };
        if !permitted {
            log::warn!("Scan blocked: radio permission not granted");
            self.notify(SessionNotice::PermissionDenied);
            return;
        }

        if !self.link.is_powered().await.unwrap_or(false) {
            log::warn!("Scan blocked: radio is powered off");
            self.notify(SessionNotice::RadioPoweredOff);
            return;
        }

        if let Err(e) = self.link.start_scan().await {
            log::warn!("Failed to start scan: {}", e);
            match e {
                LinkError::PermissionDenied => self.notify(SessionNotice::PermissionDenied),
                LinkError::PoweredOff => self.notify(SessionNotice::RadioPoweredOff),
                _ => {}
            }
            return;
        }

        log::info!("Scanning for sensors");
        self.state = ConnectionState::Scanning;
        self.scan_timeout = Some(DelayedTask::after(
            self.config.scan_timeout,
            self.inbox.clone(),
            Inbound::ScanTimeout { epoch: self.epoch },
        ));
        self.publish_event(EventKind::ScanStarted, Value::Null);
        self.publish_snapshot();
    }

    async fn on_scan_timeout(&mut self, epoch: u64) {
        if epoch != self.epoch || self.state != ConnectionState::Scanning {
            return;
        }
        log::warn!(
            "No sensor found within {:?}",
            self.config.scan_timeout
        );
        self.publish_event(EventKind::ScanTimeout, Value::Null);
        self.notify(SessionNotice::ConnectionDifficulty);
        self.teardown().await;
    }

    async fn on_device_found(&mut self, device: DeviceDescriptor) {
        if self.state != ConnectionState::Scanning {
            log::debug!("Ignoring advertisement from {} while {}", device.id, self.state.name());
            return;
        }
        log::info!("Found sensor {} ({})", device.name, device.id);

        self.scan_timeout = None;
        if let Err(e) = self.link.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }
        self.publish_event(EventKind::ScanStopped, Value::Null);
        self.publish_event(
            EventKind::DeviceFound,
            json!({ "deviceId": device.id, "deviceName": device.name, "rssi": device.rssi }),
        );

        match self.link.connect(&device.id).await {
            Ok(()) => {
                self.state = ConnectionState::Connecting { device };
                self.publish_snapshot();
            }
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", device.id, e);
                self.teardown().await;
            }
        }
    }

    // Link events

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PowerStateChanged { powered } => self.on_power_changed(powered).await,
            LinkEvent::DeviceFound(device) => self.on_device_found(device).await,
            LinkEvent::DeviceConnected(device) => self.on_device_connected(device).await,
            LinkEvent::DeviceDisconnected(device) => self.on_device_disconnected(device).await,
            LinkEvent::HeartRate(reading) => self.on_heart_rate(reading),
            LinkEvent::IntervalBatch { device_id, samples } => {
                self.on_interval_batch(device_id, samples)
            }
            LinkEvent::IntervalStreamError { message } => {
                self.on_interval_stream_error(message).await
            }
        }
    }

    async fn on_power_changed(&mut self, powered: bool) {
        log::info!("Radio powered {}", if powered { "on" } else { "off" });
        self.publish_event(EventKind::RadioStateChanged, json!({ "powered": powered }));

        if !powered {
            if self.state == ConnectionState::Scanning {
                self.notify(SessionNotice::RadioPoweredOff);
                self.teardown().await;
            }
            return;
        }

        if self.state != ConnectionState::Idle || !self.resume_on_power {
            return;
        }
        self.resume_on_power = false;

        let credential = match self.store.get() {
            Ok(credential) => credential,
            Err(e) => {
                log::warn!("Failed to read stored credential: {}", e);
                None
            }
        };
        let Some(device_id) = credential.as_ref().and_then(|c| c.bound_device_id.clone()) else {
            log::debug!("No bound sensor to reconnect to");
            return;
        };
        let name = credential
            .and_then(|c| c.bound_device_name)
            .unwrap_or_else(|| device_id.clone());

        log::info!("Reconnecting to {}", device_id);
        match self.link.connect(&device_id).await {
            Ok(()) => {
                self.state = ConnectionState::Connecting {
                    device: DeviceDescriptor::new(device_id, name, None),
                };
                self.publish_snapshot();
            }
            // Left for the next power-on or an explicit scan.
            Err(e) => log::warn!("Reconnect to {} failed: {}", device_id, e),
        }
    }

    async fn on_device_connected(&mut self, device: DeviceDescriptor) {
        match &self.state {
            ConnectionState::Connecting { device: expected } if expected.id == device.id => {}
            _ => {
                log::debug!("Ignoring connection of {} while {}", device.id, self.state.name());
                return;
            }
        }

        let session_id = Uuid::new_v4();
        log::info!(
            "Connected to {} ({}), session {}",
            device.name,
            device.id,
            session_id
        );
        self.session_id = Some(session_id);
        self.publish_event(
            EventKind::DeviceConnected,
            json!({
                "deviceId": device.id,
                "deviceName": device.name,
                "sessionId": session_id.to_string(),
            }),
        );

        match self
            .store
            .update_bound_device(Some(&device.id), Some(&device.name))
        {
            Ok(true) => {}
            Ok(false) => log::debug!("No stored credential to bind {} to", device.id),
            Err(e) => log::warn!("Failed to record bound sensor: {}", e),
        }

        self.state = ConnectionState::Authenticating { device };
        self.publish_snapshot();
        self.begin_authentication().await;
    }

    fn is_current_device(&self, device_id: &str) -> bool {
        self.state
            .device()
            .map(|current| current.id == device_id)
            .unwrap_or(false)
    }

    async fn on_device_disconnected(&mut self, device: DeviceDescriptor) {
        if !self.is_current_device(&device.id) {
            log::debug!("Ignoring disconnect of {} while {}", device.id, self.state.name());
            return;
        }

        log::warn!("Sensor {} disconnected", device.id);
        self.publish_event(
            EventKind::DeviceDisconnected,
            json!({ "deviceId": device.id, "deviceName": device.name }),
        );
        self.teardown().await;
        self.resume_on_power = true;
    }

    fn on_heart_rate(&mut self, reading: HeartRateReading) {
        if !self.state.is_connected() {
            return;
        }
        if !self.is_current_device(&reading.device_id) {
            log::debug!("Ignoring heart rate from {}", reading.device_id);
            return;
        }
        self.heart_rate = reading.bpm;
        self.publish_event(
            EventKind::HeartRate,
            json!({
                "deviceId": reading.device_id,
                "heartRate": reading.bpm,
                "contactDetected": reading.contact_detected,
                "contactSupported": reading.contact_supported,
            }),
        );

        if self.state.mode() == Some(StreamMode::Fallback) {
            if let Some(interval) = synthesize_interval(reading.bpm) {
                self.admit(interval);
            }
        }
        self.publish_snapshot();
    }

    fn on_interval_batch(&mut self, device_id: String, samples: Vec<f64>) {
        if self.state.mode() != Some(StreamMode::Direct) {
            log::debug!("Ignoring interval batch outside direct streaming");
            return;
        }
        if !self.is_current_device(&device_id) {
            log::debug!("Ignoring interval batch from {}", device_id);
            return;
        }
        self.publish_event(
            EventKind::IntervalBatch,
            json!({ "deviceId": device_id, "intervals": samples }),
        );
        for sample in samples {
            self.admit(sample);
        }
        self.publish_snapshot();
    }

    async fn on_interval_stream_error(&mut self, message: String) {
        let ConnectionState::Streaming {
            device,
            mode: StreamMode::Direct,
        } = &self.state
        else {
            log::debug!("Interval stream error while {}: {}", self.state.name(), message);
            return;
        };
        let device = device.clone();

        log::warn!(
            "Interval stream from {} failed ({}), falling back to heart rate",
            device.id,
            message
        );
        if let Err(e) = self.link.stop_interval_stream(&device.id).await {
            log::debug!("Stopping failed interval stream: {}", e);
        }
        self.publish_event(EventKind::IntervalStreamError, json!({ "message": message }));
        self.state = ConnectionState::Streaming {
            device,
            mode: StreamMode::Fallback,
        };
        self.publish_snapshot();
    }

    /// Filter one interval into the window; recompute when it is full.
    fn admit(&mut self, interval_ms: f64) {
        if !self.window.admit(interval_ms) {
            log::trace!("Rejected interval {}ms", interval_ms);
            return;
        }
        if self.window.is_full() {
            self.metrics = HrvMetrics::compute(&self.window, self.config.sample_rate_hz);
            let report = MetricsReport::new(self.heart_rate, &self.metrics, self.window.len());
            self.publish_report(EventKind::HeartRateComplete, report);
        }
    }

    // Authentication

    async fn begin_authentication(&mut self) {
        let stored = match self.store.get() {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("Failed to read stored credential: {}", e);
                None
            }
        };

        match stored {
            Some(credential) if credential.is_expired() => {
                log::info!("Stored credential expired, pairing again");
                self.discard_stored_credential();
                self.start_pairing();
            }
            Some(credential) => {
                log::info!("Validating stored credential");
                let auth = Arc::clone(&self.auth);
                let inbox = self.inbox.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = auth.poll_pairing(&credential.issued_device_token).await;
                    let _ = inbox.send(Inbound::CredentialChecked {
                        epoch,
                        credential,
                        result,
                    });
                });
            }
            None => self.start_pairing(),
        }
    }

    async fn on_credential_checked(
        &mut self,
        epoch: u64,
        credential: SessionCredential,
        result: Result<PairingStatus, AuthError>,
    ) {
        if !self.is_authenticating(epoch) {
            log::debug!("Discarding stale credential check");
            return;
        }
        match result {
            Ok(status) if status.authenticated => {
                log::info!("Reusing stored credential for subject {}", credential.subject_id);
                self.on_authenticated(credential).await;
            }
            Ok(_) => {
                log::info!("Stored credential rejected, pairing again");
                self.discard_stored_credential();
                self.start_pairing();
            }
            Err(e) => {
                log::warn!("Could not validate stored credential ({}), pairing again", e);
                self.discard_stored_credential();
                self.start_pairing();
            }
        }
    }

    fn discard_stored_credential(&self) {
        if let Err(e) = self.store.clear() {
            log::error!("Failed to clear stored credential: {}", e);
        }
    }

    fn start_pairing(&mut self) {
        let auth = Arc::clone(&self.auth);
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = auth.start_pairing().await;
            let _ = inbox.send(Inbound::PairingStarted { epoch, result });
        });
    }

    fn on_pairing_started(&mut self, epoch: u64, result: Result<PairingTicket, AuthError>) {
        if !self.is_authenticating(epoch) {
            log::debug!("Discarding stale pairing ticket");
            return;
        }
        let ticket = match result {
            Ok(ticket) => ticket,
            Err(e) => {
                log::error!("Failed to start pairing: {}", e);
                self.notify(SessionNotice::PairingFailed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        log::info!("Pairing code {} issued", ticket.code);
        self.notify(SessionNotice::PairingCode {
            code: ticket.code.clone(),
            expires_at: ticket.expires_at,
        });
        self.pairing = Some(ticket);
        self.poll_timer = Some(RepeatingTask::every(
            self.config.pairing_poll_interval,
            self.inbox.clone(),
            move || Inbound::PollTick { epoch },
        ));
        self.publish_snapshot();
    }

    fn on_poll_tick(&mut self, epoch: u64) {
        if !self.is_authenticating(epoch) || self.poll_in_flight {
            return;
        }
        let Some(ticket) = self.pairing.clone() else {
            return;
        };

        if Utc::now().timestamp() > ticket.expires_at {
            log::info!("Pairing code {} expired, requesting a new one", ticket.code);
            self.poll_timer = None;
            self.pairing = None;
            self.publish_snapshot();
            self.start_pairing();
            return;
        }

        self.poll_in_flight = true;
        let device_token = ticket.device_token;
        let auth = Arc::clone(&self.auth);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = auth.poll_pairing(&device_token).await;
            let _ = inbox.send(Inbound::PairingPolled {
                epoch,
                device_token,
                result,
            });
        });
    }

    async fn on_pairing_polled(
        &mut self,
        epoch: u64,
        device_token: String,
        result: Result<PairingStatus, AuthError>,
    ) {
        if !self.is_authenticating(epoch) {
            log::debug!("Discarding stale pairing poll");
            return;
        }
        self.poll_in_flight = false;
        let Some(ticket) = self.pairing.clone() else {
            return;
        };
        if ticket.device_token != device_token {
            return;
        }

        let status = match result {
            Ok(status) if status.authenticated => status,
            Ok(_) => {
                log::debug!("Pairing {} not confirmed yet", ticket.code);
                return;
            }
            Err(e) => {
                log::warn!("Pairing poll failed: {}", e);
                return;
            }
        };
        let subject_id = match status.subject_id() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Ignoring pairing confirmation: {}", e);
                return;
            }
        };

        self.poll_timer = None;
        self.pairing = None;

        let device = self.state.device().cloned();
        let credential = SessionCredential {
            session_token: status.session_token,
            subject_id,
            device_code: status.device_code,
            app_id: status.app_id,
            issued_device_token: ticket.device_token,
            expires_at_epoch_seconds: Utc::now().timestamp()
                + self.config.credential_ttl.as_secs() as i64,
            bound_device_id: device.as_ref().map(|d| d.id.clone()),
            bound_device_name: device.map(|d| d.name),
        };
        if let Err(e) = self.store.save(&credential) {
            log::error!("Failed to persist credential: {}", e);
        }
        log::info!("Paired with subject {}", subject_id);
        self.notify(SessionNotice::Authenticated { subject_id });
        self.on_authenticated(credential).await;
    }

    fn is_authenticating(&self, epoch: u64) -> bool {
        epoch == self.epoch && matches!(self.state, ConnectionState::Authenticating { .. })
    }

    // Streaming

    async fn on_authenticated(&mut self, credential: SessionCredential) {
        let ConnectionState::Authenticating { device } = &self.state else {
            return;
        };
        let device = device.clone();

        match self
            .channel
            .connect(
                &credential.session_token,
                credential.subject_id,
                &credential.device_code,
            )
            .await
        {
            Ok(()) => self.telemetry = TelemetryStatus::Connected,
            Err(e) => {
                log::warn!("Telemetry channel unavailable: {}", e);
                self.telemetry = TelemetryStatus::Disconnected;
            }
        }
        let subject_id = credential.subject_id;
        self.credential = Some(credential);

        let mode = match self.link.request_interval_capability(&device.id).await {
            Ok(()) => match self.link.start_interval_stream(&device.id).await {
                Ok(()) => StreamMode::Direct,
                Err(e) => {
                    log::info!("Interval stream did not start ({}), using heart rate", e);
                    StreamMode::Fallback
                }
            },
            Err(e) => {
                log::info!("No interval telemetry ({}), using heart rate", e);
                StreamMode::Fallback
            }
        };

        log::info!("Streaming from {} in {:?} mode", device.id, mode);
        self.state = ConnectionState::Streaming { device, mode };
        let epoch = self.epoch;
        self.emit_timer = Some(RepeatingTask::every(
            self.config.emit_interval,
            self.inbox.clone(),
            move || Inbound::EmitTick { epoch },
        ));

        self.publish_pending();
        self.publish_event(
            EventKind::AuthenticationCompleted,
            json!({ "subjectId": subject_id }),
        );
        self.publish_event(EventKind::StreamStarted, json!({ "mode": mode }));
        self.publish_snapshot();
    }

    fn on_emit_tick(&mut self, epoch: u64) {
        if epoch != self.epoch || !self.state.is_streaming() || self.heart_rate == 0 {
            return;
        }
        let report = MetricsReport::new(self.heart_rate, &self.metrics, self.window.len());
        self.publish_report(EventKind::BiometricData, report);
    }

    // Teardown

    /// User-initiated end of the current session, whatever stage it is in.
    async fn end_session(&mut self) {
        let device = self.state.device().cloned();
        if self.state != ConnectionState::Idle {
            self.teardown().await;
        }
        if let Some(device) = device {
            if let Err(e) = self.link.disconnect(&device.id).await {
                log::debug!("Disconnect of {}: {}", device.id, e);
            }
        }
    }

    /// Stop everything belonging to the current session and return to Idle.
    async fn teardown(&mut self) {
        match &self.state {
            ConnectionState::Scanning => {
                if let Err(e) = self.link.stop_scan().await {
                    log::debug!("Stopping scan: {}", e);
                }
            }
            ConnectionState::Streaming {
                device,
                mode: StreamMode::Direct,
            } => {
                if let Err(e) = self.link.stop_interval_stream(&device.id).await {
                    log::debug!("Stopping interval stream: {}", e);
                }
            }
            _ => {}
        }

        self.scan_timeout = None;
        self.poll_timer = None;
        self.emit_timer = None;

        if self.credential.is_some() || self.telemetry != TelemetryStatus::Disconnected {
            self.emitter.flush().await;
            self.channel.close().await;
        }
        self.telemetry = TelemetryStatus::Disconnected;

        if let Some(session_id) = self.session_id.take() {
            log::info!("Session {} ended", session_id);
        }
        self.window.clear();
        self.metrics = HrvMetrics::default();
        self.heart_rate = 0;
        self.credential = None;
        self.pairing = None;
        self.poll_in_flight = false;
        self.epoch += 1;
        self.state = ConnectionState::Idle;
        self.publish_snapshot();
    }

    // Outbound

    /// Device code to publish under, if streaming with the telemetry
    /// channel up.
    fn publishing_code(&self) -> Option<&str> {
        if !self.state.is_streaming() || self.telemetry != TelemetryStatus::Connected {
            return None;
        }
        self.credential.as_ref().map(|c| c.device_code.as_str())
    }

    /// Publish an event now, or hold a transition event until the gate
    /// opens. Samples outside the gate are dropped.
    fn publish_event(&mut self, event: EventKind, payload: Value) {
        if let Some(code) = self.publishing_code() {
            self.emitter.emit(TelemetryMessage::new(event, code, payload));
            return;
        }
        if event.is_sample() {
            log::trace!("Not publishing {}", event);
            return;
        }
        if self.pending.len() == PENDING_EVENT_LIMIT {
            if let Some((dropped, _, _)) = self.pending.pop_front() {
                log::debug!("Dropping held {} event", dropped);
            }
        }
        self.pending.push_back((event, payload, Utc::now()));
    }

    /// Publish held transition events, keeping their original timestamps.
    fn publish_pending(&mut self) {
        let Some(code) = self.publishing_code().map(str::to_owned) else {
            return;
        };
        if !self.pending.is_empty() {
            log::debug!("Publishing {} held events", self.pending.len());
        }
        for (event, payload, timestamp) in self.pending.drain(..) {
            let mut message = TelemetryMessage::new(event, &code, payload);
            message.timestamp = timestamp;
            self.emitter.emit(message);
        }
    }

    fn publish_report(&self, event: EventKind, report: MetricsReport) {
        let Some(code) = self.publishing_code() else {
            return;
        };
        self.emitter.emit(report.into_message(event, code));
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notice_tx.send(notice);
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: self.state.clone(),
            telemetry: self.telemetry,
            session_id: self.session_id,
            heart_rate: self.heart_rate,
            metrics: self.metrics,
            window_len: self.window.len(),
            pairing_code: self.pairing.as_ref().map(|t| t.code.clone()),
        });
    }
}

fn spawn_link_pump(
    mut events: broadcast::Receiver<LinkEvent>,
    inbox: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if inbox.send(Inbound::Link(event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Dropped {} link events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_status_pump(
    mut status: watch::Receiver<TelemetryStatus>,
    inbox: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if inbox.send(Inbound::Telemetry(current)).is_err() {
                break;
            }
        }
    })
}
