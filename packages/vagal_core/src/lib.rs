// Vagal - Live heart-rate variability and sensor session orchestration

pub mod hrv;
pub mod identity;
pub mod link;
pub mod session;
pub mod telemetry;

pub use hrv::{HrvMetrics, IntervalWindow};
pub use identity::{AuthProvider, CredentialStore, SessionCredential};
pub use link::{DeviceDescriptor, DeviceLink, LinkEvent};
pub use session::{
    ConnectionState, SessionConfig, SessionHandle, SessionNotice, SessionOrchestrator,
    SessionSnapshot, StreamMode,
};
pub use telemetry::{EventKind, TelemetryChannel, TelemetryMessage, TelemetryStatus};
