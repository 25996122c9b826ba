//! Session identity: credentials, pairing, and persistence
//!
//! A session credential is obtained by pairing: the auth provider issues a
//! short code that a human confirms out of band, and the device polls until
//! the provider reports the pairing as authenticated. The credential is a
//! singleton per installation, persisted through a `CredentialStore` and
//! re-validated with the provider before every reuse.

pub mod http;
pub mod simulated;
pub mod store;

pub use http::HttpAuthProvider;
pub use simulated::SimAuthProvider;
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// The persisted proof that this installation is paired with a subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    pub session_token: String,
    pub subject_id: i64,
    pub device_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Opaque token from the pairing flow; polling it re-validates the credential.
    pub issued_device_token: String,
    pub expires_at_epoch_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_device_name: Option<String>,
}

impl SessionCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_epoch_seconds <= now.timestamp()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// A started pairing: the code to show the human and the token to poll with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingTicket {
    pub code: String,
    pub device_token: String,
    pub expires_at: i64,
}

/// One poll answer from the auth provider.
///
/// Missing wire fields default to `false` / `""`; only `app_id` is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PairingStatus {
    pub authenticated: bool,
    pub subject_id: String,
    pub session_token: String,
    pub device_code: String,
    pub app_id: Option<String>,
}

impl PairingStatus {
    /// The numeric subject id carried as text on the wire.
    pub fn subject_id(&self) -> Result<i64, AuthError> {
        self.subject_id.trim().parse::<i64>().map_err(|_| {
            AuthError::MalformedResponse(format!("subject id {:?} is not numeric", self.subject_id))
        })
    }
}

/// Identity/authorization service that issues session credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Request a one-time pairing code and its device token.
    async fn start_pairing(&self) -> Result<PairingTicket, AuthError>;

    /// Ask whether the pairing behind `device_token` has been confirmed.
    async fn poll_pairing(&self, device_token: &str) -> Result<PairingStatus, AuthError>;
}
