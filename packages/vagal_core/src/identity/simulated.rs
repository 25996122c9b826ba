//! Scriptable in-process auth provider
//!
//! Confirms a pairing after a fixed number of unauthenticated polls, and
//! keeps confirmed device tokens valid until revoked. Stands in for the
//! pairing service in tests and the simulated CLI session.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{AuthError, AuthProvider, PairingStatus, PairingTicket};

#[derive(Debug, Default)]
struct SimAuthState {
    starts: usize,
    polls: usize,
    /// Unauthenticated answers already given per pending token.
    pending: HashMap<String, usize>,
    approved: HashSet<String>,
    unavailable: bool,
}

pub struct SimAuthProvider {
    approve_after: usize,
    subject_id: i64,
    device_code: String,
    app_id: Option<String>,
    state: Mutex<SimAuthState>,
}

impl SimAuthProvider {
    /// Answer `authenticated: false` to the first `approve_after` polls of
    /// each pairing, then confirm it.
    pub fn new(approve_after: usize) -> Self {
        Self {
            approve_after,
            subject_id: 42,
            device_code: "SIM-DEVICE".to_string(),
            app_id: None,
            state: Mutex::new(SimAuthState::default()),
        }
    }

    pub fn with_subject(mut self, subject_id: i64, device_code: &str) -> Self {
        self.subject_id = subject_id;
        self.device_code = device_code.to_string();
        self
    }

    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_string());
        self
    }

    fn state(&self) -> MutexGuard<'_, SimAuthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Treat `device_token` as already confirmed.
    pub fn approve_token(&self, device_token: &str) {
        self.state().approved.insert(device_token.to_string());
    }

    /// Forget every confirmed token, invalidating stored credentials.
    pub fn revoke_all(&self) {
        self.state().approved.clear();
    }

    /// Make every call fail at the transport level.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn start_count(&self) -> usize {
        self.state().starts
    }

    pub fn poll_count(&self) -> usize {
        self.state().polls
    }

    fn confirmed(&self, device_token: &str) -> PairingStatus {
        PairingStatus {
            authenticated: true,
            subject_id: self.subject_id.to_string(),
            session_token: format!("session-{}", device_token),
            device_code: self.device_code.clone(),
            app_id: self.app_id.clone(),
        }
    }
}

#[async_trait]
impl AuthProvider for SimAuthProvider {
    async fn start_pairing(&self) -> Result<PairingTicket, AuthError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(AuthError::Transport("service unavailable".into()));
        }
        state.starts += 1;
        let device_token = format!("sim-device-token-{}", state.starts);
        state.pending.insert(device_token.clone(), 0);

        Ok(PairingTicket {
            code: format!("{:06}", 314_159 + state.starts),
            device_token,
            expires_at: (Utc::now() + Duration::minutes(10)).timestamp(),
        })
    }

    async fn poll_pairing(&self, device_token: &str) -> Result<PairingStatus, AuthError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(AuthError::Transport("service unavailable".into()));
        }
        state.polls += 1;

        if state.approved.contains(device_token) {
            return Ok(self.confirmed(device_token));
        }

        let approve = match state.pending.get_mut(device_token) {
            Some(answered) if *answered >= self.approve_after => true,
            Some(answered) => {
                *answered += 1;
                false
            }
            None => false,
        };

        if approve {
            state.pending.remove(device_token);
            state.approved.insert(device_token.to_string());
            Ok(self.confirmed(device_token))
        } else {
            Ok(PairingStatus::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_approves_after_configured_polls() {
        let auth = SimAuthProvider::new(2).with_subject(7, "K7Q2");
        let ticket = auth.start_pairing().await.unwrap();
        assert_eq!(ticket.code.len(), 6);

        assert!(!auth.poll_pairing(&ticket.device_token).await.unwrap().authenticated);
        assert!(!auth.poll_pairing(&ticket.device_token).await.unwrap().authenticated);
        let status = auth.poll_pairing(&ticket.device_token).await.unwrap();
        assert!(status.authenticated);
        assert_eq!(status.subject_id().unwrap(), 7);
        assert_eq!(status.device_code, "K7Q2");
        assert_eq!(auth.poll_count(), 3);

        // Confirmed tokens keep validating.
        assert!(auth.poll_pairing(&ticket.device_token).await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_unknown_and_revoked_tokens() {
        let auth = SimAuthProvider::new(0);
        assert!(!auth.poll_pairing("never-issued").await.unwrap().authenticated);

        auth.approve_token("stored");
        assert!(auth.poll_pairing("stored").await.unwrap().authenticated);
        auth.revoke_all();
        assert!(!auth.poll_pairing("stored").await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let auth = SimAuthProvider::new(0);
        auth.set_unavailable(true);
        assert!(matches!(
            auth.start_pairing().await,
            Err(AuthError::Transport(_))
        ));
        assert_eq!(auth.start_count(), 0);
    }
}
