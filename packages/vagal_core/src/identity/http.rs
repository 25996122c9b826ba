//! HTTP client for the device pairing service
//!
//! Endpoints:
//! - `GET {base}/auth/device/start` → `{ code, deviceToken, expiresAt }`
//! - `GET {base}/auth/device/pool?deviceToken=…` →
//!   `{ authenticated, userId, session, deviceCode, appId? }`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{AuthError, AuthProvider, PairingStatus, PairingTicket};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    code: String,
    device_token: String,
    expires_at: i64,
}

/// `AuthProvider` backed by the pairing service's REST endpoints.
pub struct HttpAuthProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAuthProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn start_pairing(&self) -> Result<PairingTicket, AuthError> {
        let response = self
            .client
            .get(format!("{}/auth/device/start", self.base_url))
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            log::error!("start_pairing failed with status {}", response.status());
            return Err(AuthError::Status(response.status().as_u16()));
        }

        let body: StartBody = response
            .json()
            .await
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

        Ok(PairingTicket {
            code: body.code,
            device_token: body.device_token,
            expires_at: body.expires_at,
        })
    }

    async fn poll_pairing(&self, device_token: &str) -> Result<PairingStatus, AuthError> {
        let response = self
            .client
            .get(format!("{}/auth/device/pool", self.base_url))
            .query(&[("deviceToken", device_token)])
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        log::debug!("poll_pairing raw response ({}): {}", status, body);

        if !status.is_success() {
            return Err(AuthError::Status(status.as_u16()));
        }
        parse_poll_body(&body)
    }
}

/// Parse a poll body, defaulting absent fields to `false` / `""`.
///
/// `userId` is accepted either as a string or a number.
pub fn parse_poll_body(body: &str) -> Result<PairingStatus, AuthError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

    Ok(PairingStatus {
        authenticated: value
            .get("authenticated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        subject_id: value.get("userId").map(text_of).unwrap_or_default(),
        session_token: value.get("session").map(text_of).unwrap_or_default(),
        device_code: value.get("deviceCode").map(text_of).unwrap_or_default(),
        app_id: value
            .get("appId")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authenticated_body() {
        let status = parse_poll_body(
            r#"{"authenticated":true,"userId":"917","session":"s-abc","deviceCode":"K7Q2","appId":"coach"}"#,
        )
        .unwrap();

        assert!(status.authenticated);
        assert_eq!(status.subject_id().unwrap(), 917);
        assert_eq!(status.session_token, "s-abc");
        assert_eq!(status.device_code, "K7Q2");
        assert_eq!(status.app_id.as_deref(), Some("coach"));
    }

    #[test]
    fn test_parse_pending_body_defaults() {
        let status = parse_poll_body(r#"{"pending":true}"#).unwrap();
        assert_eq!(status, PairingStatus::default());
        assert!(status.app_id.is_none());
    }

    #[test]
    fn test_parse_numeric_user_id() {
        let status = parse_poll_body(r#"{"authenticated":true,"userId":917}"#).unwrap();
        assert_eq!(status.subject_id, "917");
    }

    #[test]
    fn test_parse_non_boolean_authenticated() {
        let status = parse_poll_body(r#"{"authenticated":"yes"}"#).unwrap();
        assert!(!status.authenticated);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_poll_body("<html>502</html>"),
            Err(AuthError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let provider = HttpAuthProvider::new("https://auth.example.test/");
        assert_eq!(provider.base_url(), "https://auth.example.test");
    }
}
