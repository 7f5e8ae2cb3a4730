// src/core/master/auth.rs

//! The master authentication sub-channel: a single HTTP/REST request that
//! exchanges host credentials for a session id, an assigned server id, and
//! chat-server coordinates (§4.7).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::MasterConfig;
use crate::core::errors::{FleetError, FleetResult};

/// Per-request timeout; kept short so a single stuck attempt doesn't block
/// the fixed-backoff retry loop in [`super::supervisor`] for long.
const AUTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    login: &'a str,
    password: &'a str,
}

/// The master's response to a successful authentication POST.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AuthResponse {
    pub session_id: String,
    pub server_id: i64,
    #[serde(default)]
    pub chat_host: Option<String>,
    #[serde(default)]
    pub chat_port: Option<u16>,
}

/// POSTs credentials to the master and parses the response. A single
/// attempt; the fixed-backoff retry policy lives in the supervisor loop so
/// that authentication state transitions stay observable from one place.
pub async fn authenticate(http: &reqwest::Client, config: &MasterConfig) -> FleetResult<AuthResponse> {
    if config.master_url.is_empty() {
        return Err(FleetError::Config("master.master_url is not configured".into()));
    }

    let response = http
        .post(format!("{}/api/servers/authenticate", config.master_url.trim_end_matches('/')))
        .json(&AuthRequest {
            login: &config.login,
            password: &config.password,
        })
        .timeout(AUTH_REQUEST_TIMEOUT)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(FleetError::AuthFailed(format!(
            "master returned status {}",
            response.status()
        )));
    }

    response
        .json::<AuthResponse>()
        .await
        .map_err(|e| FleetError::AuthFailed(format!("malformed authentication response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_master_url_is_a_configuration_error() {
        let http = reqwest::Client::new();
        let config = MasterConfig::default();
        let err = authenticate(&http, &config).await.unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[test]
    fn auth_response_falls_back_to_config_chat_coordinates_when_absent() {
        let json = r#"{"session_id":"abc","server_id":7}"#;
        let parsed: AuthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.chat_host, None);
        assert_eq!(parsed.chat_port, None);
        assert_eq!(parsed.server_id, 7);
    }
}
