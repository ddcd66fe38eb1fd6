//! HTTPS enrollment.
//!
//! Two one-shot calls surround agent startup: downloading the backend's SSH
//! host key (which the connector pins) and uploading the agent's public key
//! to associate this host with a Bastio account. TLS verification is always
//! on; failures surface as terminal-friendly `AccountError`-kind messages.

use reqwest::StatusCode;
use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::keys;

#[derive(Debug, Deserialize)]
struct HostKeyResponse {
    payload: String,
}

#[derive(Debug, Serialize)]
struct UploadKeyRequest<'a> {
    api_key: &'a str,
    public_key: &'a str,
    old_public_key: &'a str,
}

/// Client for the backend's enrollment endpoints.
#[derive(Debug, Clone)]
pub struct EnrollmentClient {
    base_url: String,
    http: reqwest::Client,
}

impl EnrollmentClient {
    pub fn new(base_url: impl Into<String>) -> AgentResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("Bastio Agent v{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { base_url, http })
    }

    /// Fetch the backend's SSH host key for pinning.
    pub async fn download_backend_hostkey(&self) -> AgentResult<PublicKey> {
        const ERRMSG: &str = "get backend host key failed";

        let url = format!("{}/backend/host_key", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::account(format!("{ERRMSG}: {e}")))?;
        if response.status() != StatusCode::OK {
            return Err(AgentError::account(format!(
                "{ERRMSG}: unable to retrieve backend's host key"
            )));
        }
        let body: HostKeyResponse = response
            .json()
            .await
            .map_err(|e| AgentError::account(format!("{ERRMSG}: {e}")))?;
        keys::parse_public_key(&body.payload)
            .map_err(|_| AgentError::account(format!("{ERRMSG}: invalid host key")))
    }

    /// Upload the agent's public key to the account identified by `api_key`.
    ///
    /// With `old_public_key` set, the backend replaces its record of the old
    /// key instead of registering a new server.
    pub async fn upload_public_key(
        &self,
        api_key: &str,
        public_key: &str,
        old_public_key: Option<&str>,
    ) -> AgentResult<()> {
        const ERRMSG: &str = "upload public key failed";

        if let Some(old) = old_public_key {
            if !keys::validate_public_key(old) {
                return Err(AgentError::account(format!(
                    "{ERRMSG}: invalid old public key"
                )));
            }
        }
        if !keys::validate_public_key(public_key) {
            return Err(AgentError::account(format!(
                "{ERRMSG}: invalid new public key"
            )));
        }

        let url = format!("{}/server/upload_key", self.base_url);
        let payload = UploadKeyRequest {
            api_key,
            public_key,
            old_public_key: old_public_key.unwrap_or(""),
        };
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AgentError::account(format!("{ERRMSG}: {e}")))?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::BAD_REQUEST => Err(AgentError::account(format!(
                "{ERRMSG}: missing or invalid field"
            ))),
            StatusCode::FORBIDDEN => Err(AgentError::account(format!(
                "{ERRMSG}: not authorized or invalid API key"
            ))),
            other => Err(AgentError::account(format!(
                "{ERRMSG}: unexpected response status code ({})",
                other.as_u16()
            ))),
        }
    }
}
