use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use tracing::info;

/// Short-lived bearer credential used once to authenticate a session
#[derive(Clone, Deserialize)]
pub struct EphemeralCredential {
    pub value: String,
    /// Unix timestamp (seconds) after which the credential is no longer valid
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl EphemeralCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }
}

impl fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies a fresh credential for every `connect()`
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> Result<EphemeralCredential>;
}

/// Fixed credential, for local engines that do not mint tokens
pub struct StaticCredential(pub String);

#[async_trait::async_trait]
impl CredentialProvider for StaticCredential {
    async fn fetch(&self) -> Result<EphemeralCredential> {
        Ok(EphemeralCredential::new(self.0.clone()))
    }
}

/// Fetches credentials from an HTTP endpoint.
///
/// Accepts either `{"client_secret": {"value": ..., "expires_at": ...}}` or a
/// bare `{"value": ...}` body.
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(default)]
    client_secret: Option<EphemeralCredential>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl HttpCredentialProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch(&self) -> Result<EphemeralCredential> {
        info!("Fetching ephemeral credential from {}", self.endpoint);

        let response: SessionResponse = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .context("Credential endpoint unreachable")?
            .error_for_status()
            .context("Credential endpoint returned an error")?
            .json()
            .await
            .context("Failed to parse credential response")?;

        match (response.client_secret, response.value) {
            (Some(secret), _) => Ok(secret),
            (None, Some(value)) => Ok(EphemeralCredential {
                value,
                expires_at: response.expires_at,
            }),
            (None, None) => anyhow::bail!("Credential response did not contain a client secret"),
        }
    }
}
