use std::fmt;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use reqwest::header::HeaderValue;
use tokio::sync::Mutex;

use super::http::build_client;
use super::{SecretSource, with_timeout};
use crate::connection::ConnectionParameters;
use crate::error::{ConfigurationError, Error, Result};
use crate::secret::{SecretBytes, SecretRef};

pub const DEFAULT_VAULT_PORT: u16 = 8200;
const TOKEN_HEADER: &str = "X-Vault-Token";

/// A secret path plus the field inside it that holds the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSecretId {
    path: String,
    field: String,
}

impl VaultSecretId {
    pub fn new(path: impl Into<String>, field: impl Into<String>) -> Result<Self, ConfigurationError> {
        let path = path.into().trim().trim_matches('/').to_string();
        let field = field.into().trim().to_string();
        if path.is_empty() {
            return Err(ConfigurationError::InvalidDescriptor("vault secretPath is empty".into()));
        }
        if field.is_empty() {
            return Err(ConfigurationError::InvalidDescriptor("vault secretKeyField is empty".into()));
        }
        Ok(Self { path, field })
    }
}

impl fmt::Display for VaultSecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path, self.field)
    }
}

/// HashiCorp Vault KV secrets, read with token authentication.
///
/// The HTTP client is opened on first fetch and dropped by [`close`](SecretSource::close).
pub struct HashicorpVaultSource {
    params: ConnectionParameters,
    token: SecretRef,
    client: Mutex<Option<reqwest::Client>>,
}

impl HashicorpVaultSource {
    /// Fails if the token reference cannot be resolved.
    ///
    /// Without TLS the token and the key travel in cleartext; descriptors
    /// always carry TLS, so this only happens through the library API.
    pub fn new(params: ConnectionParameters, token: SecretRef) -> Result<Self, ConfigurationError> {
        token.validate()?;
        if params.tls().is_none() {
            tracing::warn!(host = params.host(), "vault source has no TLS; token and key are sent in cleartext");
        }
        Ok(Self {
            params,
            token,
            client: Mutex::new(None),
        })
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn client(&self) -> Result<reqwest::Client> {
        let mut client = self.client.lock().await;
        if let Some(client) = client.as_ref() {
            return Ok(client.clone());
        }
        let opened = build_client(&self.params, DEFAULT_VAULT_PORT)?;
        tracing::debug!(host = self.params.host(), "opened vault client");
        *client = Some(opened.clone());
        Ok(opened)
    }

    async fn read(&self, id: &VaultSecretId) -> Result<SecretBytes> {
        let client = self.client().await?;
        let token = self.token.resolve_string()?;
        let mut token = HeaderValue::from_str(&token).map_err(|_| {
            ConfigurationError::InvalidDescriptor(format!(
                "vault token from {} is not a valid header value",
                self.token
            ))
        })?;
        token.set_sensitive(true);

        let url = format!("{}/v1/{}", self.params.base_url(DEFAULT_VAULT_PORT), id.path);
        let response = client
            .get(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::not_found(format!("vault secret {id} does not exist")));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::connection(format!(
                    "vault rejected the token for {id} ({})",
                    response.status()
                )));
            }
            status => {
                return Err(Error::connection(format!("vault returned {status} for {id}")));
            }
        }

        let body: serde_json::Value = response.json().await.map_err(|e| self.request_error(e))?;
        extract_field(body, &id.field)
            .ok_or_else(|| Error::not_found(format!("vault secret {id} has no such field")))
    }

    fn request_error(&self, error: reqwest::Error) -> Error {
        match self.params.effective_timeout() {
            Some(timeout) if error.is_timeout() => return Error::Timeout(timeout),
            _ => {}
        }
        Error::connection(format!(
            "vault request to {} failed: {}",
            self.params.host(),
            error.without_url()
        ))
    }
}

impl SecretSource for HashicorpVaultSource {
    type Id = VaultSecretId;

    fn backend(&self) -> &'static str {
        "hashicorp-vault"
    }

    fn fetch<'a>(&'a self, id: &'a VaultSecretId) -> BoxFuture<'a, Result<SecretBytes>> {
        with_timeout(self.params.effective_timeout(), self.read(id)).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.client.lock().await.take().is_some() {
                tracing::debug!(host = self.params.host(), "closed vault client");
            }
        }
        .boxed()
    }
}

/// KV v2 nests the secret under `data.data`, KV v1 under `data`.
fn extract_field(body: serde_json::Value, field: &str) -> Option<SecretBytes> {
    let serde_json::Value::Object(mut root) = body else {
        return None;
    };
    let serde_json::Value::Object(mut data) = root.remove("data")? else {
        return None;
    };
    let value = match data.remove("data") {
        Some(serde_json::Value::Object(mut inner)) => inner.remove(field),
        _ => data.remove(field),
    }?;
    match value {
        serde_json::Value::String(text) => Some(SecretBytes::new(text.into_bytes())),
        _ => None,
    }
}
