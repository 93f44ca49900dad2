use std::fmt;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;
use zeroize::Zeroizing;

use super::http::default_client;
use super::{SecretSource, with_timeout};
use crate::connection::Timeout;
use crate::error::{ConfigurationError, Error, Result};
use crate::secret::{SecretBytes, SecretRef};

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const API_VERSION: &str = "7.4";

/// Vault name plus secret name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureSecretId {
    vault_name: String,
    secret_name: String,
}

impl AzureSecretId {
    /// Vault names are 3-24 characters of ASCII letters, digits and hyphens,
    /// starting with a letter. Secret names are letters, digits and hyphens.
    pub fn new(
        vault_name: impl Into<String>,
        secret_name: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let vault_name = vault_name.into();
        let secret_name = secret_name.into();

        let valid_vault = (3..=24).contains(&vault_name.len())
            && vault_name.starts_with(|c: char| c.is_ascii_alphabetic())
            && vault_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid_vault {
            return Err(ConfigurationError::InvalidDescriptor(format!(
                "invalid azure vaultName {vault_name:?}"
            )));
        }
        let valid_secret = !secret_name.is_empty()
            && secret_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid_secret {
            return Err(ConfigurationError::InvalidDescriptor(format!(
                "invalid azure secretName {secret_name:?}"
            )));
        }
        Ok(Self { vault_name, secret_name })
    }
}

impl fmt::Display for AzureSecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vault_name, self.secret_name)
    }
}

/// Where to authenticate and where vaults live.
///
/// Defaults to the public cloud; overridable for sovereign clouds and tests.
#[derive(Debug, Clone)]
pub struct AzureEndpoints {
    pub authority: String,
    /// Replaces `https://{vault}.vault.azure.net` when set.
    pub vault_base: Option<String>,
}

impl Default for AzureEndpoints {
    fn default() -> Self {
        Self {
            authority: DEFAULT_AUTHORITY.to_string(),
            vault_base: None,
        }
    }
}

impl AzureEndpoints {
    fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{tenant_id}/oauth2/v2.0/token", self.authority.trim_end_matches('/'))
    }

    fn secret_url(&self, id: &AzureSecretId) -> String {
        let base = match &self.vault_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}.vault.azure.net", id.vault_name),
        };
        format!("{base}/secrets/{}?api-version={API_VERSION}", id.secret_name)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

/// Azure Key Vault secrets, read with an app registration's client credentials.
///
/// Every fetch uses a fresh client and token; nothing outlives the call.
pub struct AzureKeyVaultSource {
    tenant_id: String,
    client_id: String,
    client_secret: SecretRef,
    timeout: Option<Timeout>,
    endpoints: AzureEndpoints,
}

impl AzureKeyVaultSource {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretRef,
        timeout: Option<Timeout>,
    ) -> Result<Self, ConfigurationError> {
        let tenant_id = tenant_id.into();
        let client_id = client_id.into();
        if tenant_id.trim().is_empty() || client_id.trim().is_empty() {
            return Err(ConfigurationError::InvalidDescriptor(
                "azure tenantId and clientId must not be empty".into(),
            ));
        }
        client_secret.validate()?;
        Ok(Self {
            tenant_id,
            client_id,
            client_secret,
            timeout,
            endpoints: AzureEndpoints::default(),
        })
    }

    pub fn with_endpoints(mut self, endpoints: AzureEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn timeout(&self) -> Option<Duration> {
        Timeout::budget(self.timeout)
    }

    async fn read(&self, id: &AzureSecretId) -> Result<SecretBytes> {
        let client = default_client(self.timeout())?;
        let token = self.access_token(&client).await?;

        let response = client
            .get(self.endpoints.secret_url(id))
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::not_found(format!("azure secret {id} does not exist")));
            }
            status => {
                return Err(Error::connection(format!("azure key vault returned {status} for {id}")));
            }
        }

        let bundle: SecretBundle = response.json().await.map_err(|e| self.request_error(e))?;
        Ok(SecretBytes::new(bundle.value.into_bytes()))
    }

    async fn access_token(&self, client: &reqwest::Client) -> Result<Zeroizing<String>> {
        let client_secret = self.client_secret.resolve_string()?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("scope", VAULT_SCOPE),
        ];
        let response = client
            .post(self.endpoints.token_url(&self.tenant_id))
            .form(&form)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        if !response.status().is_success() {
            return Err(Error::connection(format!(
                "azure token request for client {} failed with {}",
                self.client_id,
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await.map_err(|e| self.request_error(e))?;
        Ok(Zeroizing::new(token.access_token))
    }

    fn request_error(&self, error: reqwest::Error) -> Error {
        match self.timeout() {
            Some(timeout) if error.is_timeout() => return Error::Timeout(timeout),
            _ => {}
        }
        Error::connection(format!("azure request failed: {}", error.without_url()))
    }
}

impl SecretSource for AzureKeyVaultSource {
    type Id = AzureSecretId;

    fn backend(&self) -> &'static str {
        "azure-key-vault"
    }

    fn fetch<'a>(&'a self, id: &'a AzureSecretId) -> BoxFuture<'a, Result<SecretBytes>> {
        with_timeout(self.timeout(), self.read(id)).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        futures::future::ready(()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_vault_name() {
        assert!(AzureSecretId::new("signer-vault", "eth-key").is_ok());
        assert!(AzureSecretId::new("ab", "eth-key").is_err());
        assert!(AzureSecretId::new("1vault", "eth-key").is_err());
        assert!(AzureSecretId::new("vault_name", "eth-key").is_err());
        assert!(AzureSecretId::new("signer-vault", "eth/key").is_err());
    }

    #[test]
    fn builds_public_cloud_urls() {
        let endpoints = AzureEndpoints::default();
        let id = AzureSecretId::new("signer-vault", "eth-key").unwrap();
        assert_eq!(
            endpoints.secret_url(&id),
            "https://signer-vault.vault.azure.net/secrets/eth-key?api-version=7.4"
        );
        assert_eq!(
            endpoints.token_url("tenant"),
            "https://login.microsoftonline.com/tenant/oauth2/v2.0/token"
        );
    }

    #[test]
    fn overridden_vault_base_ignores_vault_name() {
        let endpoints = AzureEndpoints {
            authority: "http://127.0.0.1:9000/".into(),
            vault_base: Some("http://127.0.0.1:9000/".into()),
        };
        let id = AzureSecretId::new("signer-vault", "eth-key").unwrap();
        assert_eq!(endpoints.secret_url(&id), "http://127.0.0.1:9000/secrets/eth-key?api-version=7.4");
        assert_eq!(endpoints.token_url("t"), "http://127.0.0.1:9000/t/oauth2/v2.0/token");
    }
}
