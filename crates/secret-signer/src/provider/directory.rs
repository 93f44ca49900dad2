use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::Mutex;

use super::SignerProvider;
use crate::config::{self, KeySourceDescriptor};
use crate::error::{ConfigurationError, Error, Result};
use crate::signing::{PublicKey, Secp256k1Signer, SignerFactory, TransactionSigner};
use crate::source::{AzureEndpoints, HsmModuleLoader, HsmModules, KeySource};

/// What happened to one configured key source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStatus {
    Loaded,
    NotFound,
    ConnectionError,
    Timeout,
    InvalidKey,
    InvalidConfig,
    Duplicate,
}

impl LoadStatus {
    fn of(error: &Error) -> Self {
        match error {
            Error::Configuration(_) => Self::InvalidConfig,
            Error::Connection(_) => Self::ConnectionError,
            Error::NotFound(_) => Self::NotFound,
            Error::KeyMaterial(_) => Self::InvalidKey,
            Error::Timeout(_) => Self::Timeout,
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loaded => "loaded",
            Self::NotFound => "not-found",
            Self::ConnectionError => "connection-error",
            Self::Timeout => "timeout",
            Self::InvalidKey => "invalid-key",
            Self::InvalidConfig => "invalid-config",
            Self::Duplicate => "duplicate",
        })
    }
}

/// Per-source construction report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub identifier: String,
    pub status: LoadStatus,
    pub public_key: Option<PublicKey>,
    pub message: String,
}

/// Whether a partially loaded registry is acceptable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Keep whatever loaded; failures are reported as outcomes.
    #[default]
    BestEffort,
    /// Fail construction unless every source loaded.
    RequireAll,
}

/// Knobs for building a provider from descriptors.
#[derive(Clone, Default)]
pub struct LoadOptions {
    pub policy: LoadPolicy,
    /// Required for `hsm` descriptors.
    pub hsm_loader: Option<Arc<dyn HsmModuleLoader>>,
    /// Overrides the public-cloud endpoints for `azure-key-vault` descriptors.
    pub azure_endpoints: Option<AzureEndpoints>,
}

impl LoadOptions {
    pub fn require_all(mut self) -> Self {
        self.policy = LoadPolicy::RequireAll;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("{failed} of {} key sources did not load", .outcomes.len())]
    Incomplete {
        failed: usize,
        outcomes: Vec<LoadOutcome>,
    },
}

/// Registry built by resolving every configured key source once.
///
/// The `PublicKey → signer` map never changes after construction, so lookups
/// need no locking. [`shutdown`](SignerProvider::shutdown) only releases
/// backend connections.
pub struct DirectorySignerProvider {
    signers: HashMap<PublicKey, Arc<dyn TransactionSigner>>,
    outcomes: Vec<LoadOutcome>,
    sources: Vec<Box<dyn KeySource>>,
    shut_down: Mutex<bool>,
}

impl DirectorySignerProvider {
    /// Load descriptors from a TOML file or directory and resolve them.
    pub async fn from_config_path(path: &Path, options: LoadOptions) -> Result<Self, LoadError> {
        let descriptors = config::load_descriptors(path)?;
        Self::from_descriptors(descriptors, options).await
    }

    /// Build every descriptor, then resolve them. A malformed descriptor fails
    /// the whole call before any backend is contacted. `hsm` descriptors on
    /// the same library share one loaded module.
    pub async fn from_descriptors(
        descriptors: Vec<KeySourceDescriptor>,
        options: LoadOptions,
    ) -> Result<Self, LoadError> {
        let hsm_modules = HsmModules::default();
        let sources = descriptors
            .into_iter()
            .map(|descriptor| descriptor.into_key_source(&options, &hsm_modules))
            .collect::<Result<Vec<_>, ConfigurationError>>()?;
        Self::from_key_sources(sources, options.policy).await
    }

    /// Resolve `sources` concurrently. Configuration order decides which
    /// source wins when two yield the same key.
    pub async fn from_key_sources(
        sources: Vec<Box<dyn KeySource>>,
        policy: LoadPolicy,
    ) -> Result<Self, LoadError> {
        let resolved = join_all(sources.iter().map(|source| resolve(source.as_ref()))).await;

        let mut signers: HashMap<PublicKey, Arc<dyn TransactionSigner>> = HashMap::new();
        let mut outcomes = Vec::with_capacity(sources.len());
        for (source, result) in sources.iter().zip(resolved) {
            let identifier = source.identifier();
            let outcome = match result {
                Ok(signer) if signers.contains_key(&signer.identity()) => {
                    let public_key = signer.identity();
                    tracing::warn!(%identifier, %public_key, "duplicate key ignored");
                    LoadOutcome {
                        identifier,
                        status: LoadStatus::Duplicate,
                        public_key: Some(public_key),
                        message: "key already provided by an earlier source".into(),
                    }
                }
                Ok(signer) => {
                    let public_key = signer.identity();
                    tracing::info!(
                        %identifier,
                        %public_key,
                        address = %public_key.ethereum_address(),
                        "loaded signing key"
                    );
                    signers.insert(public_key, Arc::new(signer));
                    LoadOutcome {
                        identifier,
                        status: LoadStatus::Loaded,
                        public_key: Some(public_key),
                        message: "loaded".into(),
                    }
                }
                Err(error) => {
                    let status = LoadStatus::of(&error);
                    tracing::warn!(%identifier, %status, %error, "key source did not load");
                    LoadOutcome {
                        identifier,
                        status,
                        public_key: None,
                        message: error.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let provider = Self {
            signers,
            outcomes,
            sources,
            shut_down: Mutex::new(false),
        };

        let failed = provider
            .outcomes
            .iter()
            .filter(|outcome| outcome.status != LoadStatus::Loaded)
            .count();
        if policy == LoadPolicy::RequireAll && failed > 0 {
            provider.shutdown().await;
            return Err(LoadError::Incomplete {
                failed,
                outcomes: provider.outcomes,
            });
        }
        Ok(provider)
    }

    /// One entry per configured source, in configuration order.
    pub fn outcomes(&self) -> &[LoadOutcome] {
        &self.outcomes
    }
}

async fn resolve(source: &dyn KeySource) -> Result<Secp256k1Signer> {
    let secret = source.resolve().await?;
    Ok(SignerFactory::create(secret)?)
}

impl SignerProvider for DirectorySignerProvider {
    fn get_signer(&self, public_key: &PublicKey) -> Option<Arc<dyn TransactionSigner>> {
        self.signers.get(public_key).cloned()
    }

    fn available_public_keys(&self) -> HashSet<PublicKey> {
        self.signers.keys().copied().collect()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async move {
            let mut shut_down = self.shut_down.lock().await;
            if *shut_down {
                return;
            }
            join_all(self.sources.iter().map(|source| source.release())).await;
            *shut_down = true;
            tracing::debug!(sources = self.sources.len(), "released key source connections");
        }
        .boxed()
    }
}
