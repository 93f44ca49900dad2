//! Secret-store backends.
//!
//! Each backend implements [`SecretSource`] with its own identifier type.
//! [`SourcedKey`] pairs a source with one identifier and erases both behind
//! [`KeySource`], which is what the provider resolves.

mod azure;
mod file;
mod hashicorp;
mod hsm;
mod http;
pub mod keyfile;

use std::fmt;

use futures::future::BoxFuture;

pub use azure::{AzureEndpoints, AzureKeyVaultSource, AzureSecretId};
pub use file::{FileSecretSource, KeyFilePath};
pub use hashicorp::{HashicorpVaultSource, VaultSecretId};
pub use hsm::{
    HsmKeyId, HsmModule, HsmModuleHandle, HsmModuleLoader, HsmModules, HsmSecretSource, HsmSession,
};

use crate::error::Result;
use crate::secret::SecretBytes;

/// Fetches raw secret material from one kind of store.
///
/// `fetch` is the only call that exposes secret material. Implementations
/// must not log, cache or retain what they return, and never retry on their
/// own.
pub trait SecretSource: Send + Sync {
    type Id: fmt::Display + Send + Sync;

    /// Short backend name used in identifiers and logs.
    fn backend(&self) -> &'static str;

    fn fetch<'a>(&'a self, id: &'a Self::Id) -> BoxFuture<'a, Result<SecretBytes>>;

    /// Release long-lived connections. Safe to call repeatedly.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A configured key: something that can produce one secret.
pub trait KeySource: Send + Sync {
    /// `backend:identifier`, safe to log.
    fn identifier(&self) -> String;

    fn resolve(&self) -> BoxFuture<'_, Result<SecretBytes>>;

    fn release(&self) -> BoxFuture<'_, ()>;
}

/// A [`SecretSource`] bound to one of its identifiers.
pub struct SourcedKey<S: SecretSource> {
    source: S,
    id: S::Id,
}

impl<S: SecretSource> SourcedKey<S> {
    pub fn new(source: S, id: S::Id) -> Self {
        Self { source, id }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: SecretSource> KeySource for SourcedKey<S> {
    fn identifier(&self) -> String {
        format!("{}:{}", self.source.backend(), self.id)
    }

    fn resolve(&self) -> BoxFuture<'_, Result<SecretBytes>> {
        self.source.fetch(&self.id)
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        self.source.close()
    }
}

/// Bound `future` by `timeout`, mapping expiry to [`Error::Timeout`](crate::Error::Timeout).
/// `None` awaits without a bound.
pub(crate) async fn with_timeout<T>(
    timeout: Option<std::time::Duration>,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let Some(timeout) = timeout else {
        return future.await;
    };
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| crate::Error::Timeout(timeout))?
}
