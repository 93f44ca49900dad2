use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;
use zeroize::Zeroizing;

use super::{SecretSource, keyfile};
use crate::error::{ConfigurationError, Error, Result};
use crate::secret::{SecretBytes, SecretRef};

/// Path of a key file on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilePath(PathBuf);

impl KeyFilePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for KeyFilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Local key files, either plain (32 raw bytes or hex) or password-encrypted.
#[derive(Debug, Default)]
pub struct FileSecretSource {
    password: Option<SecretRef>,
}

impl FileSecretSource {
    /// Source for unencrypted key files.
    pub fn plain() -> Self {
        Self { password: None }
    }

    /// Source for key files encrypted under the referenced password.
    pub fn encrypted(password: SecretRef) -> Self {
        Self { password: Some(password) }
    }
}

impl SecretSource for FileSecretSource {
    type Id = KeyFilePath;

    fn backend(&self) -> &'static str {
        "file"
    }

    fn fetch<'a>(&'a self, id: &'a KeyFilePath) -> BoxFuture<'a, Result<SecretBytes>> {
        async move {
            let contents = tokio::fs::read(id.as_path())
                .await
                .map(Zeroizing::new)
                .map_err(|e| read_error(id.as_path(), e))?;

            let Some(reference) = &self.password else {
                return Ok(SecretBytes::from(contents));
            };

            let password = reference.resolve()?;
            // PBKDF2 blocks; run it off the async workers.
            let secret = tokio::task::spawn_blocking(move || {
                keyfile::decrypt(&contents, password.expose_secret())
            })
            .await
            .map_err(|e| Error::connection(format!("key file decryption task failed: {e}")))??;
            Ok(secret)
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        futures::future::ready(()).boxed()
    }
}

fn read_error(path: &Path, error: io::Error) -> Error {
    if error.kind() == io::ErrorKind::NotFound {
        return Error::not_found(format!("key file {} does not exist", path.display()));
    }
    ConfigurationError::UnreadableFile { path: path.to_path_buf(), source: error }.into()
}
