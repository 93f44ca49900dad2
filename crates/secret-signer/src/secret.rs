use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{ConfigurationError, Result};

/// Raw secret material returned by a [`SecretSource`](crate::source::SecretSource).
///
/// Zeroized on drop, never `Clone`, redacted in `Debug`.
pub struct SecretBytes {
    inner: Zeroizing<Vec<u8>>,
}

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { inner: Zeroizing::new(bytes) }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        Self::new(slice.to_vec())
    }

    /// Expose the bytes for the duration of a borrow.
    pub fn expose_secret(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<Zeroizing<Vec<u8>>> for SecretBytes {
    fn from(inner: Zeroizing<Vec<u8>>) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED {} bytes])", self.len())
    }
}

/// Out-of-band reference to a secret (password, token, PIN).
///
/// Configuration never holds the secret itself, only where to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretRef {
    /// Read from an environment variable.
    Env(String),
    /// Read from a file; one trailing newline is stripped.
    File(PathBuf),
}

impl SecretRef {
    /// Confirm the referenced secret is reachable without reading it.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Env(name) => {
                if std::env::var_os(name).is_none() {
                    return Err(ConfigurationError::MissingEnvironmentVariable(name.clone()));
                }
                Ok(())
            }
            Self::File(path) => ensure_readable(path),
        }
    }

    pub fn resolve(&self) -> Result<SecretBytes> {
        match self {
            Self::Env(name) => {
                let value = std::env::var_os(name)
                    .ok_or_else(|| ConfigurationError::MissingEnvironmentVariable(name.clone()))?;
                let value = Zeroizing::new(
                    value
                        .into_string()
                        .map_err(|_| ConfigurationError::NonUtf8Secret(self.to_string()))?,
                );
                Ok(SecretBytes::from_slice(value.as_bytes()))
            }
            Self::File(path) => {
                let mut contents = Zeroizing::new(std::fs::read(path).map_err(|source| {
                    ConfigurationError::UnreadableFile { path: path.clone(), source }
                })?);
                if contents.last() == Some(&b'\n') {
                    contents.pop();
                    if contents.last() == Some(&b'\r') {
                        contents.pop();
                    }
                }
                Ok(SecretBytes::from(contents))
            }
        }
    }

    /// Resolve as UTF-8 text, e.g. for HTTP form fields.
    pub fn resolve_string(&self) -> Result<Zeroizing<String>> {
        let bytes = self.resolve()?;
        let text = std::str::from_utf8(bytes.expose_secret())
            .map_err(|_| ConfigurationError::NonUtf8Secret(self.to_string()))?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}

impl FromStr for SecretRef {
    type Err = ConfigurationError;

    /// Parses the `env:NAME` / `file:PATH` form used on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("env", name)) if !name.is_empty() => Ok(Self::Env(name.to_string())),
            Some(("file", path)) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
            _ => Err(ConfigurationError::InvalidDescriptor(format!(
                "secret reference {s:?} must be env:NAME or file:PATH"
            ))),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(name) => write!(f, "env:{name}"),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

pub(crate) fn ensure_readable(path: &Path) -> Result<(), ConfigurationError> {
    std::fs::File::open(path)
        .map(drop)
        .map_err(|source| ConfigurationError::UnreadableFile { path: path.to_path_buf(), source })
}
