use std::path::PathBuf;
use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure while resolving a key source or talking to a secret store.
///
/// Messages never carry secret material. Backends describe *where* a
/// failure happened (host, path, status code), never *what* was read.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("invalid key material: {0}")]
    KeyMaterial(#[from] KeyMaterialError),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

/// Malformed connection parameters, trust material or key-source descriptor.
///
/// Always raised before any network or HSM call is attempted.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("port {0} is outside 1..=65535")]
    InvalidPort(i64),
    #[error("timeout must not be negative (got {0} ms)")]
    NegativeTimeout(i64),
    #[error("trust mode {mode} requires trust material")]
    MissingTrustMaterial { mode: &'static str },
    #[error("trust mode {mode} does not take trust material")]
    UnexpectedTrustMaterial { mode: &'static str },
    #[error("cannot read {}: {source}", path.display())]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CA bundle {}: {reason}", path.display())]
    InvalidCaBundle { path: PathBuf, reason: String },
    #[error("invalid certificate fingerprint: {0}")]
    InvalidFingerprint(String),
    #[error("invalid whitelist entry at {}:{line}: {reason}", path.display())]
    InvalidWhitelistEntry {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("environment variable {0} is not set")]
    MissingEnvironmentVariable(String),
    #[error("secret reference {0} does not hold valid UTF-8")]
    NonUtf8Secret(String),
    #[error("invalid key source descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("cannot parse {}: {reason}", path.display())]
    Unparseable { path: PathBuf, reason: String },
    #[error("no HSM module loader registered for {}", library_path.display())]
    HsmLoaderMissing { library_path: PathBuf },
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Secret material was retrieved but is not a usable secp256k1 scalar.
///
/// Indicates misprovisioning and should be surfaced loudly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyMaterialError {
    #[error("expected 32 raw bytes or 64 hex characters, got {0} bytes")]
    InvalidLength(usize),
    #[error("key material is not valid hex")]
    InvalidHex,
    #[error("scalar is zero or not below the curve order")]
    ScalarOutOfRange,
    #[error("encrypted key file could not be decrypted (wrong password or corrupted file)")]
    Undecryptable,
    #[error("malformed encrypted key file: {0}")]
    MalformedKeyFile(String),
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
}

/// Signing-time failures. Both variants are internal invariant violations
/// that cannot occur with a correctly parameterized curve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("no valid nonce found after {0} attempts")]
    NonceExhausted(u32),
    #[error("neither recovery candidate matches the signer's public key")]
    RecoveryMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_converts_into_error() {
        let error: Error = ConfigurationError::EmptyHost.into();
        assert!(matches!(error, Error::Configuration(ConfigurationError::EmptyHost)));
        assert_eq!(error.to_string(), "configuration error: host must not be empty");
    }

    #[test]
    fn key_material_error_converts_into_error() {
        let error: Error = KeyMaterialError::ScalarOutOfRange.into();
        assert!(matches!(error, Error::KeyMaterial(_)));
    }

    #[test]
    fn timeout_message_names_duration() {
        let error = Error::Timeout(Duration::from_millis(1500));
        assert_eq!(error.to_string(), "operation timed out after 1.5s");
    }

    #[test]
    fn not_found_and_connection_are_distinct() {
        assert!(matches!(Error::not_found("secret/data/key#value"), Error::NotFound(_)));
        assert!(matches!(Error::connection("refused"), Error::Connection(_)));
    }
}
