//! How to reach a remote secret store.
//!
//! Everything here is validated at construction: a [`ConnectionParameters`]
//! or [`TlsOptions`] value that exists is usable, and connect time never
//! discovers missing trust material.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;

/// Applied at connect time when no timeout is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Validated, immutable description of a remote secret store endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    host: String,
    port: Option<u16>,
    tls: Option<TlsOptions>,
    timeout: Option<Timeout>,
}

impl ConnectionParameters {
    pub fn builder(host: impl Into<String>) -> ConnectionParametersBuilder {
        ConnectionParametersBuilder {
            host: host.into(),
            port: None,
            tls: None,
            timeout_ms: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Configured port, or the backend's default.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }

    pub fn timeout(&self) -> Option<Timeout> {
        self.timeout
    }

    /// Budget to enforce per operation; see [`Timeout::budget`].
    pub fn effective_timeout(&self) -> Option<Duration> {
        Timeout::budget(self.timeout)
    }

    /// `scheme://host:port` for this endpoint.
    pub fn base_url(&self, default_port: u16) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port_or(default_port))
    }
}

/// Collects raw values (as they appear in configuration) and validates them in
/// [`build`](Self::build).
#[derive(Debug)]
pub struct ConnectionParametersBuilder {
    host: String,
    port: Option<i64>,
    tls: Option<TlsOptions>,
    timeout_ms: Option<i64>,
}

impl ConnectionParametersBuilder {
    pub fn port(mut self, port: i64) -> Self {
        self.port = Some(port);
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn build(self) -> Result<ConnectionParameters, ConfigurationError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigurationError::EmptyHost);
        }

        let port = self
            .port
            .map(|port| match u16::try_from(port) {
                Ok(port) if port != 0 => Ok(port),
                _ => Err(ConfigurationError::InvalidPort(port)),
            })
            .transpose()?;

        let timeout = self.timeout_ms.map(Timeout::from_ms).transpose()?;

        Ok(ConnectionParameters {
            host: host.to_string(),
            port,
            tls: self.tls,
            timeout,
        })
    }
}

/// Time budget for one remote or HSM operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail with [`Error::Timeout`](crate::Error::Timeout) after this long.
    After(Duration),
    /// Wait as long as the backend takes. Configured as `timeoutMs = 0`.
    Unbounded,
}

impl Timeout {
    /// `0` selects [`Unbounded`](Self::Unbounded); negative values are rejected.
    pub fn from_ms(ms: i64) -> Result<Self, ConfigurationError> {
        match u64::try_from(ms) {
            Ok(0) => Ok(Self::Unbounded),
            Ok(ms) => Ok(Self::After(Duration::from_millis(ms))),
            Err(_) => Err(ConfigurationError::NegativeTimeout(ms)),
        }
    }

    /// [`DEFAULT_TIMEOUT`] when nothing is configured, `None` when unbounded.
    pub fn budget(configured: Option<Self>) -> Option<Duration> {
        match configured {
            None => Some(DEFAULT_TIMEOUT),
            Some(Self::After(timeout)) => Some(timeout),
            Some(Self::Unbounded) => None,
        }
    }
}

/// SHA-256 fingerprint of a DER-encoded certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = ConfigurationError;

    /// Accepts `AB:CD:...` or plain hex, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.trim().chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(&compact)
            .map_err(|_| ConfigurationError::InvalidFingerprint(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigurationError::InvalidFingerprint(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{b:02X}")).collect();
        f.write_str(&parts.join(":"))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Configuration-level trust mode name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustModeKind {
    SystemCa,
    CaFile,
    KnownServer,
    FingerprintWhitelist,
    TrustAll,
}

impl TrustModeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemCa => "system-ca",
            Self::CaFile => "ca-file",
            Self::KnownServer => "known-server",
            Self::FingerprintWhitelist => "fingerprint-whitelist",
            Self::TrustAll => "trust-all",
        }
    }
}

/// How the server certificate is trusted, with the mode's trust material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustMode {
    /// Platform root certificates.
    SystemCa,
    /// Only the CA certificates in this PEM bundle.
    CaFile(PathBuf),
    /// Leaf certificate must have exactly this fingerprint.
    KnownServer(Fingerprint),
    /// Leaf certificate must match a `host:port fingerprint` line in this file.
    FingerprintWhitelist(PathBuf),
    /// Accept any certificate. Explicit opt-in only.
    TrustAll,
}

impl TrustMode {
    /// Build from the descriptor form `{trustMode, trustMaterial?}`.
    pub fn from_parts(kind: TrustModeKind, material: Option<&str>) -> Result<Self, ConfigurationError> {
        let material = material.map(str::trim).filter(|m| !m.is_empty());
        let required = || material.ok_or(ConfigurationError::MissingTrustMaterial { mode: kind.as_str() });
        match kind {
            TrustModeKind::SystemCa | TrustModeKind::TrustAll if material.is_some() => {
                Err(ConfigurationError::UnexpectedTrustMaterial { mode: kind.as_str() })
            }
            TrustModeKind::SystemCa => Ok(Self::SystemCa),
            TrustModeKind::TrustAll => Ok(Self::TrustAll),
            TrustModeKind::CaFile => Ok(Self::CaFile(PathBuf::from(required()?))),
            TrustModeKind::KnownServer => Ok(Self::KnownServer(required()?.parse()?)),
            TrustModeKind::FingerprintWhitelist => {
                Ok(Self::FingerprintWhitelist(PathBuf::from(required()?)))
            }
        }
    }
}

/// A pinned certificate, optionally scoped to one `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedCertificate {
    pub endpoint: Option<String>,
    pub fingerprint: Fingerprint,
}

/// Trust material resolved from a [`TrustMode`].
#[derive(Debug, Clone)]
pub(crate) enum ResolvedTrust {
    SystemCa,
    CaBundle(Vec<reqwest::Certificate>),
    Pinned(Vec<PinnedCertificate>),
    TrustAll,
}

/// Validated TLS configuration.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    mode: TrustMode,
    trust: ResolvedTrust,
}

impl TlsOptions {
    /// Validate the mode and load its trust material.
    pub fn new(mode: TrustMode) -> Result<Self, ConfigurationError> {
        let trust = match &mode {
            TrustMode::SystemCa => ResolvedTrust::SystemCa,
            TrustMode::TrustAll => {
                tracing::warn!("TLS trust-all mode enabled; server certificates are not verified");
                ResolvedTrust::TrustAll
            }
            TrustMode::CaFile(path) => ResolvedTrust::CaBundle(load_ca_bundle(path)?),
            TrustMode::KnownServer(fingerprint) => ResolvedTrust::Pinned(vec![PinnedCertificate {
                endpoint: None,
                fingerprint: *fingerprint,
            }]),
            TrustMode::FingerprintWhitelist(path) => ResolvedTrust::Pinned(load_whitelist(path)?),
        };
        Ok(Self { mode, trust })
    }

    pub fn mode(&self) -> &TrustMode {
        &self.mode
    }

    pub(crate) fn trust(&self) -> &ResolvedTrust {
        &self.trust
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigurationError> {
    std::fs::read(path).map_err(|source| ConfigurationError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    })
}

fn load_ca_bundle(path: &Path) -> Result<Vec<reqwest::Certificate>, ConfigurationError> {
    let pem = read_file(path)?;
    let certificates = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
        ConfigurationError::InvalidCaBundle { path: path.to_path_buf(), reason: e.to_string() }
    })?;
    if certificates.is_empty() {
        return Err(ConfigurationError::InvalidCaBundle {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certificates)
}

/// Parse a whitelist file of `host:port fingerprint` lines. Blank lines and
/// `#` comments are ignored.
fn load_whitelist(path: &Path) -> Result<Vec<PinnedCertificate>, ConfigurationError> {
    let contents = read_file(path)?;
    let contents = String::from_utf8(contents).map_err(|_| ConfigurationError::InvalidWhitelistEntry {
        path: path.to_path_buf(),
        line: 0,
        reason: "file is not UTF-8".to_string(),
    })?;

    let invalid = |line: usize, reason: &str| ConfigurationError::InvalidWhitelistEntry {
        path: path.to_path_buf(),
        line,
        reason: reason.to_string(),
    };

    let mut entries = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line_no = index + 1;
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(endpoint), Some(fingerprint), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid(line_no, "expected `host:port fingerprint`"));
        };
        let Some((host, port)) = endpoint.rsplit_once(':') else {
            return Err(invalid(line_no, "endpoint must be host:port"));
        };
        if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
            return Err(invalid(line_no, "endpoint must be host:port"));
        }
        let fingerprint = fingerprint
            .parse()
            .map_err(|_| invalid(line_no, "malformed fingerprint"))?;
        entries.push(PinnedCertificate {
            endpoint: Some(endpoint.to_ascii_lowercase()),
            fingerprint,
        });
    }

    if entries.is_empty() {
        return Err(invalid(0, "whitelist holds no entries"));
    }
    Ok(entries)
}
