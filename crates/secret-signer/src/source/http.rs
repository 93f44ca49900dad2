//! HTTP client construction for remote secret stores.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};

use crate::connection::{ConnectionParameters, Fingerprint, PinnedCertificate, ResolvedTrust};
use crate::error::ConfigurationError;

/// Build a client for `params`, honouring its trust mode and timeout.
pub(crate) fn build_client(
    params: &ConnectionParameters,
    default_port: u16,
) -> Result<reqwest::Client, ConfigurationError> {
    let mut builder = bounded(reqwest::Client::builder().no_proxy(), params.effective_timeout());

    if let Some(tls) = params.tls() {
        builder = match tls.trust() {
            ResolvedTrust::SystemCa => builder,
            ResolvedTrust::CaBundle(certificates) => certificates
                .iter()
                .cloned()
                .fold(builder.tls_built_in_root_certs(false), |builder, certificate| {
                    builder.add_root_certificate(certificate)
                }),
            ResolvedTrust::Pinned(pins) => {
                let endpoint = format!("{}:{}", params.host(), params.port_or(default_port));
                builder.use_preconfigured_tls(pinned_config(pins, &endpoint)?)
            }
            ResolvedTrust::TrustAll => builder.danger_accept_invalid_certs(true),
        };
    }

    builder
        .build()
        .map_err(|e| ConfigurationError::Tls(e.to_string()))
}

/// Default client for endpoints verified against the platform roots.
pub(crate) fn default_client(timeout: Option<Duration>) -> Result<reqwest::Client, ConfigurationError> {
    bounded(reqwest::Client::builder().no_proxy(), timeout)
        .build()
        .map_err(|e| ConfigurationError::Tls(e.to_string()))
}

fn bounded(builder: reqwest::ClientBuilder, timeout: Option<Duration>) -> reqwest::ClientBuilder {
    match timeout {
        Some(timeout) => builder.timeout(timeout).connect_timeout(timeout),
        None => builder,
    }
}

fn pinned_config(
    pins: &[PinnedCertificate],
    endpoint: &str,
) -> Result<rustls::ClientConfig, ConfigurationError> {
    let endpoint = endpoint.to_ascii_lowercase();
    let fingerprints: Vec<Fingerprint> = pins
        .iter()
        .filter(|pin| pin.endpoint.as_deref().is_none_or(|e| e == endpoint))
        .map(|pin| pin.fingerprint)
        .collect();
    if fingerprints.is_empty() {
        tracing::warn!(%endpoint, "no pinned fingerprint applies to endpoint; every certificate will be rejected");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedCertVerifier {
        fingerprints,
        provider: provider.clone(),
    };
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigurationError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

/// Accepts a server iff the SHA-256 of its leaf certificate is pinned.
///
/// Handshake signatures are still checked, so the peer must hold the pinned
/// certificate's private key.
#[derive(Debug)]
struct PinnedCertVerifier {
    fingerprints: Vec<Fingerprint>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let fingerprint = Fingerprint::of_der(end_entity.as_ref());
        if self.fingerprints.contains(&fingerprint) {
            return Ok(ServerCertVerified::assertion());
        }
        tracing::warn!(%fingerprint, "server certificate is not pinned");
        Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
