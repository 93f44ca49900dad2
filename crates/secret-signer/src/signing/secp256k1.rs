use std::fmt;

use alloy_primitives::keccak256;
use k256::ecdsa::signature::hazmat::{PrehashSigner, RandomizedPrehashSigner};
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use zeroize::Zeroizing;

use super::{PublicKey, Signature, TransactionSigner};
use crate::error::{KeyMaterialError, SigningError};
use crate::secret::SecretBytes;

/// Upper bound on RFC 6979 re-derivations when a nonce yields `r = 0` or `s = 0`.
pub const MAX_NONCE_ATTEMPTS: u32 = 16;

/// ECDSA signer over secp256k1 with Keccak-256 message hashing.
///
/// Owns the private scalar exclusively; the public key is derived once at
/// construction. `Debug` shows only the public key.
pub struct Secp256k1Signer {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Secp256k1Signer {
    fn new(signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from(signing_key.verifying_key());
        Self { signing_key, public_key }
    }

    /// The signer's public key. Same value as [`TransactionSigner::public_key`].
    pub fn identity(&self) -> PublicKey {
        self.public_key
    }

    fn sign_once(&self, digest: &[u8; 32], attempt: u32) -> Option<k256::ecdsa::Signature> {
        let result = if attempt == 0 {
            PrehashSigner::<k256::ecdsa::Signature>::sign_prehash(&self.signing_key, digest)
        } else {
            // Additional RFC 6979 input, derived from the digest and attempt.
            let mut seed_input = [0u8; 36];
            seed_input[..32].copy_from_slice(digest);
            seed_input[32..].copy_from_slice(&attempt.to_be_bytes());
            let mut rng = ChaCha20Rng::from_seed(keccak256(seed_input).0);
            RandomizedPrehashSigner::<k256::ecdsa::Signature>::sign_prehash_with_rng(
                &self.signing_key,
                &mut rng,
                digest,
            )
        };
        result.ok()
    }
}

impl TransactionSigner for Secp256k1Signer {
    fn public_key(&self) -> Option<PublicKey> {
        Some(self.public_key)
    }

    fn sign(&self, message: &[u8]) -> Result<Signature, SigningError> {
        self.sign_prehash(&keccak256(message).0)
    }

    fn sign_prehash(&self, digest: &[u8; 32]) -> Result<Signature, SigningError> {
        let signature = retry_nonce(|attempt| self.sign_once(digest, attempt))?;
        let signature = signature.normalize_s().unwrap_or(signature);
        let recovery_id = resolve_recovery_id(digest, &signature, self.signing_key.verifying_key())?;
        Ok(Signature::new(signature, recovery_id))
    }
}

impl fmt::Debug for Secp256k1Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secp256k1Signer")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn retry_nonce<F>(mut sign_attempt: F) -> Result<k256::ecdsa::Signature, SigningError>
where
    F: FnMut(u32) -> Option<k256::ecdsa::Signature>,
{
    for attempt in 0..MAX_NONCE_ATTEMPTS {
        if let Some(signature) = sign_attempt(attempt) {
            return Ok(signature);
        }
        tracing::debug!(attempt, "nonce produced a zero scalar, re-deriving");
    }
    Err(SigningError::NonceExhausted(MAX_NONCE_ATTEMPTS))
}

/// Pick `v` by recovering both candidates and matching the signer's key.
fn resolve_recovery_id(
    digest: &[u8; 32],
    signature: &k256::ecdsa::Signature,
    expected: &VerifyingKey,
) -> Result<RecoveryId, SigningError> {
    for is_y_odd in [false, true] {
        let recovery_id = RecoveryId::new(is_y_odd, false);
        if VerifyingKey::recover_from_prehash(digest, signature, recovery_id)
            .is_ok_and(|candidate| &candidate == expected)
        {
            return Ok(recovery_id);
        }
    }
    tracing::error!(
        public_key = %PublicKey::from(expected),
        "recovered key does not match signer; refusing to emit signature"
    );
    Err(SigningError::RecoveryMismatch)
}

/// Builds signers from raw secret material.
pub struct SignerFactory;

impl SignerFactory {
    /// Validate `secret` as a secp256k1 scalar and build a signer from it.
    ///
    /// Accepts 32 raw bytes, or 64 hex characters with an optional `0x`
    /// prefix and surrounding whitespace. The secret is consumed and zeroized
    /// when this returns.
    pub fn create(secret: SecretBytes) -> Result<Secp256k1Signer, KeyMaterialError> {
        let scalar = parse_scalar(secret.expose_secret())?;
        Ok(Secp256k1Signer::new(signing_key(&scalar)?))
    }

    /// Validate `secret` and return its canonical 32-byte big-endian encoding.
    pub fn scalar_bytes(secret: &SecretBytes) -> Result<Zeroizing<[u8; 32]>, KeyMaterialError> {
        let scalar = parse_scalar(secret.expose_secret())?;
        signing_key(&scalar)?;
        Ok(scalar)
    }
}

fn signing_key(scalar: &[u8; 32]) -> Result<SigningKey, KeyMaterialError> {
    SigningKey::from_bytes(k256::FieldBytes::from_slice(scalar))
        .map_err(|_| KeyMaterialError::ScalarOutOfRange)
}

fn parse_scalar(raw: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyMaterialError> {
    let mut scalar = Zeroizing::new([0u8; 32]);
    if raw.len() == 32 {
        scalar.copy_from_slice(raw);
        return Ok(scalar);
    }

    let text = std::str::from_utf8(raw).map_err(|_| KeyMaterialError::InvalidLength(raw.len()))?;
    let text = text.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if text.len() != 64 {
        return Err(KeyMaterialError::InvalidLength(raw.len()));
    }
    hex::decode_to_slice(text, scalar.as_mut_slice()).map_err(|_| KeyMaterialError::InvalidHex)?;
    Ok(scalar)
}
