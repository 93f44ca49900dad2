use std::fmt;

use alloy_primitives::keccak256;
use k256::ecdsa::{RecoveryId, VerifyingKey};

use super::PublicKey;
use crate::error::KeyMaterialError;

/// Recoverable ECDSA signature in Ethereum form: low-s, `v ∈ {0, 1}`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    inner: k256::ecdsa::Signature,
    recovery_id: RecoveryId,
}

impl Signature {
    pub(crate) fn new(inner: k256::ecdsa::Signature, recovery_id: RecoveryId) -> Self {
        Self { inner, recovery_id }
    }

    pub fn r(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.inner.to_bytes()[..32]);
        out
    }

    pub fn s(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.inner.to_bytes()[32..]);
        out
    }

    pub fn v(&self) -> u8 {
        self.recovery_id.to_byte()
    }

    /// 65-byte `r ‖ s ‖ v` encoding.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&self.inner.to_bytes());
        out[64] = self.v();
        out
    }

    /// Parse `r ‖ s ‖ v`. High-s values and `v > 1` are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyMaterialError> {
        if bytes.len() != 65 {
            return Err(KeyMaterialError::InvalidSignature);
        }
        let inner = k256::ecdsa::Signature::from_slice(&bytes[..64])
            .map_err(|_| KeyMaterialError::InvalidSignature)?;
        if inner.normalize_s().is_some() {
            return Err(KeyMaterialError::InvalidSignature);
        }
        let recovery_id = match bytes[64] {
            0 => RecoveryId::new(false, false),
            1 => RecoveryId::new(true, false),
            _ => return Err(KeyMaterialError::InvalidSignature),
        };
        Ok(Self { inner, recovery_id })
    }

    /// Recover the signer's public key from a message signature.
    pub fn recover(&self, message: &[u8]) -> Result<PublicKey, KeyMaterialError> {
        self.recover_prehash(&keccak256(message).0)
    }

    pub fn recover_prehash(&self, digest: &[u8; 32]) -> Result<PublicKey, KeyMaterialError> {
        VerifyingKey::recover_from_prehash(digest, &self.inner, self.recovery_id)
            .map(|key| PublicKey::from(&key))
            .map_err(|_| KeyMaterialError::InvalidSignature)
    }

    pub(crate) fn as_ecdsa(&self) -> &k256::ecdsa::Signature {
        &self.inner
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("r", &hex::encode(self.r()))
            .field("s", &hex::encode(self.s()))
            .field("v", &self.v())
            .finish()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}
