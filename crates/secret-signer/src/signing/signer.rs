use super::{PublicKey, Signature};
use crate::error::SigningError;

/// Signs transaction payloads with a key the caller never sees.
///
/// Implementations are sync; signing is CPU-bound and lock-free.
pub trait TransactionSigner: Send + Sync {
    /// The signer's identity. Pure; `None` only for signers that cannot
    /// report a key (e.g. remote signers that have not been queried yet).
    fn public_key(&self) -> Option<PublicKey>;

    /// Sign the Keccak-256 digest of `message`.
    fn sign(&self, message: &[u8]) -> Result<Signature, SigningError>;

    /// Sign a caller-supplied 32-byte digest.
    fn sign_prehash(&self, digest: &[u8; 32]) -> Result<Signature, SigningError>;
}
