//! Registries mapping public keys to signers.

mod directory;
mod single;

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;

pub use directory::{DirectorySignerProvider, LoadError, LoadOptions, LoadOutcome, LoadPolicy, LoadStatus};
pub use single::SingleSignerProvider;

use crate::signing::{PublicKey, TransactionSigner};

/// Looks up signers by identity.
pub trait SignerProvider: Send + Sync {
    /// The signer whose public key equals `public_key`, if any.
    fn get_signer(&self, public_key: &PublicKey) -> Option<Arc<dyn TransactionSigner>>;

    /// Owned snapshot of every identity this provider can sign for.
    fn available_public_keys(&self) -> HashSet<PublicKey>;

    /// Release backend connections. Idempotent; lookups keep working.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}
