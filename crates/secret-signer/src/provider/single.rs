use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::SignerProvider;
use crate::signing::{PublicKey, TransactionSigner};

/// Serves exactly one signer.
pub struct SingleSignerProvider {
    signer: Arc<dyn TransactionSigner>,
}

impl SingleSignerProvider {
    pub fn new(signer: Arc<dyn TransactionSigner>) -> Self {
        Self { signer }
    }
}

impl SignerProvider for SingleSignerProvider {
    fn get_signer(&self, public_key: &PublicKey) -> Option<Arc<dyn TransactionSigner>> {
        let own = self.signer.public_key()?;
        (own == *public_key).then(|| self.signer.clone())
    }

    fn available_public_keys(&self) -> HashSet<PublicKey> {
        self.signer.public_key().into_iter().collect()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        futures::future::ready(()).boxed()
    }
}
