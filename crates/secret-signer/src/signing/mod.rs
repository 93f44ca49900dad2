mod public_key;
mod secp256k1;
mod signature;
mod signer;

pub use public_key::PublicKey;
pub use secp256k1::{MAX_NONCE_ATTEMPTS, Secp256k1Signer, SignerFactory};
pub use signature::Signature;
pub use signer::TransactionSigner;
