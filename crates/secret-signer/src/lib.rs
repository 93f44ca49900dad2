pub mod config;
pub mod connection;
pub mod error;
pub mod provider;
pub mod secret;
pub mod signing;
pub mod source;

pub use config::KeySourceDescriptor;
pub use connection::{ConnectionParameters, Timeout, TlsOptions, TrustMode};
pub use error::{ConfigurationError, Error, KeyMaterialError, Result, SigningError};
pub use provider::{
    DirectorySignerProvider, LoadOptions, LoadOutcome, LoadPolicy, LoadStatus, SignerProvider,
    SingleSignerProvider,
};
pub use secret::{SecretBytes, SecretRef};
pub use signing::{PublicKey, Secp256k1Signer, Signature, SignerFactory, TransactionSigner};
pub use source::{KeySource, SecretSource, SourcedKey};
