//! Password-encrypted key files.
//!
//! A key file is a small JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "kdf": { "algorithm": "pbkdf2-hmac-sha256", "iterations": 600000, "salt": "…" },
//!   "nonce": "…",
//!   "ciphertext": "…"
//! }
//! ```
//!
//! The AES-256-GCM key is derived from the password with PBKDF2-HMAC-SHA256.
//! Binary fields are hex. The plaintext is the raw 32-byte scalar.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::KeyMaterialError;
use crate::secret::SecretBytes;

pub const KEY_FILE_VERSION: u32 = 1;
pub const DEFAULT_ITERATIONS: u32 = 600_000;
const KDF_ALGORITHM: &str = "pbkdf2-hmac-sha256";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const MIN_ITERATIONS: u32 = 1_000;

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    version: u32,
    kdf: KdfParams,
    nonce: String,
    ciphertext: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct KdfParams {
    algorithm: String,
    iterations: u32,
    salt: String,
}

/// Encrypt `secret` under `password`, returning the JSON key file.
pub fn encrypt(secret: &[u8], password: &[u8]) -> Result<String, KeyMaterialError> {
    encrypt_with_iterations(secret, password, DEFAULT_ITERATIONS)
}

pub fn encrypt_with_iterations(
    secret: &[u8],
    password: &[u8],
    iterations: u32,
) -> Result<String, KeyMaterialError> {
    if iterations < MIN_ITERATIONS {
        return Err(KeyMaterialError::MalformedKeyFile(format!(
            "iteration count {iterations} is below {MIN_ITERATIONS}"
        )));
    }

    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|_| KeyMaterialError::MalformedKeyFile("bad derived key length".into()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), secret)
        .map_err(|_| KeyMaterialError::MalformedKeyFile("encryption failed".into()))?;

    let file = EncryptedKeyFile {
        version: KEY_FILE_VERSION,
        kdf: KdfParams {
            algorithm: KDF_ALGORITHM.to_string(),
            iterations,
            salt: hex::encode(salt),
        },
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    };
    serde_json::to_string_pretty(&file)
        .map_err(|e| KeyMaterialError::MalformedKeyFile(e.to_string()))
}

/// Decrypt a JSON key file.
///
/// A wrong password and a tampered ciphertext are indistinguishable and both
/// yield [`KeyMaterialError::Undecryptable`].
pub fn decrypt(contents: &[u8], password: &[u8]) -> Result<SecretBytes, KeyMaterialError> {
    let file: EncryptedKeyFile = serde_json::from_slice(contents)
        .map_err(|e| KeyMaterialError::MalformedKeyFile(e.to_string()))?;
    if file.version != KEY_FILE_VERSION {
        return Err(KeyMaterialError::MalformedKeyFile(format!(
            "unsupported version {}",
            file.version
        )));
    }
    if file.kdf.algorithm != KDF_ALGORITHM {
        return Err(KeyMaterialError::MalformedKeyFile(format!(
            "unsupported kdf {}",
            file.kdf.algorithm
        )));
    }
    if file.kdf.iterations < MIN_ITERATIONS {
        return Err(KeyMaterialError::MalformedKeyFile(format!(
            "iteration count {} is below {MIN_ITERATIONS}",
            file.kdf.iterations
        )));
    }

    let salt = decode_field("salt", &file.kdf.salt)?;
    let nonce = decode_field("nonce", &file.nonce)?;
    let ciphertext = decode_field("ciphertext", &file.ciphertext)?;
    if nonce.len() != NONCE_LEN {
        return Err(KeyMaterialError::MalformedKeyFile("nonce must be 12 bytes".into()));
    }

    let key = derive_key(password, &salt, file.kdf.iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|_| KeyMaterialError::Undecryptable)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| KeyMaterialError::Undecryptable)?;
    Ok(SecretBytes::from(Zeroizing::new(plaintext)))
}

fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, key.as_mut_slice());
    key
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, KeyMaterialError> {
    hex::decode(value).map_err(|_| KeyMaterialError::MalformedKeyFile(format!("{name} is not hex")))
}
