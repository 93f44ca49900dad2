use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use alloy_primitives::{Address, keccak256};
use k256::ecdsa::{VerifyingKey, signature::hazmat::PrehashVerifier};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Signature;
use crate::error::KeyMaterialError;

/// A secp256k1 public key: the identity of a signer.
///
/// Equality, ordering and hashing are defined by the affine coordinates.
/// Displays as `0x` followed by the 64-byte `x ‖ y` encoding in hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(k256::PublicKey);

impl PublicKey {
    /// Parse a SEC1 encoding (33-byte compressed or 65-byte uncompressed).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, KeyMaterialError> {
        k256::PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| KeyMaterialError::InvalidPublicKey)
    }

    /// 64-byte `x ‖ y` encoding.
    pub fn to_bytes(&self) -> [u8; 64] {
        let point = self.0.to_encoded_point(false);
        let mut out = [0u8; 64];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    /// 33-byte SEC1 compressed encoding.
    pub fn to_compressed(&self) -> [u8; 33] {
        let point = self.0.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Last 20 bytes of `keccak256(x ‖ y)`.
    pub fn ethereum_address(&self) -> Address {
        let hash = keccak256(self.to_bytes());
        Address::from_slice(&hash[12..])
    }

    /// Check `signature` over the Keccak-256 digest of `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verify_prehash(&keccak256(message).0, signature)
    }

    pub fn verify_prehash(&self, digest: &[u8; 32], signature: &Signature) -> bool {
        VerifyingKey::from(&self.0)
            .verify_prehash(digest, signature.as_ecdsa())
            .is_ok()
    }
}

impl From<&VerifyingKey> for PublicKey {
    fn from(key: &VerifyingKey) -> Self {
        Self(k256::PublicKey::from(key))
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = KeyMaterialError;

    /// Accepts the `x ‖ y` display form as well as hex SEC1 encodings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| KeyMaterialError::InvalidPublicKey)?;
        if bytes.len() == 64 {
            let mut sec1 = Vec::with_capacity(65);
            sec1.push(0x04);
            sec1.extend_from_slice(&bytes);
            return Self::from_sec1_bytes(&sec1);
        }
        Self::from_sec1_bytes(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
