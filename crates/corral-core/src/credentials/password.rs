//! Salted password hashes.
//!
//! Agent and local-user secrets are stored as `SHA-256(salt || secret)`
//! alongside the salt. The text form used by configuration files and the
//! store is `<salt-hex>:<digest-hex>`.
//!
//! # Security Considerations
//!
//! - Digest comparison is constant time (`subtle`), so response timing does
//!   not reveal how many leading bytes matched.
//! - The plaintext secret is only ever held in a [`SecretString`].

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of freshly generated salts.
pub const SALT_LEN: usize = 16;

/// Errors from parsing a stored hash.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretHashError {
    /// The text form lacks the `salt:digest` separator.
    #[error("secret hash must have the form <salt-hex>:<digest-hex>")]
    MissingSeparator,

    /// One of the halves is not valid hex.
    #[error("secret hash is not valid hex: {0}")]
    Hex(String),

    /// The digest is not 32 bytes.
    #[error("secret hash digest must be 32 bytes, got {0}")]
    DigestLength(usize),
}

/// A salted SHA-256 digest of a secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretHash {
    salt: Vec<u8>,
    digest: [u8; 32],
}

impl SecretHash {
    /// Hashes `secret` under a fresh random salt.
    #[must_use]
    pub fn generate(secret: &SecretString) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(salt, secret)
    }

    /// Hashes `secret` under the given salt.
    #[must_use]
    pub fn with_salt(salt: Vec<u8>, secret: &SecretString) -> Self {
        let digest = digest(&salt, secret.expose_secret());
        Self { salt, digest }
    }

    /// Returns `true` if `candidate` hashes to this digest.
    #[must_use]
    pub fn verify(&self, candidate: &SecretString) -> bool {
        let computed = digest(&self.salt, candidate.expose_secret());
        computed.ct_eq(&self.digest).into()
    }

    /// Returns the `salt:digest` text form.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}:{}", hex::encode(&self.salt), hex::encode(self.digest))
    }
}

fn digest(salt: &[u8], secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretHash")
            .field("salt", &hex::encode(&self.salt))
            .finish_non_exhaustive()
    }
}

impl FromStr for SecretHash {
    type Err = SecretHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (salt_hex, digest_hex) = s.split_once(':').ok_or(SecretHashError::MissingSeparator)?;
        let salt = hex::decode(salt_hex).map_err(|e| SecretHashError::Hex(e.to_string()))?;
        let raw = hex::decode(digest_hex).map_err(|e| SecretHashError::Hex(e.to_string()))?;
        let digest: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SecretHashError::DigestLength(raw.len()))?;
        Ok(Self { salt, digest })
    }
}

impl Serialize for SecretHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for SecretHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
