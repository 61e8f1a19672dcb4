//! Node identity keys.
//!
//! Every participant in the overlay is addressed by an Ed25519 public key.
//! The matching secret key never leaves the node; it signs connection
//! handshakes so that peers can check who they are talking to.
//!
//! Keys travel as lowercase hex in configuration files and in the textual
//! address form (see [`crate::addr`]).

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::KeyError;

/// Length of an encoded public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of an encoded secret key in bytes.
pub const SECRET_KEY_LEN: usize = 32;
/// Length of a detached signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Public identity of a network participant.
///
/// Newtype over the compressed Ed25519 point so that comparison, hashing and
/// copying stay trivial. Construction always validates the point, so any
/// `PublicKey` in hand can verify signatures.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Builds a key from raw bytes, rejecting bytes that are not a curve point.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Result<Self, KeyError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPoint)?;
        Ok(Self(bytes))
    }

    /// Decodes the hex text form.
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let raw = hex::decode(text)?;
        let bytes: [u8; PUBLIC_KEY_LEN] =
            raw.as_slice().try_into().map_err(|_| KeyError::Length {
                expected: PUBLIC_KEY_LEN,
                actual: raw.len(),
            })?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Checks a detached signature made by the matching secret key.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> Result<(), KeyError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidPoint)?;
        key.verify_strict(message, &Signature::from_bytes(signature))
            .map_err(|_| KeyError::BadSignature)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Secret half of a node identity.
///
/// Debug output is redacted and the key material is wiped on drop.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Generates a fresh key from the OS random source.
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut OsRng))
    }

    pub fn from_bytes(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        Self(SigningKey::from_bytes(&bytes))
    }

    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let raw = hex::decode(text)?;
        let bytes: [u8; SECRET_KEY_LEN] =
            raw.as_slice().try_into().map_err(|_| KeyError::Length {
                expected: SECRET_KEY_LEN,
                actual: raw.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    /// Derives the public key.
    pub fn public_key(&self) -> PublicKey {
        // A verifying key derived from a signing key is always a valid point.
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.0.sign(message).to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl Serialize for SecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Local identity: a public key and the secret key it was derived from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "KeyPairRepr")]
pub struct KeyPair {
    public_key: PublicKey,
    secret_key: SecretKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret(secret_key: SecretKey) -> Self {
        Self {
            public_key: secret_key.public_key(),
            secret_key,
        }
    }

    /// Pairs two halves loaded separately, checking that they belong together.
    pub fn from_parts(public_key: PublicKey, secret_key: SecretKey) -> Result<Self, KeyError> {
        if secret_key.public_key() != public_key {
            return Err(KeyError::Mismatch);
        }
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

#[derive(Deserialize)]
struct KeyPairRepr {
    public_key: PublicKey,
    secret_key: SecretKey,
}

impl TryFrom<KeyPairRepr> for KeyPair {
    type Error = KeyError;

    fn try_from(repr: KeyPairRepr) -> Result<Self, Self::Error> {
        Self::from_parts(repr.public_key, repr.secret_key)
    }
}
