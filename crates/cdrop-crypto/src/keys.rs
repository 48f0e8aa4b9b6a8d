//! Hex-encoded secp256k1 key material
//!
//! Public keys are SEC1 points (uncompressed is the exchange format,
//! compressed is accepted). Private keys are big-endian scalars; shortened
//! encodings (leading zeros dropped, odd digit count) and a leading sign byte
//! are normalised to 32 bytes.

use cdrop_core::{CryptoError, SecretHex};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::PRIVATE_KEY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Public,
    Private,
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyKind::Public => f.write_str("public"),
            KeyKind::Private => f.write_str("private"),
        }
    }
}

/// A recipient public key on secp256k1.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: k256::PublicKey,
}

impl PublicKey {
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let bytes = decode_hex(text, KeyKind::Public)?;
        Self::from_sec1_bytes(&bytes)
    }

    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        k256::PublicKey::from_sec1_bytes(bytes)
            .map(|inner| Self { inner })
            .map_err(|_| {
                CryptoError::InvalidKey(format!(
                    "public key is not a secp256k1 point ({} bytes)",
                    bytes.len()
                ))
            })
    }

    /// Uncompressed SEC1 encoding (65 bytes)
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.inner.to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_sec1_bytes())
    }

    pub(crate) fn as_inner(&self) -> &k256::PublicKey {
        &self.inner
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

/// A private key on secp256k1. The scalar is zeroized on drop.
pub struct PrivateKey {
    inner: k256::SecretKey,
}

impl PrivateKey {
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let trimmed = strip_prefix(text.trim());
        // Integer encodings may drop a leading zero nibble
        let padded = if trimmed.len() % 2 == 1 {
            Zeroizing::new(format!("0{trimmed}"))
        } else {
            Zeroizing::new(trimmed.to_string())
        };
        let raw = decode_hex(&padded, KeyKind::Private)?;
        let scalar = normalize_scalar(&raw)?;

        k256::SecretKey::from_bytes(k256::FieldBytes::from_slice(scalar.as_slice()))
            .map(|inner| Self { inner })
            .map_err(|_| {
                CryptoError::InvalidKey("private key is zero or not below the curve order".into())
            })
    }

    pub fn from_secret_hex(secret: &SecretHex) -> Result<Self, CryptoError> {
        Self::from_hex(secret.expose())
    }

    /// A fresh random key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            inner: k256::SecretKey::random(&mut OsRng),
        }
    }

    /// 64-char big-endian hex of the scalar.
    pub fn to_secret_hex(&self) -> SecretHex {
        let bytes = Zeroizing::new(self.inner.to_bytes().to_vec());
        SecretHex::new(hex::encode(bytes.as_slice()))
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.public_key(),
        }
    }

    pub(crate) fn as_inner(&self) -> &k256::SecretKey {
        &self.inner
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("scalar", &"[REDACTED]")
            .finish()
    }
}

fn strip_prefix(text: &str) -> &str {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text)
}

fn decode_hex(text: &str, kind: KeyKind) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let text = strip_prefix(text.trim());
    if text.is_empty() {
        return Err(CryptoError::InvalidKey(format!("{kind} key is empty")));
    }
    hex::decode(text)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::InvalidKey(format!("{kind} key is not valid hex: {e}")))
}

/// Left-pad short scalars and drop leading zero bytes beyond 32.
fn normalize_scalar(raw: &[u8]) -> Result<Zeroizing<[u8; PRIVATE_KEY_SIZE]>, CryptoError> {
    let significant = match raw.iter().position(|b| *b != 0) {
        Some(first) => &raw[first..],
        None => return Err(CryptoError::InvalidKey("private key is zero".into())),
    };
    if significant.len() > PRIVATE_KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "private key is {} bytes (maximum {PRIVATE_KEY_SIZE})",
            significant.len()
        )));
    }

    let mut out = Zeroizing::new([0u8; PRIVATE_KEY_SIZE]);
    out[PRIVATE_KEY_SIZE - significant.len()..].copy_from_slice(significant);
    Ok(out)
}
