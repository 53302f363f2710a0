//! Producing the seal: RSASSA-PKCS1-v1_5 over SHA-256 of the original string, base64 encoded.
use crate::keystore::PrivateKey;
use crate::original::CanonicalString;
use base64ct::{Base64, Encoding};
use rsa::signature::{SignatureEncoding, Signer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("RSA signing failed: {0}")]
    Rsa(String),

    #[error("seal is not valid base64: {0}")]
    Encoding(String),
}

/// Raw signature bytes; as long as the key modulus (256 bytes for RSA-2048).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn encode(&self) -> EncodedSignature {
        encode(self)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// Base64 text of a [`Signature`]: the value of the `Sello` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedSignature(String);

impl EncodedSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn decode(&self) -> Result<Signature, SigningError> {
        Base64::decode_vec(&self.0)
            .map(Signature)
            .map_err(|e| SigningError::Encoding(e.to_string()))
    }
}

impl FromStr for EncodedSignature {
    type Err = SigningError;

    /// Accepts canonical, padded standard base64 only.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = Base64::decode_vec(s).map_err(|e| SigningError::Encoding(e.to_string()))?;
        Ok(encode(&Signature(bytes)))
    }
}

impl fmt::Display for EncodedSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sign the exact bytes of `message` with PKCS#1 v1.5 padding and a SHA-256 digest.
///
/// Deterministic: the same key and message always give the same signature. An empty message is
/// signed like any other.
pub fn sign(key: &PrivateKey, message: &CanonicalString) -> Result<Signature, SigningError> {
    tracing::debug!(
        message_len = message.len(),
        key_bits = key.size() * 8,
        "signing original string"
    );
    let signature: rsa::pkcs1v15::Signature = key
        .signing_key()
        .try_sign(message.as_bytes())
        .map_err(|e| SigningError::Rsa(e.to_string()))?;
    Ok(Signature(signature.to_vec()))
}

/// Standard-alphabet, padded base64 on a single line.
pub fn encode(signature: &Signature) -> EncodedSignature {
    EncodedSignature(Base64::encode_string(&signature.0))
}
