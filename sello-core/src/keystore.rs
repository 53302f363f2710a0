//! Loading the CSD (Certificado de Sello Digital): the private key and its certificate.
use base64ct::{Base64, Encoding};
use pkcs8::{EncryptedPrivateKeyInfo, PrivateKeyInfo};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use x509_cert::der::{Decode, Encode};

/// Errors raised while loading a private key container.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid private key container: {reason}")]
    Format { reason: String },

    #[error("private key password is incorrect")]
    Authentication,
}

/// Errors raised while loading a certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid DER certificate: {reason}")]
    Format { reason: String },
}

/// RSA private key used to produce the seal.
///
/// Read-only after loading, so one key can back any number of concurrent signing runs.
pub struct PrivateKey {
    inner: RsaPrivateKey,
    signing_key: SigningKey<Sha256>,
}

impl PrivateKey {
    fn new(inner: RsaPrivateKey) -> Self {
        let signing_key = SigningKey::<Sha256>::new(inner.clone());
        Self { inner, signing_key }
    }

    /// Modulus length in bytes, which is also the length of every signature.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.inner.to_public_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey<Sha256> {
        &self.signing_key
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bits", &(self.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Load a DER private key, decrypting it with `password` when the container is encrypted.
///
/// Accepted containers are PKCS#8 `EncryptedPrivateKeyInfo` (the format of SAT `.key` files),
/// plain PKCS#8 `PrivateKeyInfo` and PKCS#1 `RSAPrivateKey`. The password is ignored for the
/// unencrypted forms.
///
/// # Examples
/// ```rust,no_run
/// use sello_core::keystore::load_private_key;
///
/// let der = std::fs::read("CSD_Prueba.key")?;
/// let key = load_private_key(&der, "12345678a")?;
/// assert_eq!(key.size(), 256);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn load_private_key(bytes: &[u8], password: &str) -> Result<PrivateKey, KeyError> {
    if let Ok(encrypted) = EncryptedPrivateKeyInfo::try_from(bytes) {
        let document = encrypted.decrypt(password).map_err(decrypt_error)?;
        let info = PrivateKeyInfo::try_from(document.as_bytes())
            .map_err(|_| KeyError::Authentication)?;
        tracing::debug!("decrypted PKCS#8 private key container");
        return rsa_from_pkcs8(info);
    }

    if let Ok(info) = PrivateKeyInfo::try_from(bytes) {
        tracing::debug!("loaded unencrypted PKCS#8 private key");
        return rsa_from_pkcs8(info);
    }

    let inner = RsaPrivateKey::from_pkcs1_der(bytes).map_err(|e| KeyError::Format {
        reason: format!("not a PKCS#8 or PKCS#1 DER private key ({e})"),
    })?;
    tracing::debug!("loaded PKCS#1 private key");
    Ok(PrivateKey::new(inner))
}

/// Classify a failure to decrypt an `EncryptedPrivateKeyInfo` that parsed.
///
/// With a wrong password CBC unpadding fails (reported by pkcs5 as `EncryptFailed`), or the
/// padding happens to be valid and the plaintext is not DER (`Asn1`).
fn decrypt_error(error: pkcs8::Error) -> KeyError {
    use pkcs8::pkcs5;

    match error {
        pkcs8::Error::EncryptedPrivateKey(pkcs5::Error::DecryptFailed | pkcs5::Error::EncryptFailed)
        | pkcs8::Error::Asn1(_) => KeyError::Authentication,
        other => KeyError::Format {
            reason: format!("cannot decrypt container: {other}"),
        },
    }
}

fn rsa_from_pkcs8(info: PrivateKeyInfo<'_>) -> Result<PrivateKey, KeyError> {
    let oid = info.algorithm.oid;
    if oid != rsa::pkcs1::ALGORITHM_OID {
        return Err(KeyError::Format {
            reason: format!("unsupported key algorithm {oid}, expected RSA"),
        });
    }
    let inner = RsaPrivateKey::try_from(info).map_err(|e| KeyError::Format {
        reason: format!("malformed RSA key: {e}"),
    })?;
    Ok(PrivateKey::new(inner))
}

/// X.509 certificate matching the sealing key.
///
/// Loaded alongside the key but not embedded into the document; the accessors expose the values
/// a CFDI usually carries next to the seal (`NoCertificado`, `Certificado`).
#[derive(Clone)]
pub struct Certificate {
    inner: x509_cert::Certificate,
    der: Vec<u8>,
}

/// Printable summary of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSummary {
    pub certificate_number: Option<String>,
    pub serial_number: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
}

impl Certificate {
    /// Serial number as upper-case hexadecimal.
    pub fn serial_number_hex(&self) -> String {
        self.serial_bytes()
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect()
    }

    /// The SAT certificate number (`NoCertificado`).
    ///
    /// SAT encodes the 20-digit number as the ASCII bytes of the serial; `None` when the serial
    /// is not made of ASCII digits.
    pub fn certificate_number(&self) -> Option<String> {
        let bytes = self.serial_bytes();
        if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        String::from_utf8(bytes.to_vec()).ok()
    }

    /// Base64 of the DER encoding.
    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.der)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> String {
        self.inner.tbs_certificate.subject.to_string()
    }

    pub fn issuer(&self) -> String {
        self.inner.tbs_certificate.issuer.to_string()
    }

    /// RSA public key from the certificate, when it carries one.
    pub fn public_key(&self) -> Result<RsaPublicKey, CertificateError> {
        let spki = self
            .inner
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| CertificateError::Format {
                reason: format!("cannot encode subject public key info: {e}"),
            })?;
        RsaPublicKey::from_public_key_der(&spki).map_err(|e| CertificateError::Format {
            reason: format!("certificate does not carry an RSA public key: {e}"),
        })
    }

    /// Whether the certificate was issued for `key`.
    pub fn matches_key(&self, key: &PrivateKey) -> bool {
        self.public_key()
            .map(|public| public == key.public_key())
            .unwrap_or(false)
    }

    pub fn summary(&self) -> CertificateSummary {
        let validity = &self.inner.tbs_certificate.validity;
        CertificateSummary {
            certificate_number: self.certificate_number(),
            serial_number: self.serial_number_hex(),
            subject: self.subject(),
            issuer: self.issuer(),
            not_before: validity.not_before.to_date_time().to_string(),
            not_after: validity.not_after.to_date_time().to_string(),
        }
    }

    fn serial_bytes(&self) -> &[u8] {
        let bytes = self.inner.tbs_certificate.serial_number.as_bytes();
        // DER prepends a zero byte to keep the integer positive.
        match bytes {
            [0, rest @ ..] if !rest.is_empty() => rest,
            _ => bytes,
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("serial", &self.serial_number_hex())
            .field("subject", &self.subject())
            .finish()
    }
}

/// Load a DER X.509 certificate. Validity, chain and revocation are not checked.
pub fn load_certificate(bytes: &[u8]) -> Result<Certificate, CertificateError> {
    let inner = x509_cert::Certificate::from_der(bytes).map_err(|e| CertificateError::Format {
        reason: e.to_string(),
    })?;
    Ok(Certificate {
        inner,
        der: bytes.to_vec(),
    })
}
