//! Sealing a document end to end: key and certificate, original string, signature, embedding.
use crate::Error;
use crate::config::SealConfig;
use crate::document::{Document, Sealed, Unsealed};
use crate::input::{InputKind, read_input};
use crate::keystore::{Certificate, PrivateKey, load_certificate, load_private_key};
use crate::original::{CanonicalString, OriginalString};
use crate::seal::{EncodedSignature, encode, sign};
use std::path::Path;

/// A loaded CSD, ready to seal any number of documents.
///
/// Read-only after construction; share it across threads to seal documents in parallel.
#[derive(Debug)]
pub struct Sealer {
    key: PrivateKey,
    certificate: Certificate,
}

/// Everything a sealing run produced.
#[derive(Debug, Clone)]
pub struct SealOutcome {
    document: Document<Sealed>,
    original_string: CanonicalString,
    seal: EncodedSignature,
}

impl SealOutcome {
    pub fn document(&self) -> &Document<Sealed> {
        &self.document
    }

    pub fn original_string(&self) -> &CanonicalString {
        &self.original_string
    }

    pub fn seal(&self) -> &EncodedSignature {
        &self.seal
    }

    pub fn into_document(self) -> Document<Sealed> {
        self.document
    }
}

impl Sealer {
    pub fn new(key: PrivateKey, certificate: Certificate) -> Self {
        if !certificate.matches_key(&key) {
            tracing::warn!(
                serial = %certificate.serial_number_hex(),
                "certificate public key does not match the sealing key"
            );
        }
        Self { key, certificate }
    }

    /// Load the CSD from DER bytes.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use sello_core::original::FixedOriginalString;
    /// use sello_core::pipeline::Sealer;
    ///
    /// let sealer = Sealer::from_der(
    ///     &std::fs::read("CSD_Prueba.key")?,
    ///     "12345678a",
    ///     &std::fs::read("CSD_Prueba.cer")?,
    /// )?;
    /// let outcome = sealer.seal_bytes(
    ///     &std::fs::read("cfdi.xml")?,
    ///     &FixedOriginalString::new("||4.0|A|12345|...||"),
    /// )?;
    /// outcome.document().save("cfdi_sellado.xml".as_ref())?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_der(key_der: &[u8], password: &str, cert_der: &[u8]) -> Result<Self, Error> {
        let key = load_private_key(key_der, password)?;
        let certificate = load_certificate(cert_der)?;
        Ok(Self::new(key, certificate))
    }

    pub fn from_files(key_path: &Path, password: &str, cert_path: &Path) -> Result<Self, Error> {
        let key = load_private_key(&read_input(InputKind::PrivateKey, key_path)?, password)?;
        let certificate = load_certificate(&read_input(InputKind::Certificate, cert_path)?)?;
        tracing::debug!(
            key = %key_path.display(),
            certificate = %cert_path.display(),
            "loaded CSD"
        );
        Ok(Self::new(key, certificate))
    }

    pub fn from_config(config: &SealConfig) -> Result<Self, Error> {
        Self::from_files(
            config.key_path(),
            config.password(),
            config.certificate_path(),
        )
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Original string, signature, encoding and embedding, in that order. Stops at the first
    /// failure.
    pub fn seal_document(
        &self,
        document: Document<Unsealed>,
        source: &dyn OriginalString,
    ) -> Result<SealOutcome, Error> {
        let original_string = source.original_string(&document)?;
        let signature = sign(&self.key, &original_string)?;
        let seal = encode(&signature);
        if let Some(prior) = document.prior_sello() {
            tracing::debug!(prior_len = prior.len(), "replacing existing Sello");
        }
        let document = document.embed_seal(&seal);
        Ok(SealOutcome {
            document,
            original_string,
            seal,
        })
    }

    pub fn seal_bytes(
        &self,
        xml: &[u8],
        source: &dyn OriginalString,
    ) -> Result<SealOutcome, Error> {
        self.seal_document(Document::parse(xml)?, source)
    }
}

/// Seal the document named by `config` and write the result to its output path.
///
/// Nothing is written unless every stage succeeds, and the input document is never overwritten.
#[tracing::instrument(skip_all, fields(document = %config.document_path().display()))]
pub fn seal_files(config: &SealConfig, source: &dyn OriginalString) -> Result<SealOutcome, Error> {
    let output = config.output_path();
    if same_file(config.document_path(), &output) {
        return Err(Error::OutputOverwritesInput { path: output });
    }

    let sealer = Sealer::from_config(config)?;
    let xml = read_input(InputKind::Document, config.document_path())?;
    let outcome = sealer.seal_bytes(&xml, source)?;
    outcome.document().save(&output)?;

    let certificate_number = sealer.certificate().certificate_number().unwrap_or_default();
    tracing::info!(
        output = %output.display(),
        certificate = %certificate_number,
        "document sealed"
    );
    Ok(outcome)
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
