//! Seal (Sello) stamping for CFDI tax invoices.
//!
//! Loads a CSD (DER private key and certificate), signs the invoice's original string with
//! RSASSA-PKCS1-v1_5/SHA-256 and writes the base64 signature into the `Sello` attribute of the
//! document's root element, leaving the rest of the document byte-for-byte intact.
//!
//! # Examples
//! ```rust,no_run
//! use sello_core::config::SealConfig;
//! use sello_core::original::OriginalStringFile;
//! use sello_core::pipeline::seal_files;
//!
//! let config = SealConfig::new("CSD_Prueba.key", "CSD_Prueba.cer", "cfdi.xml")
//!     .with_password("12345678a");
//! let outcome = seal_files(&config, &OriginalStringFile::new("cadena_original.txt"))?;
//! println!("{}", outcome.seal());
//! # Ok::<(), sello_core::Error>(())
//! ```
pub mod config;
pub mod document;
pub mod input;
pub mod keystore;
pub mod original;
pub mod pipeline;
pub mod seal;

use std::path::PathBuf;
use thiserror::Error;

pub use document::{Document, Sealed, Unsealed};
pub use original::{CanonicalString, OriginalString};
pub use pipeline::{SealOutcome, Sealer, seal_files};
pub use seal::{EncodedSignature, Signature};

/// Top-level error wrapper; each variant names the stage that failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Input(#[from] input::InputError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Key(#[from] keystore::KeyError),
    #[error(transparent)]
    Certificate(#[from] keystore::CertificateError),
    #[error(transparent)]
    OriginalString(#[from] original::OriginalStringError),
    #[error(transparent)]
    Signing(#[from] seal::SigningError),
    #[error(transparent)]
    Document(#[from] document::DocumentError),
    #[error("output path '{path}' is the input document; refusing to overwrite it")]
    OutputOverwritesInput { path: PathBuf },
}

impl Error {
    /// Pipeline stage the error comes from.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Input(e) => e.kind().as_str(),
            Error::Config(_) => "config",
            Error::Key(_) => "private key",
            Error::Certificate(_) => "certificate",
            Error::OriginalString(_) => "original string",
            Error::Signing(_) => "signing",
            Error::Document(_) | Error::OutputOverwritesInput { .. } => "XML document",
        }
    }
}
