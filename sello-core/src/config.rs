//! Configuration of a sealing run.
use crate::input::{InputError, InputKind, read_input};
use crate::original::OriginalStringFile;
use java_properties::read;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const KEY_PATH: &str = "sello.key.path";
pub const KEY_PASSWORD: &str = "sello.key.password";
pub const CERTIFICATE_PATH: &str = "sello.certificate.path";
pub const DOCUMENT_PATH: &str = "sello.document.path";
pub const OUTPUT_PATH: &str = "sello.output.path";
pub const ORIGINAL_STRING_PATH: &str = "sello.original.string.path";

/// Errors raised while loading a seal config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("failed to parse seal properties from '{path}': {source}")]
    PropertiesRead {
        path: PathBuf,
        #[source]
        source: java_properties::PropertiesError,
    },

    #[error("missing required seal property '{key}' in file '{path}'")]
    MissingProperty { path: PathBuf, key: String },
}

/// Inputs and output of a sealing run.
///
/// # Examples
/// ```rust
/// use sello_core::config::SealConfig;
///
/// let config = SealConfig::new("CSD.key", "CSD.cer", "cfdi.xml").with_password("12345678a");
/// assert_eq!(config.output_path(), std::path::Path::new("cfdi_sellado.xml"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct SealConfig {
    key_path: PathBuf,
    password: String,
    certificate_path: PathBuf,
    document_path: PathBuf,
    output_path: Option<PathBuf>,
    original_string_path: Option<PathBuf>,
}

impl SealConfig {
    pub fn new(
        key_path: impl Into<PathBuf>,
        certificate_path: impl Into<PathBuf>,
        document_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key_path: key_path.into(),
            password: String::new(),
            certificate_path: certificate_path.into(),
            document_path: document_path.into(),
            output_path: None,
            original_string_path: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_original_string_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.original_string_path = Some(path.into());
        self
    }

    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = path.into();
        self
    }

    pub fn with_certificate_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_path = path.into();
        self
    }

    pub fn with_document_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.document_path = path.into();
        self
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    /// Where the sealed document goes; defaults to `<stem>_sellado.xml` beside the input.
    pub fn output_path(&self) -> PathBuf {
        if let Some(path) = &self.output_path {
            return path.clone();
        }
        let stem = self
            .document_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cfdi".to_string());
        self.document_path.with_file_name(format!("{stem}_sellado.xml"))
    }

    pub fn original_string_path(&self) -> Option<&Path> {
        self.original_string_path.as_deref()
    }

    /// Original string source configured through `sello.original.string.path`.
    pub fn original_string_file(&self) -> Option<OriginalStringFile> {
        self.original_string_path.as_ref().map(OriginalStringFile::new)
    }

    /// Load a `.properties` seal config. Relative paths resolve against the file's directory.
    ///
    /// ```text
    /// sello.key.path=CSD_Prueba.key
    /// sello.key.password=12345678a
    /// sello.certificate.path=CSD_Prueba.cer
    /// sello.document.path=cfdi.xml
    /// sello.output.path=cfdi_sellado.xml
    /// sello.original.string.path=cadena_original.txt
    /// ```
    pub fn from_properties_file(path: &Path) -> Result<SealConfig, ConfigError> {
        let pathbuf = path.to_path_buf();
        let bytes = read_input(InputKind::Config, path)?;
        let props = read(bytes.as_slice()).map_err(|e| ConfigError::PropertiesRead {
            path: pathbuf.clone(),
            source: e,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let resolve = |value: &str| base.join(value.trim());
        let req = |key: &str| -> Result<PathBuf, ConfigError> {
            props
                .get(key)
                .filter(|value| !value.trim().is_empty())
                .map(|value| resolve(value))
                .ok_or_else(|| ConfigError::MissingProperty {
                    path: pathbuf.clone(),
                    key: key.to_string(),
                })
        };
        let opt = |key: &str| {
            props
                .get(key)
                .filter(|value| !value.trim().is_empty())
                .map(|value| resolve(value))
        };

        Ok(SealConfig {
            key_path: req(KEY_PATH)?,
            password: props.get(KEY_PASSWORD).cloned().unwrap_or_default(),
            certificate_path: req(CERTIFICATE_PATH)?,
            document_path: req(DOCUMENT_PATH)?,
            output_path: opt(OUTPUT_PATH),
            original_string_path: opt(ORIGINAL_STRING_PATH),
        })
    }
}

impl fmt::Debug for SealConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealConfig")
            .field("key_path", &self.key_path)
            .field("password", &"<redacted>")
            .field("certificate_path", &self.certificate_path)
            .field("document_path", &self.document_path)
            .field("output_path", &self.output_path)
            .field("original_string_path", &self.original_string_path)
            .finish()
    }
}
