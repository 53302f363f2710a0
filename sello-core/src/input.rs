//! Reading the files a sealing run consumes.
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Which input of a sealing run a file stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    PrivateKey,
    Certificate,
    Document,
    OriginalString,
    Config,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::PrivateKey => "private key",
            InputKind::Certificate => "certificate",
            InputKind::Document => "XML document",
            InputKind::OriginalString => "original string",
            InputKind::Config => "seal config",
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to read an input file.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("{kind} file not found: '{path}'")]
    NotFound { kind: InputKind, path: PathBuf },

    #[error("failed to read {kind} file '{path}': {source}")]
    Read {
        kind: InputKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InputError {
    pub fn kind(&self) -> InputKind {
        match self {
            InputError::NotFound { kind, .. } | InputError::Read { kind, .. } => *kind,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            InputError::NotFound { path, .. } | InputError::Read { path, .. } => path,
        }
    }
}

/// Read a whole input file, telling a missing file apart from other I/O failures.
pub fn read_input(kind: InputKind, path: &Path) -> Result<Vec<u8>, InputError> {
    std::fs::read(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => InputError::NotFound {
            kind,
            path: path.to_path_buf(),
        },
        _ => InputError::Read {
            kind,
            path: path.to_path_buf(),
            source,
        },
    })
}
