//! The original string (cadena original) that gets signed, and where it comes from.
//!
//! Computing the string is the job of the SAT XSLT transform, which lives outside this crate.
//! [`OriginalString`] is the seam: sealing asks it for the string of a document and signs the
//! exact bytes it returns.
use crate::document::{Document, Unsealed};
use crate::input::{InputError, InputKind, read_input};
use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Errors produced while obtaining an original string.
#[derive(Debug, Error)]
pub enum OriginalStringError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("original string is not valid UTF-8")]
    InvalidUtf8,

    #[error("failed to run original string transform '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("original string transform '{program}' failed ({status}): {stderr}")]
    Transform {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Immutable UTF-8 text whose bytes are signed as-is.
///
/// No trimming or normalization is ever applied: any change to the bytes changes the seal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalString(String);

impl CanonicalString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_utf8(bytes: Vec<u8>) -> Result<Self, OriginalStringError> {
        String::from_utf8(bytes)
            .map(Self)
            .map_err(|_| OriginalStringError::InvalidUtf8)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for CanonicalString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CanonicalString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CanonicalString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability: given a document, produce its original string.
pub trait OriginalString {
    fn original_string(
        &self,
        document: &Document<Unsealed>,
    ) -> Result<CanonicalString, OriginalStringError>;
}

impl<F> OriginalString for F
where
    F: Fn(&Document<Unsealed>) -> Result<CanonicalString, OriginalStringError>,
{
    fn original_string(
        &self,
        document: &Document<Unsealed>,
    ) -> Result<CanonicalString, OriginalStringError> {
        self(document)
    }
}

/// A precomputed original string, independent of the document.
#[derive(Debug, Clone)]
pub struct FixedOriginalString(CanonicalString);

impl FixedOriginalString {
    pub fn new(value: impl Into<CanonicalString>) -> Self {
        Self(value.into())
    }
}

impl OriginalString for FixedOriginalString {
    fn original_string(
        &self,
        _document: &Document<Unsealed>,
    ) -> Result<CanonicalString, OriginalStringError> {
        Ok(self.0.clone())
    }
}

/// An original string stored in a file, read verbatim.
#[derive(Debug, Clone)]
pub struct OriginalStringFile {
    path: PathBuf,
}

impl OriginalStringFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OriginalString for OriginalStringFile {
    fn original_string(
        &self,
        _document: &Document<Unsealed>,
    ) -> Result<CanonicalString, OriginalStringError> {
        let bytes = read_input(InputKind::OriginalString, &self.path)?;
        CanonicalString::from_utf8(bytes)
    }
}

/// An external program (typically an XSLT processor) that reads the document on stdin and
/// writes the original string to stdout.
///
/// # Examples
/// ```rust,no_run
/// use sello_core::original::TransformCommand;
///
/// let transform = TransformCommand::xslt("xsltproc", "cadenaoriginal_4_0.xslt");
/// # let _ = transform;
/// ```
#[derive(Debug, Clone)]
pub struct TransformCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl TransformCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// `<processor> <stylesheet> -`, the xsltproc calling convention for reading stdin.
    pub fn xslt(processor: impl Into<OsString>, stylesheet: impl Into<OsString>) -> Self {
        Self::new(processor).arg(stylesheet).arg("-")
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl OriginalString for TransformCommand {
    fn original_string(
        &self,
        document: &Document<Unsealed>,
    ) -> Result<CanonicalString, OriginalStringError> {
        let spawn_error = |source| OriginalStringError::Spawn {
            program: self.program_name(),
            source,
        };
        tracing::debug!(program = %self.program_name(), "running original string transform");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        // Feed stdin from another thread so a chatty transform cannot fill its stdout pipe first.
        let mut stdin = child.stdin.take().ok_or_else(|| {
            spawn_error(std::io::Error::other("transform stdin unavailable"))
        })?;
        let input = document.source().as_bytes().to_vec();
        let writer = std::thread::spawn(move || stdin.write_all(&input));

        let output = child.wait_with_output().map_err(spawn_error)?;
        let written = writer
            .join()
            .map_err(|_| spawn_error(std::io::Error::other("stdin writer panicked")))?;

        if !output.status.success() {
            return Err(OriginalStringError::Transform {
                program: self.program_name(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // A transform may exit successfully without draining stdin.
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(spawn_error(e));
            }
        }
        CanonicalString::from_utf8(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFDI: &str = r#"<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" Version="4.0" Folio="7"/>"#;

    fn document() -> Document<Unsealed> {
        Document::parse(CFDI.as_bytes()).expect("parse")
    }

    #[test]
    fn canonical_string_keeps_bytes_verbatim() {
        let value = CanonicalString::new("||4.0|A|12345||\n");
        assert_eq!(value.as_bytes(), b"||4.0|A|12345||\n");
        assert_eq!(value.len(), 16);
        assert!(CanonicalString::new("").is_empty());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let err = CanonicalString::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, OriginalStringError::InvalidUtf8));
    }

    #[test]
    fn fixed_source_ignores_document() {
        let source = FixedOriginalString::new("||4.0|A||");
        let value = source.original_string(&document()).expect("string");
        assert_eq!(value.as_str(), "||4.0|A||");
    }

    #[test]
    fn closures_can_derive_string_from_document() {
        let source = |doc: &Document<Unsealed>| -> Result<CanonicalString, OriginalStringError> {
            Ok(CanonicalString::new(format!("||{}||", doc.root_name())))
        };
        let value = source.original_string(&document()).expect("string");
        assert_eq!(value.as_str(), "||cfdi:Comprobante||");
    }

    #[test]
    fn file_source_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = OriginalStringFile::new(dir.path().join("cadena.txt"));
        let err = source.original_string(&document()).unwrap_err();
        assert!(matches!(
            err,
            OriginalStringError::Input(InputError::NotFound {
                kind: InputKind::OriginalString,
                ..
            })
        ));
    }

    #[test]
    fn file_source_does_not_trim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cadena.txt");
        std::fs::write(&path, "||4.0|A||\n").expect("write");
        let value = OriginalStringFile::new(&path)
            .original_string(&document())
            .expect("string");
        assert_eq!(value.as_str(), "||4.0|A||\n");
    }

    #[cfg(unix)]
    #[test]
    fn transform_command_reads_stdout() {
        let value = TransformCommand::new("cat")
            .original_string(&document())
            .expect("transform");
        assert_eq!(value.as_str(), CFDI);
    }

    #[cfg(unix)]
    #[test]
    fn failing_transform_is_reported() {
        let err = TransformCommand::new("sh")
            .arg("-c")
            .arg("echo 'no stylesheet' >&2; exit 3")
            .original_string(&document())
            .unwrap_err();
        match err {
            OriginalStringError::Transform { stderr, .. } => assert_eq!(stderr, "no stylesheet"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = TransformCommand::new("sello-no-such-xslt-processor")
            .original_string(&document())
            .unwrap_err();
        assert!(matches!(err, OriginalStringError::Spawn { .. }));
    }
}
