//! The invoice document and the `Sello` attribute on its root element.
//!
//! The document is kept as the original text plus the location of its XML declaration and of the
//! root start tag. Sealing never rebuilds the tree: serialization copies the source bytes and
//! splices the seal into the root start tag, so attribute order, quoting, whitespace, namespace
//! declarations, comments and entity references all come out exactly as they went in. Only the
//! declaration is normalized (to `encoding="UTF-8"`).
use crate::seal::EncodedSignature;
use quick_xml::Reader;
use quick_xml::events::{BytesDecl, BytesStart, Event};
use std::io::Write;
use std::ops::Range;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Name of the root attribute that carries the seal.
pub const SELLO_ATTRIBUTE: &str = "Sello";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Errors raised while reading or writing a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed XML document: {reason}")]
    Malformed { reason: String },

    #[error("unsupported document encoding '{encoding}', only UTF-8 documents can be sealed")]
    UnsupportedEncoding { encoding: String },

    #[error("failed to write sealed document to {target}: {source}")]
    Serialization {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

fn malformed(reason: impl std::fmt::Display) -> DocumentError {
    DocumentError::Malformed {
        reason: reason.to_string(),
    }
}

/// Lifecycle state of a [`Document`].
pub trait SealState {
    fn seal(&self) -> Option<&EncodedSignature>;
}

/// Freshly parsed; no seal has been embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsealed;

/// A seal has been embedded. There is no way back to [`Unsealed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed(EncodedSignature);

impl SealState for Unsealed {
    fn seal(&self) -> Option<&EncodedSignature> {
        None
    }
}

impl SealState for Sealed {
    fn seal(&self) -> Option<&EncodedSignature> {
        Some(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Declaration {
    version: String,
    standalone: Option<String>,
    /// End of the source declaration; `None` when the source had none.
    end: Option<usize>,
}

impl Declaration {
    fn absent() -> Self {
        Self {
            version: "1.0".to_string(),
            standalone: None,
            end: None,
        }
    }

    fn from_event(decl: &BytesDecl<'_>, end: usize) -> Result<Self, DocumentError> {
        let version = decl.version().map_err(malformed)?;
        let version = String::from_utf8_lossy(&version).into_owned();

        if let Some(encoding) = decl.encoding() {
            let encoding = encoding.map_err(malformed)?;
            let encoding = String::from_utf8_lossy(&encoding).into_owned();
            if !encoding.eq_ignore_ascii_case("utf-8") && !encoding.eq_ignore_ascii_case("utf8") {
                return Err(DocumentError::UnsupportedEncoding { encoding });
            }
        }

        let standalone = match decl.standalone() {
            Some(value) => Some(String::from_utf8_lossy(&value.map_err(malformed)?).into_owned()),
            None => None,
        };

        Ok(Self {
            version,
            standalone,
            end: Some(end),
        })
    }

    fn render(&self) -> String {
        match &self.standalone {
            Some(standalone) => format!(
                "<?xml version=\"{}\" encoding=\"UTF-8\" standalone=\"{}\"?>",
                self.version, standalone
            ),
            None => format!("<?xml version=\"{}\" encoding=\"UTF-8\"?>", self.version),
        }
    }
}

/// Where the root start tag sits in the source and where the seal goes inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RootTag {
    name: String,
    span: Range<usize>,
    /// Just after the last attribute; a new `Sello` is appended here.
    insert_at: usize,
    /// Value of an existing `Sello` attribute, between its quotes.
    sello: Option<Range<usize>>,
}

impl RootTag {
    fn locate(source: &[u8], start: &BytesStart<'_>, end: usize) -> Result<Self, DocumentError> {
        for attr in start.attributes() {
            let attr = attr.map_err(malformed)?;
            if attr.value.contains(&b'<') {
                return Err(malformed("'<' in root attribute value"));
            }
        }

        // '<' cannot occur inside a start tag other than at its first byte.
        let tag_start = source[..end]
            .iter()
            .rposition(|&b| b == b'<')
            .ok_or_else(|| malformed("cannot locate root start tag"))?;
        let tag = &source[tag_start..end];
        let name = start.name();
        let name = name.as_ref();
        if !tag[1..].starts_with(name) || tag.last() != Some(&b'>') {
            return Err(malformed("cannot locate root start tag"));
        }

        let spans = attribute_spans(tag, 1 + name.len())?;
        let insert_at = spans
            .last()
            .map(|span| span.value.end + 1)
            .unwrap_or(1 + name.len());
        let sello = spans
            .iter()
            .find(|span| &tag[span.name.clone()] == SELLO_ATTRIBUTE.as_bytes())
            .map(|span| tag_start + span.value.start..tag_start + span.value.end);

        Ok(Self {
            name: String::from_utf8_lossy(name).into_owned(),
            span: tag_start..end,
            insert_at: tag_start + insert_at,
            sello,
        })
    }
}

#[derive(Debug)]
struct AttributeSpan {
    name: Range<usize>,
    value: Range<usize>,
}

/// Byte ranges of the attributes of a start tag that quick-xml already accepted.
fn attribute_spans(tag: &[u8], mut pos: usize) -> Result<Vec<AttributeSpan>, DocumentError> {
    let skip_whitespace = |mut pos: usize| {
        while tag.get(pos).is_some_and(u8::is_ascii_whitespace) {
            pos += 1;
        }
        pos
    };

    let mut spans = Vec::new();
    loop {
        pos = skip_whitespace(pos);
        match tag.get(pos) {
            None => return Err(malformed("unterminated root start tag")),
            Some(b'>') | Some(b'/') => return Ok(spans),
            Some(_) => {}
        }

        let name_start = pos;
        while tag
            .get(pos)
            .is_some_and(|&b| b != b'=' && !b.is_ascii_whitespace())
        {
            pos += 1;
        }
        let name = name_start..pos;

        pos = skip_whitespace(pos);
        if tag.get(pos) != Some(&b'=') {
            return Err(malformed("root attribute without value"));
        }
        pos = skip_whitespace(pos + 1);

        let quote = match tag.get(pos) {
            Some(&q @ (b'"' | b'\'')) => q,
            _ => return Err(malformed("unquoted root attribute value")),
        };
        let value_start = pos + 1;
        let value_len = tag[value_start..]
            .iter()
            .position(|&b| b == quote)
            .ok_or_else(|| malformed("unterminated root attribute value"))?;
        spans.push(AttributeSpan {
            name,
            value: value_start..value_start + value_len,
        });
        pos = value_start + value_len + 1;
    }
}

/// An XML document that can carry a seal on its root element.
#[derive(Debug, Clone)]
pub struct Document<S: SealState = Unsealed> {
    source: String,
    declaration: Declaration,
    root: RootTag,
    state: S,
}

impl Document<Unsealed> {
    /// Parse a UTF-8 XML document, checking that it is well formed.
    ///
    /// # Examples
    /// ```rust
    /// use sello_core::document::Document;
    ///
    /// let doc = Document::parse(br#"<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" Version="4.0"/>"#)?;
    /// assert_eq!(doc.root_name(), "cfdi:Comprobante");
    /// assert!(doc.sello().is_none());
    /// # Ok::<(), sello_core::document::DocumentError>(())
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self, DocumentError> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let (declaration, root) = scan(bytes)?;
        let source = std::str::from_utf8(bytes)
            .map_err(|e| malformed(format!("document is not valid UTF-8: {e}")))?
            .to_owned();
        Ok(Self {
            source,
            declaration,
            root,
            state: Unsealed,
        })
    }

    /// `Sello` value the source document already carried, if any. It is replaced on sealing.
    pub fn prior_sello(&self) -> Option<&str> {
        self.root.sello.clone().map(|range| &self.source[range])
    }
}

impl Document<Sealed> {
    pub fn seal(&self) -> &EncodedSignature {
        &self.state.0
    }
}

impl<S: SealState> Document<S> {
    /// Set the root `Sello` attribute to `seal`, replacing any previous value.
    ///
    /// Sealing an already sealed document with the same seal yields the same document.
    pub fn embed_seal(self, seal: &EncodedSignature) -> Document<Sealed> {
        Document {
            source: self.source,
            declaration: self.declaration,
            root: self.root,
            state: Sealed(seal.clone()),
        }
    }

    /// The embedded seal; `None` until [`Document::embed_seal`] has run.
    pub fn sello(&self) -> Option<&str> {
        self.state.seal().map(EncodedSignature::as_str)
    }

    /// Qualified name of the root element, e.g. `cfdi:Comprobante`.
    pub fn root_name(&self) -> &str {
        &self.root.name
    }

    /// The document text as read (without a byte order mark).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Serialize with a UTF-8 declaration.
    pub fn to_bytes(&self) -> Vec<u8> {
        let source = self.source.as_bytes();
        let mut out = Vec::with_capacity(source.len() + 400);
        out.extend_from_slice(self.declaration.render().as_bytes());
        let body_start = match self.declaration.end {
            Some(end) => end,
            None => {
                out.push(b'\n');
                0
            }
        };

        match (self.state.seal(), &self.root.sello) {
            (None, _) => out.extend_from_slice(&source[body_start..]),
            (Some(seal), Some(existing)) => {
                out.extend_from_slice(&source[body_start..existing.start]);
                out.extend_from_slice(seal.as_str().as_bytes());
                out.extend_from_slice(&source[existing.end..]);
            }
            (Some(seal), None) => {
                let at = self.root.insert_at;
                out.extend_from_slice(&source[body_start..at]);
                out.extend_from_slice(b" ");
                out.extend_from_slice(SELLO_ATTRIBUTE.as_bytes());
                out.extend_from_slice(b"=\"");
                out.extend_from_slice(seal.as_str().as_bytes());
                out.extend_from_slice(b"\"");
                out.extend_from_slice(&source[at..]);
            }
        }
        out
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), DocumentError> {
        writer
            .write_all(&self.to_bytes())
            .and_then(|()| writer.flush())
            .map_err(|source| DocumentError::Serialization {
                target: "output stream".to_string(),
                source,
            })
    }

    /// Write the serialized document to `path`.
    ///
    /// The bytes go to a temporary file in the same directory that is renamed over `path` once
    /// complete, so `path` either keeps its previous state or holds the whole sealed document.
    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        let serialization = |source| DocumentError::Serialization {
            target: format!("'{}'", path.display()),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir).map_err(serialization)?;
        file.write_all(&self.to_bytes())
            .and_then(|()| file.as_file().sync_all())
            .map_err(serialization)?;
        file.persist(path).map_err(|e| serialization(e.error))?;
        Ok(())
    }

    #[cfg(test)]
    fn root_span(&self) -> Range<usize> {
        self.root.span.clone()
    }
}

fn scan(bytes: &[u8]) -> Result<(Declaration, RootTag), DocumentError> {
    let mut reader = Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.trim_text(false);
    config.check_end_names = true;

    let mut declaration = None;
    let mut root: Option<RootTag> = None;
    let mut depth = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            malformed(format!(
                "{e} (near byte {})",
                reader.error_position()
            ))
        })?;
        let end = reader.buffer_position() as usize;
        match event {
            Event::Decl(decl) => {
                if declaration.is_some() || root.is_some() || !bytes.starts_with(b"<?xml") {
                    return Err(malformed("XML declaration must start the document"));
                }
                declaration = Some(Declaration::from_event(&decl, end)?);
            }
            Event::Start(start) => {
                if depth == 0 {
                    root = Some(locate_root(bytes, &start, end, root.is_some())?);
                }
                depth += 1;
            }
            Event::Empty(start) => {
                if depth == 0 {
                    root = Some(locate_root(bytes, &start, end, root.is_some())?);
                }
            }
            Event::End(_) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| malformed("unexpected end tag"))?;
            }
            Event::Text(text) if depth == 0 => {
                if !text.iter().all(u8::is_ascii_whitespace) {
                    return Err(malformed("text outside the root element"));
                }
            }
            Event::CData(_) if depth == 0 => {
                return Err(malformed("CDATA outside the root element"));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(malformed("unclosed element at end of document"));
    }
    let root = root.ok_or_else(|| malformed("document has no root element"))?;
    Ok((declaration.unwrap_or_else(Declaration::absent), root))
}

fn locate_root(
    source: &[u8],
    start: &BytesStart<'_>,
    end: usize,
    seen_root: bool,
) -> Result<RootTag, DocumentError> {
    if seen_root {
        return Err(malformed("more than one root element"));
    }
    RootTag::locate(source, start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEAL: &str = "QUJD";

    fn seal(value: &str) -> EncodedSignature {
        value.parse().expect("valid seal")
    }

    fn seal_str(xml: &str, value: &str) -> String {
        let doc = Document::parse(xml.as_bytes()).expect("parse");
        String::from_utf8(doc.embed_seal(&seal(value)).to_bytes()).expect("utf-8")
    }

    #[test]
    fn appends_sello_after_last_attribute() {
        let out = seal_str(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<cfdi:Comprobante xmlns:cfdi=\"http://www.sat.gob.mx/cfd/4\" Version=\"4.0\"\n    Total=\"1160.00\" >\n  <cfdi:Emisor Rfc=\"AAA010101AAA\"/>\n</cfdi:Comprobante>\n",
            SEAL,
        );
        assert_eq!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<cfdi:Comprobante xmlns:cfdi=\"http://www.sat.gob.mx/cfd/4\" Version=\"4.0\"\n    Total=\"1160.00\" Sello=\"QUJD\" >\n  <cfdi:Emisor Rfc=\"AAA010101AAA\"/>\n</cfdi:Comprobante>\n"
        );
    }

    #[test]
    fn overwrites_existing_sello_in_place() {
        let out = seal_str(
            "<Comprobante Version='4.0' Sello='dmllam8=' Total='1'/>",
            SEAL,
        );
        assert_eq!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Comprobante Version='4.0' Sello='QUJD' Total='1'/>"
        );
    }

    #[test]
    fn root_without_attributes_gets_sello() {
        assert_eq!(
            seal_str("<Comprobante/>", SEAL),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Comprobante Sello=\"QUJD\"/>"
        );
        assert_eq!(
            seal_str("<Comprobante></Comprobante>", SEAL),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Comprobante Sello=\"QUJD\"></Comprobante>"
        );
    }

    #[test]
    fn prefixed_sello_is_a_different_attribute() {
        let out = seal_str(
            r#"<c:Comprobante xmlns:c="urn:c" c:Sello="b2xk"/>"#,
            SEAL,
        );
        assert!(out.ends_with(r#"<c:Comprobante xmlns:c="urn:c" c:Sello="b2xk" Sello="QUJD"/>"#));
    }

    #[test]
    fn child_sello_attributes_are_untouched() {
        let out = seal_str(r#"<a x="1"><b Sello="b2xk"/></a>"#, SEAL);
        assert!(out.ends_with(r#"<a x="1" Sello="QUJD"><b Sello="b2xk"/></a>"#));
    }

    #[test]
    fn declaration_keeps_version_and_standalone() {
        let out = seal_str(
            "<?xml version='1.0' encoding='UTF-8' standalone='yes'?><a/>",
            SEAL,
        );
        assert_eq!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?><a Sello=\"QUJD\"/>"
        );
    }

    #[test]
    fn byte_order_mark_is_dropped() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"<a/>");
        let doc = Document::parse(&bytes).expect("parse");
        assert_eq!(doc.source(), "<a/>");
    }

    #[test]
    fn entities_and_comments_survive() {
        let xml = "<!-- cabecera -->\n<a t=\"&amp;&lt;\"><!-- x --><b>&#233;</b><![CDATA[<z>]]></a>";
        let out = seal_str(xml, SEAL);
        assert!(out.ends_with(
            "<!-- cabecera -->\n<a t=\"&amp;&lt;\" Sello=\"QUJD\"><!-- x --><b>&#233;</b><![CDATA[<z>]]></a>"
        ));
    }

    #[test]
    fn sello_is_absent_until_sealed() {
        let doc = Document::parse(br#"<a Sello="b2xk"/>"#).expect("parse");
        assert_eq!(doc.sello(), None);
        assert_eq!(doc.prior_sello(), Some("b2xk"));
        let sealed = doc.embed_seal(&seal(SEAL));
        assert_eq!(sealed.sello(), Some(SEAL));
        assert_eq!(sealed.seal().as_str(), SEAL);
    }

    #[test]
    fn embedding_twice_is_idempotent() {
        let xml = br#"<a x="1" y='2'/>"#;
        let once = Document::parse(xml).expect("parse").embed_seal(&seal(SEAL));
        let twice = once.clone().embed_seal(&seal(SEAL));
        assert_eq!(once.to_bytes(), twice.to_bytes());
    }

    #[test]
    fn resealing_replaces_previous_seal() {
        let sealed = Document::parse(b"<a/>")
            .expect("parse")
            .embed_seal(&seal("b2xk"))
            .embed_seal(&seal(SEAL));
        assert_eq!(sealed.sello(), Some(SEAL));
        assert!(String::from_utf8(sealed.to_bytes()).expect("utf-8").ends_with("<a Sello=\"QUJD\"/>"));
    }

    #[test]
    fn unsealed_serialization_only_normalizes_declaration() {
        let doc = Document::parse(b"<?xml version=\"1.0\" encoding=\"utf-8\"?>\r\n<a  b = \"1\"/>\r\n")
            .expect("parse");
        assert_eq!(
            doc.to_bytes(),
            b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n<a  b = \"1\"/>\r\n"
        );
    }

    #[test]
    fn root_span_covers_start_tag() {
        let xml = "<?xml version=\"1.0\"?>\n<!-- c -->\n<r a=\"1\">text</r>";
        let doc = Document::parse(xml.as_bytes()).expect("parse");
        assert_eq!(&xml[doc.root_span()], "<r a=\"1\">");
    }

    #[test]
    fn non_utf8_declaration_is_rejected() {
        let err = Document::parse(b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><a/>").unwrap_err();
        assert!(matches!(err, DocumentError::UnsupportedEncoding { ref encoding } if encoding == "ISO-8859-1"));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let cases: &[&[u8]] = &[
            b"",
            b"   ",
            b"<a><b></a>",
            b"<a>",
            b"<a/><b/>",
            b"<a/>trailing",
            b"<a x=\"1\" x=\"2\"/>",
            b"<a>\xff</a>",
        ];
        for case in cases {
            let err = Document::parse(case).unwrap_err();
            assert!(
                matches!(err, DocumentError::Malformed { .. }),
                "expected malformed for {:?}, got {err:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn save_reports_unwritable_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let doc = Document::parse(b"<a/>").expect("parse").embed_seal(&seal(SEAL));
        let err = doc
            .save(&dir.path().join("missing-dir").join("out.xml"))
            .unwrap_err();
        assert!(matches!(err, DocumentError::Serialization { .. }));
    }

    #[test]
    fn failed_save_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("cfdi_sellado.xml");
        std::fs::create_dir(&target).expect("occupy target with a directory");
        let doc = Document::parse(b"<a/>").expect("parse").embed_seal(&seal(SEAL));

        let err = doc.save(&target).unwrap_err();
        assert!(matches!(err, DocumentError::Serialization { .. }));
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("cfdi_sellado.xml")]);
        assert!(target.is_dir());
    }

    #[test]
    fn save_replaces_existing_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("cfdi_sellado.xml");
        std::fs::write(&target, "viejo").expect("write stale output");
        let doc = Document::parse(b"<a/>").expect("parse").embed_seal(&seal(SEAL));
        doc.save(&target).expect("save");
        assert_eq!(std::fs::read(&target).expect("read"), doc.to_bytes());
    }

    #[test]
    fn write_to_emits_serialized_bytes() {
        let doc = Document::parse(b"<a/>").expect("parse").embed_seal(&seal(SEAL));
        let mut out = Vec::new();
        doc.write_to(&mut out).expect("write");
        assert_eq!(out, doc.to_bytes());
    }
}
