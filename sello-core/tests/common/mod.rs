use rsa::pkcs1v15::VerifyingKey;
use rsa::signature::Verifier;
use sello_core::keystore::{Certificate, load_certificate};
use sha2::Sha256;
use std::path::{Path, PathBuf};

pub const PASSWORD: &str = "12345678a";

#[allow(dead_code)]
pub fn fixture_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(relative)
}

pub fn fixture(relative: &str) -> Vec<u8> {
    std::fs::read(fixture_path(relative)).expect("read fixture")
}

#[allow(dead_code)]
pub fn fixture_string(relative: &str) -> String {
    String::from_utf8(fixture(relative)).expect("fixture utf-8")
}

#[allow(dead_code)]
pub fn test_certificate() -> Certificate {
    load_certificate(&fixture("csd/CSD_Prueba.cer")).expect("test certificate")
}

/// Verify a base64 seal over `message` with the certificate's public key.
#[allow(dead_code)]
pub fn seal_verifies(certificate: &Certificate, message: &[u8], seal: &str) -> bool {
    use base64ct::{Base64, Encoding};

    let public_key = certificate.public_key().expect("RSA certificate");
    let Ok(bytes) = Base64::decode_vec(seal) else {
        return false;
    };
    let Ok(signature) = rsa::pkcs1v15::Signature::try_from(bytes.as_slice()) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(public_key)
        .verify(message, &signature)
        .is_ok()
}

/// Value of an attribute on the root start tag, read with quick-xml.
#[allow(dead_code)]
pub fn root_attribute(xml: &[u8], name: &str) -> Option<String> {
    root_attributes(xml)
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

/// Root attributes in document order, values unescaped.
#[allow(dead_code)]
pub fn root_attributes(xml: &[u8]) -> Vec<(String, String)> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let mut reader = Reader::from_reader(xml);
    loop {
        match reader.read_event().expect("read xml") {
            Event::Start(start) | Event::Empty(start) => {
                return start
                    .attributes()
                    .map(|attr| {
                        let attr = attr.expect("attribute");
                        (
                            String::from_utf8(attr.key.as_ref().to_vec()).expect("key"),
                            attr.unescape_value().expect("value").into_owned(),
                        )
                    })
                    .collect();
            }
            Event::Eof => panic!("no root element"),
            _ => {}
        }
    }
}
