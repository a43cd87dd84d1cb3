//! Certificate descriptions (BSI TR-03110 Part 4 section 2.2.6).
//!
//! ```plain
//! CertificateDescription ::= SEQUENCE {
//!     descriptionType OBJECT IDENTIFIER,
//!     issuerName [1] UTF8String,
//!     issuerURL [2] PrintableString OPTIONAL,
//!     subjectName [3] UTF8String,
//!     subjectURL [4] PrintableString OPTIONAL,
//!     termsOfUsage [5] ANY DEFINED BY descriptionType,
//!     redirectURL [6] PrintableString OPTIONAL,
//!     commCertificates [7] SET OF OCTET STRING OPTIONAL
//! }
//! ```


use crate::crypt::ecdsa::HashAlgorithm;
use crate::oids;
use crate::tlv::{DecodeError, Tag, Tlv, tags};


const ISSUER_NAME: Tag = Tag::from_raw(0xA1);
const ISSUER_URL: Tag = Tag::from_raw(0xA2);
const SUBJECT_NAME: Tag = Tag::from_raw(0xA3);
const SUBJECT_URL: Tag = Tag::from_raw(0xA4);
const TERMS_OF_USAGE: Tag = Tag::from_raw(0xA5);
const REDIRECT_URL: Tag = Tag::from_raw(0xA6);
const COMMUNICATION_CERTIFICATES: Tag = Tag::from_raw(0xA7);


/// The terms of usage of a service, in the format named by the description type.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TermsOfUsage {
    PlainText(String),
    Html(String),
    Pdf(Vec<u8>),
}
impl TermsOfUsage {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::PlainText(_) => "text/plain",
            Self::Html(_) => "text/html",
            Self::Pdf(_) => "application/pdf",
        }
    }
}


/// Describes the service behind a terminal certificate to the card holder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateDescription {
    pub issuer_name: String,
    pub issuer_url: Option<String>,
    pub subject_name: String,
    pub subject_url: Option<String>,
    pub terms_of_usage: TermsOfUsage,
    pub redirect_url: Option<String>,

    /// Hashes of the TLS certificates the service may use.
    pub communication_certificates: Vec<Vec<u8>>,

    encoded: Vec<u8>,
}
impl CertificateDescription {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let tlv = Tlv::decode_exact(bytes)?;
        if tlv.tag() != tags::SEQUENCE {
            return Err(DecodeError::UnexpectedTag { expected: tags::SEQUENCE, found: tlv.tag() });
        }
        let mut parser = tlv.parser();
        let description_type = parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;

        let issuer_name = explicit_text(parser.expect(ISSUER_NAME)?)?;
        let issuer_url = parser.optional(ISSUER_URL)
            .map(explicit_text)
            .transpose()?;
        let subject_name = explicit_text(parser.expect(SUBJECT_NAME)?)?;
        let subject_url = parser.optional(SUBJECT_URL)
            .map(explicit_text)
            .transpose()?;

        let terms_tlv = parser.expect(TERMS_OF_USAGE)?;
        let terms_of_usage = if &*description_type == oids::DESCRIPTION_PLAIN_FORMAT {
            TermsOfUsage::PlainText(explicit_text(terms_tlv)?)
        } else if &*description_type == oids::DESCRIPTION_HTML_FORMAT {
            TermsOfUsage::Html(explicit_text(terms_tlv)?)
        } else if &*description_type == oids::DESCRIPTION_PDF_FORMAT {
            let octets = explicit_inner(terms_tlv)?;
            if octets.tag() != tags::OCTET_STRING {
                return Err(DecodeError::UnexpectedTag { expected: tags::OCTET_STRING, found: octets.tag() });
            }
            TermsOfUsage::Pdf(octets.value_bytes())
        } else {
            return Err(DecodeError::InvalidValue { tag: tags::OBJECT_IDENTIFIER, reason: "unknown description type" });
        };

        let redirect_url = parser.optional(REDIRECT_URL)
            .map(explicit_text)
            .transpose()?;
        let communication_certificates = match parser.optional(COMMUNICATION_CERTIFICATES) {
            Some(wrapper) => {
                let set = explicit_inner(wrapper)?;
                if set.tag() != tags::SET {
                    return Err(DecodeError::UnexpectedTag { expected: tags::SET, found: set.tag() });
                }
                set.children()
                    .iter()
                    .map(|hash| {
                        if hash.tag() != tags::OCTET_STRING {
                            return Err(DecodeError::UnexpectedTag { expected: tags::OCTET_STRING, found: hash.tag() });
                        }
                        Ok(hash.value_bytes())
                    })
                    .collect::<Result<Vec<_>, _>>()?
            },
            None => Vec::new(),
        };
        parser.expect_end()?;

        Ok(Self {
            issuer_name,
            issuer_url,
            subject_name,
            subject_url,
            terms_of_usage,
            redirect_url,
            communication_certificates,
            encoded: bytes.to_vec(),
        })
    }

    /// The description exactly as received, which is what the certificate attests.
    pub fn encoded(&self) -> &[u8] { &self.encoded }

    pub fn hash(&self, algorithm: HashAlgorithm) -> Vec<u8> {
        algorithm.digest(&self.encoded)
    }
}


fn explicit_inner(wrapper: &Tlv) -> Result<&Tlv, DecodeError> {
    match wrapper.children() {
        [inner] => Ok(inner),
        [] => Err(DecodeError::InvalidValue { tag: wrapper.tag(), reason: "empty explicit tag" }),
        [_, extra, ..] => Err(DecodeError::UnexpectedElement { found: extra.tag() }),
    }
}

fn explicit_text(wrapper: &Tlv) -> Result<String, DecodeError> {
    let inner = explicit_inner(wrapper)?;
    if !matches!(inner.tag(), tags::UTF8_STRING | tags::PRINTABLE_STRING | tags::IA5_STRING) {
        return Err(DecodeError::InvalidValue { tag: inner.tag(), reason: "expected a character string" });
    }
    inner.to_text()
}
