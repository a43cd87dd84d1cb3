//! Card Verifiable Certificates (BSI TR-03110 Part 3 Appendix C).
//!
//! ```plain
//! 7F21 CV Certificate
//!     7F4E Certificate Body
//!         5F29 Certificate Profile Identifier
//!         42   Certification Authority Reference
//!         7F49 Public Key
//!         5F20 Certificate Holder Reference
//!         7F4C Certificate Holder Authorization Template
//!         5F25 Certificate Effective Date
//!         5F24 Certificate Expiration Date
//!         65   Certificate Extensions (optional)
//!     5F37 Signature
//! ```


use std::fmt;

use rasn::types::{ObjectIdentifier, Oid};

use crate::crypt;
use crate::crypt::ecdsa::{self, HashAlgorithm};
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};
use crate::cvc::chat::{Chat, CERTIFICATE_HOLDER_AUTHORIZATION_TEMPLATE};
use crate::der_util::{encode_primitive_length, oid_to_der_bytes};
use crate::oids;
use crate::security_info::EcParameters;
use crate::tlv::{DecodeError, RawElement, Tag, Tlv, tags};
use crate::tlv::template::DiscretionaryDataTemplate;


pub const CV_CERTIFICATE: Tag = Tag::from_raw(0x7F21);
pub const CERTIFICATE_BODY: Tag = Tag::from_raw(0x7F4E);
pub const PROFILE_IDENTIFIER: Tag = Tag::from_raw(0x5F29);
pub const AUTHORITY_REFERENCE: Tag = Tag::from_raw(0x42);
pub const PUBLIC_KEY: Tag = Tag::from_raw(0x7F49);
pub const HOLDER_REFERENCE: Tag = Tag::from_raw(0x5F20);
pub const EFFECTIVE_DATE: Tag = Tag::from_raw(0x5F25);
pub const EXPIRATION_DATE: Tag = Tag::from_raw(0x5F24);
pub const EXTENSIONS: Tag = Tag::from_raw(0x65);
pub const SIGNATURE: Tag = Tag::from_raw(0x5F37);

const PRIME_OR_MODULUS: Tag = Tag::from_raw(0x81);
const COEFFICIENT_A_OR_EXPONENT: Tag = Tag::from_raw(0x82);
const COEFFICIENT_B: Tag = Tag::from_raw(0x83);
const BASE_POINT: Tag = Tag::from_raw(0x84);
const ORDER: Tag = Tag::from_raw(0x85);
const PUBLIC_POINT: Tag = Tag::from_raw(0x86);
const COFACTOR: Tag = Tag::from_raw(0x87);

const DESCRIPTION_HASH: Tag = Tag::from_raw(0x80);


fn primitive(tlv: &Tlv) -> Result<&[u8], DecodeError> {
    tlv.primitive_value()
        .ok_or(DecodeError::InvalidValue { tag: tlv.tag(), reason: "expected a primitive value" })
}


/// A reference to a public key: country code, holder mnemonic and sequence number.
///
/// Used as Certification Authority Reference and Certificate Holder Reference.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PublicKeyReference {
    bytes: Vec<u8>,
}
impl PublicKeyReference {
    const COUNTRY_CODE_LENGTH: usize = 2;
    const SEQUENCE_NUMBER_LENGTH: usize = 5;
    const MAX_LENGTH: usize = 16;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, DecodeError> {
        let bytes = bytes.into();
        if bytes.len() < Self::COUNTRY_CODE_LENGTH + Self::SEQUENCE_NUMBER_LENGTH || bytes.len() > Self::MAX_LENGTH {
            return Err(DecodeError::InvalidValue { tag: HOLDER_REFERENCE, reason: "public key reference has wrong length" });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] { &self.bytes }

    pub fn country_code(&self) -> &[u8] {
        &self.bytes[..Self::COUNTRY_CODE_LENGTH]
    }

    pub fn holder_mnemonic(&self) -> &[u8] {
        &self.bytes[Self::COUNTRY_CODE_LENGTH..self.bytes.len() - Self::SEQUENCE_NUMBER_LENGTH]
    }

    pub fn sequence_number(&self) -> &[u8] {
        &self.bytes[self.bytes.len() - Self::SEQUENCE_NUMBER_LENGTH..]
    }
}
impl fmt::Display for PublicKeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ISO 8859-1
        for b in &self.bytes {
            write!(f, "{}", char::from(*b))?;
        }
        Ok(())
    }
}
impl fmt::Debug for PublicKeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyReference({:?})", self.to_string())
    }
}


/// A certificate date, encoded as six unpacked BCD digits `YYMMDD`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CertificateDate {
    year: u16,
    month: u8,
    day: u8,
}
impl CertificateDate {
    pub fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        if !(2000..=2099).contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return None;
        }
        Some(Self { year, month, day })
    }

    fn decode(tlv: &Tlv) -> Result<Self, DecodeError> {
        let digits = primitive(tlv)?;
        if digits.len() != 6 || digits.iter().any(|d| *d > 9) {
            return Err(DecodeError::InvalidValue { tag: tlv.tag(), reason: "date is not six BCD digits" });
        }
        let year = 2000 + u16::from(digits[0] * 10 + digits[1]);
        let month = digits[2] * 10 + digits[3];
        let day = digits[4] * 10 + digits[5];
        Self::new(year, month, day)
            .ok_or(DecodeError::InvalidValue { tag: tlv.tag(), reason: "date out of range" })
    }

    pub fn to_digits(&self) -> [u8; 6] {
        // year is within 2000..=2099
        let year_in_century = (self.year % 100) as u8;
        [
            year_in_century / 10, year_in_century % 10,
            self.month / 10, self.month % 10,
            self.day / 10, self.day % 10,
        ]
    }

    pub fn year(&self) -> u16 { self.year }
    pub fn month(&self) -> u8 { self.month }
    pub fn day(&self) -> u8 { self.day }
}
impl fmt::Display for CertificateDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}


/// The key material of a certificate public key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublicKeyParameters {
    /// An ECDSA key. Domain parameters are only present in CVCA certificates; other certificates
    /// inherit them from their issuer.
    Ec {
        domain_parameters: Option<EcParameters>,
        public_point: Vec<u8>,
    },
    Rsa {
        modulus: Vec<u8>,
        exponent: Vec<u8>,
    },
}


/// `7F49 { 06 algorithm, key data objects… }`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CvcPublicKey {
    pub object_identifier: ObjectIdentifier,
    pub parameters: PublicKeyParameters,
}
impl CvcPublicKey {
    pub fn decode(tlv: &Tlv) -> Result<Self, DecodeError> {
        if tlv.tag() != PUBLIC_KEY {
            return Err(DecodeError::UnexpectedTag { expected: PUBLIC_KEY, found: tlv.tag() });
        }
        let mut parser = tlv.parser();
        let object_identifier = parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;

        let parameters = if oids::is_below(&object_identifier, oids::TA_ECDSA) {
            let domain_parameters = if parser.match_tag(PRIME_OR_MODULUS) {
                let prime = parser.expect(PRIME_OR_MODULUS)?.to_unsigned_bytes()?.to_vec();
                let coefficient_a = parser.expect(COEFFICIENT_A_OR_EXPONENT)?.to_unsigned_bytes()?.to_vec();
                let coefficient_b = parser.expect(COEFFICIENT_B)?.to_unsigned_bytes()?.to_vec();
                let base = primitive(parser.expect(BASE_POINT)?)?.to_vec();
                let order = parser.expect(ORDER)?.to_unsigned_bytes()?.to_vec();
                Some((prime, coefficient_a, coefficient_b, base, order))
            } else {
                None
            };
            let public_point = primitive(parser.expect(PUBLIC_POINT)?)?.to_vec();
            let cofactor = parser.optional(COFACTOR)
                .map(|c| c.to_u64())
                .transpose()?;
            let domain_parameters = domain_parameters.map(|(prime, coefficient_a, coefficient_b, base, order)| EcParameters {
                prime,
                coefficient_a,
                coefficient_b,
                base,
                order,
                cofactor,
            });
            PublicKeyParameters::Ec { domain_parameters, public_point }
        } else if oids::is_below(&object_identifier, oids::TA_RSA) {
            let modulus = parser.expect(PRIME_OR_MODULUS)?.to_unsigned_bytes()?.to_vec();
            let exponent = parser.expect(COEFFICIENT_A_OR_EXPONENT)?.to_unsigned_bytes()?.to_vec();
            PublicKeyParameters::Rsa { modulus, exponent }
        } else {
            return Err(DecodeError::InvalidValue { tag: tags::OBJECT_IDENTIFIER, reason: "unknown public key algorithm" });
        };
        parser.expect_end()?;

        Ok(Self { object_identifier, parameters })
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut children = vec![
            Tlv::primitive(tags::OBJECT_IDENTIFIER, oid_to_der_bytes(&self.object_identifier)),
        ];
        match &self.parameters {
            PublicKeyParameters::Ec { domain_parameters, public_point } => {
                if let Some(params) = domain_parameters {
                    children.push(Tlv::primitive(PRIME_OR_MODULUS, params.prime.clone()));
                    children.push(Tlv::primitive(COEFFICIENT_A_OR_EXPONENT, params.coefficient_a.clone()));
                    children.push(Tlv::primitive(COEFFICIENT_B, params.coefficient_b.clone()));
                    children.push(Tlv::primitive(BASE_POINT, params.base.clone()));
                    children.push(Tlv::primitive(ORDER, params.order.clone()));
                }
                children.push(Tlv::primitive(PUBLIC_POINT, public_point.clone()));
                if let Some(cofactor) = domain_parameters.as_ref().and_then(|p| p.cofactor) {
                    let cofactor_bytes = cofactor.to_be_bytes();
                    let first_significant = cofactor_bytes.iter()
                        .position(|b| *b != 0x00)
                        .unwrap_or(cofactor_bytes.len() - 1);
                    children.push(Tlv::primitive(COFACTOR, &cofactor_bytes[first_significant..]));
                }
            },
            PublicKeyParameters::Rsa { modulus, exponent } => {
                children.push(Tlv::primitive(PRIME_OR_MODULUS, modulus.clone()));
                children.push(Tlv::primitive(COEFFICIENT_A_OR_EXPONENT, exponent.clone()));
            },
        }
        Tlv::constructed(PUBLIC_KEY, children)
    }

    /// The hash algorithm of signatures made with this key, if it is an ECDSA key.
    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        HashAlgorithm::from_ta_protocol(&self.object_identifier)
    }

    pub fn is(&self, oid: &Oid) -> bool {
        &*self.object_identifier == oid
    }
}


/// The signed part of a certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateBody {
    pub profile_identifier: u8,
    pub authority_reference: PublicKeyReference,
    pub public_key: CvcPublicKey,
    pub holder_reference: PublicKeyReference,
    pub chat: Chat,
    pub effective_date: CertificateDate,
    pub expiration_date: CertificateDate,
    pub extensions: Vec<DiscretionaryDataTemplate>,
}
impl CertificateBody {
    pub fn decode(tlv: &Tlv) -> Result<Self, DecodeError> {
        if tlv.tag() != CERTIFICATE_BODY {
            return Err(DecodeError::UnexpectedTag { expected: CERTIFICATE_BODY, found: tlv.tag() });
        }
        let mut parser = tlv.parser();

        let profile_tlv = parser.expect(PROFILE_IDENTIFIER)?;
        let profile_identifier = u8::try_from(profile_tlv.to_u64()?)
            .map_err(|_| DecodeError::InvalidValue { tag: PROFILE_IDENTIFIER, reason: "profile identifier too large" })?;
        let authority_reference = PublicKeyReference::new(primitive(parser.expect(AUTHORITY_REFERENCE)?)?)?;
        let public_key = CvcPublicKey::decode(parser.expect(PUBLIC_KEY)?)?;
        let holder_reference = PublicKeyReference::new(primitive(parser.expect(HOLDER_REFERENCE)?)?)?;
        let chat = Chat::decode(parser.expect(CERTIFICATE_HOLDER_AUTHORIZATION_TEMPLATE)?)?;
        let effective_date = CertificateDate::decode(parser.expect(EFFECTIVE_DATE)?)?;
        let expiration_date = CertificateDate::decode(parser.expect(EXPIRATION_DATE)?)?;
        let extensions = match parser.optional(EXTENSIONS) {
            Some(extensions) => extensions.children()
                .iter()
                .map(DiscretionaryDataTemplate::decode)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        parser.expect_end()?;

        Ok(Self {
            profile_identifier,
            authority_reference,
            public_key,
            holder_reference,
            chat,
            effective_date,
            expiration_date,
            extensions,
        })
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut children = vec![
            Tlv::primitive(PROFILE_IDENTIFIER, [self.profile_identifier]),
            Tlv::primitive(AUTHORITY_REFERENCE, self.authority_reference.as_bytes()),
            self.public_key.to_tlv(),
            Tlv::primitive(HOLDER_REFERENCE, self.holder_reference.as_bytes()),
            self.chat.to_tlv(),
            Tlv::primitive(EFFECTIVE_DATE, self.effective_date.to_digits()),
            Tlv::primitive(EXPIRATION_DATE, self.expiration_date.to_digits()),
        ];
        if !self.extensions.is_empty() {
            children.push(Tlv::constructed(
                EXTENSIONS,
                self.extensions.iter().map(|e| e.to_tlv()).collect(),
            ));
        }
        Tlv::constructed(CERTIFICATE_BODY, children)
    }
}


/// A decoded Card Verifiable Certificate.
///
/// The body is kept in its original encoding, which is what the signature covers and what is sent
/// to the card.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CvCertificate {
    body: CertificateBody,
    encoded_body: Vec<u8>,
    signature: Vec<u8>,
}
impl CvCertificate {
    /// Assembles a certificate from a body and the signature over its encoding.
    pub fn new(body: CertificateBody, signature: Vec<u8>) -> Self {
        let encoded_body = body.to_tlv().to_bytes();
        Self { body, encoded_body, signature }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (certificate, rest) = RawElement::read(bytes)?;
        if !rest.is_empty() {
            return Err(DecodeError::TrailingData { count: rest.len() });
        }
        if certificate.tag != CV_CERTIFICATE {
            return Err(DecodeError::UnexpectedTag { expected: CV_CERTIFICATE, found: certificate.tag });
        }

        let elements = RawElement::read_all(certificate.value)?;
        let (body_element, signature_element) = match elements.as_slice() {
            [body, signature] => (body, signature),
            [] => return Err(DecodeError::MissingElement { expected: CERTIFICATE_BODY }),
            [_] => return Err(DecodeError::MissingElement { expected: SIGNATURE }),
            [_, _, extra, ..] => return Err(DecodeError::UnexpectedElement { found: extra.tag }),
        };
        if body_element.tag != CERTIFICATE_BODY {
            return Err(DecodeError::UnexpectedTag { expected: CERTIFICATE_BODY, found: body_element.tag });
        }
        if signature_element.tag != SIGNATURE {
            return Err(DecodeError::UnexpectedTag { expected: SIGNATURE, found: signature_element.tag });
        }

        let body = CertificateBody::decode(&Tlv::decode_exact(body_element.encoded)?)?;
        Ok(Self {
            body,
            encoded_body: body_element.encoded.to_vec(),
            signature: signature_element.value.to_vec(),
        })
    }

    pub fn body(&self) -> &CertificateBody { &self.body }
    pub fn signature(&self) -> &[u8] { &self.signature }

    /// The encoded certificate body, including its `7F4E` tag.
    pub fn encoded_body(&self) -> &[u8] { &self.encoded_body }

    pub fn holder_reference(&self) -> &PublicKeyReference { &self.body.holder_reference }
    pub fn authority_reference(&self) -> &PublicKeyReference { &self.body.authority_reference }
    pub fn public_key(&self) -> &CvcPublicKey { &self.body.public_key }
    pub fn chat(&self) -> &Chat { &self.body.chat }

    pub fn is_self_signed(&self) -> bool {
        self.body.authority_reference == self.body.holder_reference
    }

    /// The body followed by the signature data object, as sent with PSO:Verify Certificate.
    pub fn body_and_signature(&self) -> Vec<u8> {
        let mut ret = self.encoded_body.clone();
        Tlv::primitive(SIGNATURE, self.signature.clone()).encode(&mut ret);
        ret
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let contents = self.body_and_signature();
        let mut ret = Vec::with_capacity(contents.len() + 5);
        CV_CERTIFICATE.encode(&mut ret);
        encode_primitive_length(&mut ret, contents.len());
        ret.extend(&contents);
        ret
    }

    /// The hash of the certificate description, as attested by the description extension.
    pub fn description_hash(&self) -> Option<&[u8]> {
        self.body.extensions.iter()
            .find(|e| e.is(oids::ID_DESCRIPTION))
            .and_then(|e| e.data_object(DESCRIPTION_HASH))
    }

    /// Checks the signature over the body against the public key of the issuer.
    pub fn verify_signature(
        &self,
        issuer_curve: &PrimeWeierstrassCurve,
        issuer_public_point: &[u8],
        hash: HashAlgorithm,
    ) -> Result<(), crypt::Error> {
        let point = AffinePoint::try_from_be_bytes(issuer_public_point)
            .ok_or(crypt::Error::InvalidPublicKey)?;
        ecdsa::verify(issuer_curve, &point, hash, &self.encoded_body, &self.signature)
    }
}

