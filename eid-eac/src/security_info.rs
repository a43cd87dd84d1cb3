//! Decoding of the SecurityInfos stored in EF.CardAccess and EF.CardSecurity.
//!
//! ```plain
//! SecurityInfos ::= SET OF SecurityInfo
//!
//! SecurityInfo ::= SEQUENCE {
//!     protocol OBJECT IDENTIFIER,
//!     requiredData ANY DEFINED BY protocol,
//!     optionalData ANY DEFINED BY protocol OPTIONAL
//! }
//! ```
//!
//! Entries are classified by their protocol identifier; entries with unknown identifiers are
//! skipped.


use rasn::types::{ObjectIdentifier, Oid};
use tracing::debug;

use crate::der_util::oid_to_dotted;
use crate::oids::{self, equals_any, is_direct_child};
use crate::tlv::{DecodeError, Tag, Tlv, tags};


const EXPLICIT_0: Tag = Tag::from_raw(0xA0);


/// Explicit elliptic-curve domain parameters over a prime field.
///
/// All values are unsigned big-endian integers without leading zeroes, except `base`, which is an
/// encoded (usually uncompressed) point.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EcParameters {
    pub prime: Vec<u8>,
    pub coefficient_a: Vec<u8>,
    pub coefficient_b: Vec<u8>,
    pub base: Vec<u8>,
    pub order: Vec<u8>,
    pub cofactor: Option<u64>,
}

/// Explicit Diffie-Hellman domain parameters (ANSI X9.42).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DhParameters {
    pub prime: Vec<u8>,
    pub generator: Vec<u8>,
    pub order: Vec<u8>,
}

/// The domain parameters named by an `AlgorithmIdentifier`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DomainParameters {
    /// One of the standardized parameter sets, by identifier.
    Standardized(u64),
    EllipticCurve(EcParameters),
    DiffieHellman(DhParameters),
    /// An algorithm this crate does not know.
    Other(ObjectIdentifier),
}


/// `FileID ::= SEQUENCE { fid OCTET STRING (SIZE(2)), sfid OCTET STRING (SIZE(1)) OPTIONAL }`
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileId {
    pub fid: u16,
    pub short_fid: Option<u8>,
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceInfo {
    pub protocol: ObjectIdentifier,
    pub version: u64,
    pub parameter_id: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceDomainParameterInfo {
    pub protocol: ObjectIdentifier,
    pub domain_parameter: DomainParameters,
    pub parameter_id: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaInfo {
    pub protocol: ObjectIdentifier,
    pub version: u64,
    pub key_id: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaDomainParameterInfo {
    pub protocol: ObjectIdentifier,
    pub domain_parameter: DomainParameters,
    pub key_id: Option<u64>,
}

/// The chip's static key pair for Chip Authentication, as published in EF.CardSecurity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChipAuthenticationPublicKeyInfo {
    pub protocol: ObjectIdentifier,
    pub domain_parameter: DomainParameters,
    /// The public key (a point for ECDH, an integer for DH) as encoded in the BIT STRING.
    pub public_key: Vec<u8>,
    pub key_id: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaInfo {
    pub protocol: ObjectIdentifier,
    pub version: u64,
    pub ef_cvca: Option<FileId>,
}


/// A PACEInfo bound to the domain parameters it refers to.
///
/// No explicit parameters means the standardized parameters selected by the PACEInfo's parameter
/// identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PaceSecurityInfoPair<'s> {
    pub pace_info: &'s PaceInfo,
    pub domain_parameter_info: Option<&'s PaceDomainParameterInfo>,
}


/// All SecurityInfos of a card file, sorted by type.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecurityInfos {
    pub pace_infos: Vec<PaceInfo>,
    pub pace_domain_parameter_infos: Vec<PaceDomainParameterInfo>,
    pub ca_infos: Vec<CaInfo>,
    pub ca_domain_parameter_infos: Vec<CaDomainParameterInfo>,
    pub ca_public_key_infos: Vec<ChipAuthenticationPublicKeyInfo>,
    pub ta_infos: Vec<TaInfo>,
}
impl SecurityInfos {
    /// Decodes the contents of EF.CardAccess, i.e. a plain `SET OF SecurityInfo`.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let set = Tlv::decode_exact(bytes)?;
        Self::decode_set(&set)
    }

    /// Decodes the contents of EF.CardSecurity.
    ///
    /// The SecurityInfos are wrapped in a CMS `SignedData` structure; the signature is not checked
    /// here. A plain `SET OF SecurityInfo` is accepted as well.
    pub fn decode_card_security(bytes: &[u8]) -> Result<Self, DecodeError> {
        let outer = Tlv::decode_exact(bytes)?;
        if outer.tag() == tags::SET {
            return Self::decode_set(&outer);
        }
        let content = unwrap_signed_data(&outer)?;
        let set = Tlv::decode_exact(&content)?;
        Self::decode_set(&set)
    }

    fn decode_set(set: &Tlv) -> Result<Self, DecodeError> {
        if set.tag() != tags::SET {
            return Err(DecodeError::UnexpectedTag { expected: tags::SET, found: set.tag() });
        }

        let mut ret = Self::default();
        for security_info in set.children() {
            if security_info.tag() != tags::SEQUENCE {
                return Err(DecodeError::UnexpectedTag { expected: tags::SEQUENCE, found: security_info.tag() });
            }
            ret.classify(security_info)?;
        }
        Ok(ret)
    }

    fn classify(&mut self, security_info: &Tlv) -> Result<(), DecodeError> {
        let mut parser = security_info.parser();
        let protocol = parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;
        let oid: &Oid = &protocol;

        if is_direct_child(oid, oids::PACE_DH_GM) || is_direct_child(oid, oids::PACE_ECDH_GM)
                || is_direct_child(oid, oids::PACE_DH_IM) || is_direct_child(oid, oids::PACE_ECDH_IM)
                || is_direct_child(oid, oids::PACE_ECDH_CAM) {
            let version = parser.expect(tags::INTEGER)?.to_u64()?;
            let parameter_id = parser.optional(tags::INTEGER)
                .map(|tlv| tlv.to_u64())
                .transpose()?;
            self.pace_infos.push(PaceInfo { protocol, version, parameter_id });
        } else if equals_any!(oid, oids::PACE_DH_GM, oids::PACE_ECDH_GM, oids::PACE_DH_IM, oids::PACE_ECDH_IM, oids::PACE_ECDH_CAM) {
            let domain_parameter = decode_algorithm_identifier(parser.expect(tags::SEQUENCE)?)?;
            let parameter_id = parser.optional(tags::INTEGER)
                .map(|tlv| tlv.to_u64())
                .transpose()?;
            self.pace_domain_parameter_infos.push(PaceDomainParameterInfo { protocol, domain_parameter, parameter_id });
        } else if equals_any!(oid, oids::CA_DH, oids::CA_ECDH) {
            let domain_parameter = decode_algorithm_identifier(parser.expect(tags::SEQUENCE)?)?;
            let key_id = parser.optional(tags::INTEGER)
                .map(|tlv| tlv.to_u64())
                .transpose()?;
            self.ca_domain_parameter_infos.push(CaDomainParameterInfo { protocol, domain_parameter, key_id });
        } else if oids::is_ca_dh(oid) || oids::is_ca_ecdh(oid) {
            let version = parser.expect(tags::INTEGER)?.to_u64()?;
            let key_id = parser.optional(tags::INTEGER)
                .map(|tlv| tlv.to_u64())
                .transpose()?;
            self.ca_infos.push(CaInfo { protocol, version, key_id });
        } else if equals_any!(oid, oids::PK_DH, oids::PK_ECDH) {
            // SubjectPublicKeyInfo
            let required = parser.expect(tags::SEQUENCE)?;
            let key_id = parser.optional(tags::INTEGER)
                .map(|tlv| tlv.to_u64())
                .transpose()?;

            let mut required_parser = required.parser();
            let domain_parameter = decode_algorithm_identifier(required_parser.expect(tags::SEQUENCE)?)?;
            let public_key = decode_bit_string(required_parser.expect(tags::BIT_STRING)?)?;
            self.ca_public_key_infos.push(ChipAuthenticationPublicKeyInfo {
                protocol,
                domain_parameter,
                public_key,
                key_id,
            });
        } else if oid == oids::TA {
            let version = parser.expect(tags::INTEGER)?.to_u64()?;
            let ef_cvca = parser.optional(tags::SEQUENCE)
                .map(decode_file_id)
                .transpose()?;
            self.ta_infos.push(TaInfo { protocol, version, ef_cvca });
        } else {
            debug!("skipping SecurityInfo with unknown protocol {}", oid_to_dotted(oid));
        }
        Ok(())
    }

    /// Pairs every PACEInfo with its domain parameters.
    ///
    /// A lone PACEInfo is paired with the lone domain parameter entry even if their parameter
    /// identifiers differ. Otherwise entries are matched by parameter identifier, and a PACEInfo
    /// without a match uses standardized parameters.
    pub fn pace_pairs(&self) -> Vec<PaceSecurityInfoPair<'_>> {
        if self.pace_infos.len() == 1 && self.pace_domain_parameter_infos.len() <= 1 {
            return vec![PaceSecurityInfoPair {
                pace_info: &self.pace_infos[0],
                domain_parameter_info: self.pace_domain_parameter_infos.first(),
            }];
        }

        self.pace_infos.iter()
            .map(|pace_info| {
                let domain_parameter_info = pace_info.parameter_id
                    .and_then(|id| self.pace_domain_parameter_infos.iter().find(|dp| dp.parameter_id == Some(id)));
                PaceSecurityInfoPair { pace_info, domain_parameter_info }
            })
            .collect()
    }

    /// Pairs the PACEInfos whose protocol is among `accepted_protocols`, keeping the card's order.
    pub fn accepted_pace_pairs(&self, accepted_protocols: &[&Oid]) -> Vec<PaceSecurityInfoPair<'_>> {
        self.pace_pairs()
            .into_iter()
            .filter(|pair| accepted_protocols.iter().any(|accepted| *accepted == &*pair.pace_info.protocol))
            .collect()
    }

    /// Whether the card announces more than one set of PACE domain parameters, which obliges the
    /// terminal to name the set it uses.
    pub fn has_ambiguous_pace_parameters(&self) -> bool {
        self.pace_domain_parameter_infos.len() > 1
    }

    /// The first CAInfo matching `accepted_protocols`, along with its domain parameters.
    pub fn accepted_ca_info(&self, accepted_protocols: &[&Oid]) -> Option<(&CaInfo, Option<&CaDomainParameterInfo>)> {
        let ca_info = self.ca_infos.iter()
            .find(|ca| accepted_protocols.iter().any(|accepted| *accepted == &*ca.protocol))?;
        let domain_parameter_info = if self.ca_infos.len() == 1 && self.ca_domain_parameter_infos.len() == 1 {
            self.ca_domain_parameter_infos.first()
        } else {
            self.ca_domain_parameter_infos.iter().find(|dp| dp.key_id == ca_info.key_id)
        };
        Some((ca_info, domain_parameter_info))
    }
}


fn decode_algorithm_identifier(algorithm_identifier: &Tlv) -> Result<DomainParameters, DecodeError> {
    if algorithm_identifier.tag() != tags::SEQUENCE {
        return Err(DecodeError::UnexpectedTag { expected: tags::SEQUENCE, found: algorithm_identifier.tag() });
    }
    let mut parser = algorithm_identifier.parser();
    let algorithm = parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;

    if &*algorithm == oids::STANDARDIZED_DOMAIN_PARAMETERS {
        let parameter_id = parser.expect(tags::INTEGER)?.to_u64()?;
        Ok(DomainParameters::Standardized(parameter_id))
    } else if &*algorithm == oids::EC_PUBLIC_KEY {
        if parser.match_tag(tags::OBJECT_IDENTIFIER) {
            return Err(DecodeError::InvalidValue {
                tag: tags::OBJECT_IDENTIFIER,
                reason: "named curves are not supported in SecurityInfos",
            });
        }
        let parameters = decode_ec_parameters(parser.expect(tags::SEQUENCE)?)?;
        Ok(DomainParameters::EllipticCurve(parameters))
    } else if &*algorithm == oids::DH_PUBLIC_NUMBER {
        let sequence = parser.expect(tags::SEQUENCE)?;
        let mut dh_parser = sequence.parser();
        let prime = dh_parser.expect(tags::INTEGER)?.to_unsigned_bytes()?.to_vec();
        let generator = dh_parser.expect(tags::INTEGER)?.to_unsigned_bytes()?.to_vec();
        let order = dh_parser.expect(tags::INTEGER)?.to_unsigned_bytes()?.to_vec();
        // j and validationParms are of no interest
        Ok(DomainParameters::DiffieHellman(DhParameters { prime, generator, order }))
    } else {
        Ok(DomainParameters::Other(algorithm))
    }
}


/// ```plain
/// ECParameters ::= SEQUENCE {
///     version INTEGER { ecpVer1(1) },
///     fieldID FieldID {{FieldTypes}},
///     curve Curve,
///     base ECPoint,
///     order INTEGER,
///     cofactor INTEGER OPTIONAL
/// }
/// ```
fn decode_ec_parameters(sequence: &Tlv) -> Result<EcParameters, DecodeError> {
    let mut parser = sequence.parser();
    let version_tlv = parser.expect(tags::INTEGER)?;
    if version_tlv.to_u64()? != 1 {
        return Err(DecodeError::InvalidValue { tag: tags::INTEGER, reason: "unknown ECParameters version" });
    }

    let field_id = parser.expect(tags::SEQUENCE)?;
    let mut field_parser = field_id.parser();
    let field_type = field_parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;
    if &*field_type != oids::PRIME_FIELD {
        return Err(DecodeError::InvalidValue { tag: tags::OBJECT_IDENTIFIER, reason: "only prime fields are supported" });
    }
    let prime = field_parser.expect(tags::INTEGER)?.to_unsigned_bytes()?.to_vec();

    let curve = parser.expect(tags::SEQUENCE)?;
    let mut curve_parser = curve.parser();
    let coefficient_a = octet_string(curve_parser.expect(tags::OCTET_STRING)?)?;
    let coefficient_b = octet_string(curve_parser.expect(tags::OCTET_STRING)?)?;

    let base = octet_string(parser.expect(tags::OCTET_STRING)?)?;
    let order = parser.expect(tags::INTEGER)?.to_unsigned_bytes()?.to_vec();
    let cofactor = parser.optional(tags::INTEGER)
        .map(|tlv| tlv.to_u64())
        .transpose()?;

    Ok(EcParameters {
        prime,
        coefficient_a: strip_leading_zeroes(&coefficient_a),
        coefficient_b: strip_leading_zeroes(&coefficient_b),
        base,
        order,
        cofactor,
    })
}


fn decode_file_id(sequence: &Tlv) -> Result<FileId, DecodeError> {
    let mut parser = sequence.parser();
    let fid_bytes = octet_string(parser.expect(tags::OCTET_STRING)?)?;
    let fid = match fid_bytes.as_slice() {
        [hi, lo] => u16::from_be_bytes([*hi, *lo]),
        _ => return Err(DecodeError::InvalidValue { tag: tags::OCTET_STRING, reason: "file identifier must be two bytes" }),
    };
    let short_fid = match parser.optional(tags::OCTET_STRING) {
        None => None,
        Some(tlv) => match octet_string(tlv)?.as_slice() {
            [sfid] => Some(*sfid),
            _ => return Err(DecodeError::InvalidValue { tag: tags::OCTET_STRING, reason: "short file identifier must be one byte" }),
        },
    };
    Ok(FileId { fid, short_fid })
}


fn octet_string(tlv: &Tlv) -> Result<Vec<u8>, DecodeError> {
    tlv.primitive_value()
        .map(|value| value.to_vec())
        .ok_or(DecodeError::InvalidValue { tag: tlv.tag(), reason: "constructed string" })
}

fn decode_bit_string(tlv: &Tlv) -> Result<Vec<u8>, DecodeError> {
    let value = octet_string(tlv)?;
    match value.split_first() {
        Some((0x00, bits)) => Ok(bits.to_vec()),
        _ => Err(DecodeError::InvalidValue { tag: tags::BIT_STRING, reason: "public key must be whole bytes" }),
    }
}

fn strip_leading_zeroes(bytes: &[u8]) -> Vec<u8> {
    let first_significant = bytes.iter()
        .position(|b| *b != 0x00)
        .unwrap_or(bytes.len());
    bytes[first_significant..].to_vec()
}


/// Extracts the encapsulated content of a CMS `ContentInfo` carrying `SignedData`.
fn unwrap_signed_data(content_info: &Tlv) -> Result<Vec<u8>, DecodeError> {
    if content_info.tag() != tags::SEQUENCE {
        return Err(DecodeError::UnexpectedTag { expected: tags::SEQUENCE, found: content_info.tag() });
    }
    let mut parser = content_info.parser();
    let content_type = parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;
    if &*content_type != oids::CMS_SIGNED_DATA {
        return Err(DecodeError::InvalidValue { tag: tags::OBJECT_IDENTIFIER, reason: "content is not SignedData" });
    }
    let explicit_content = parser.expect(EXPLICIT_0)?;
    let signed_data = explicit_content.parser().expect(tags::SEQUENCE)?;

    let mut signed_parser = signed_data.parser();
    signed_parser.expect(tags::INTEGER)?; // version
    signed_parser.expect(tags::SET)?; // digestAlgorithms
    let encap_content_info = signed_parser.expect(tags::SEQUENCE)?;

    let mut encap_parser = encap_content_info.parser();
    let econtent_type = encap_parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;
    if &*econtent_type != oids::SECURITY_OBJECT {
        debug!("EF.CardSecurity carries unexpected content type {}", oid_to_dotted(&econtent_type));
    }
    let explicit_econtent = encap_parser.expect(EXPLICIT_0)?;
    let econtent = explicit_econtent.parser().expect(tags::OCTET_STRING)?;
    octet_string(econtent)
}
