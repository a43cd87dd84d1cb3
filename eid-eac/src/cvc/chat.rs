//! Certificate Holder Authorization Templates.
//!
//! A CHAT names the type of terminal (by object identifier) and carries a bit string whose two
//! most significant bits encode the role of the certificate holder and whose remaining bits grant
//! individual access rights. Bits are numbered from the least significant bit of the last byte,
//! as in BSI TR-03110 Part 3 Appendix C.4.


use std::fmt;

use rasn::types::Oid;

use crate::der_util::oid_to_der_bytes;
use crate::oids;
use crate::tlv::{DecodeError, Tag, Tlv, tags};


pub const CERTIFICATE_HOLDER_AUTHORIZATION_TEMPLATE: Tag = Tag::from_raw(0x7F4C);
const DISCRETIONARY_DATA: Tag = Tag::from_raw(0x53);

const ROLE_MASK: u8 = 0b1100_0000;


/// The kind of terminal a CHAT applies to.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TerminalType {
    InspectionSystem,
    AuthenticationTerminal,
    SignatureTerminal,
}
impl TerminalType {
    pub fn object_identifier(&self) -> &'static Oid {
        match self {
            Self::InspectionSystem => oids::INSPECTION_SYSTEM,
            Self::AuthenticationTerminal => oids::AUTHENTICATION_TERMINAL,
            Self::SignatureTerminal => oids::SIGNATURE_TERMINAL,
        }
    }

    pub fn from_object_identifier(oid: &Oid) -> Option<Self> {
        if oid == oids::INSPECTION_SYSTEM {
            Some(Self::InspectionSystem)
        } else if oid == oids::AUTHENTICATION_TERMINAL {
            Some(Self::AuthenticationTerminal)
        } else if oid == oids::SIGNATURE_TERMINAL {
            Some(Self::SignatureTerminal)
        } else {
            None
        }
    }

    /// The length of the discretionary data of a CHAT for this terminal type, in bytes.
    pub const fn template_length(&self) -> usize {
        match self {
            Self::InspectionSystem => 1,
            Self::AuthenticationTerminal => 5,
            Self::SignatureTerminal => 1,
        }
    }
}
impl fmt::Display for TerminalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InspectionSystem => write!(f, "inspection system"),
            Self::AuthenticationTerminal => write!(f, "authentication terminal"),
            Self::SignatureTerminal => write!(f, "signature terminal"),
        }
    }
}


/// The role of a certificate holder within the public key infrastructure.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Role {
    CountryVerifyingCa,
    OfficialDocumentVerifier,
    NonOfficialDocumentVerifier,
    Terminal,
}
impl Role {
    pub const fn from_first_byte(byte: u8) -> Self {
        match byte & ROLE_MASK {
            0b1100_0000 => Self::CountryVerifyingCa,
            0b1000_0000 => Self::OfficialDocumentVerifier,
            0b0100_0000 => Self::NonOfficialDocumentVerifier,
            _ => Self::Terminal,
        }
    }

    pub const fn to_bits(&self) -> u8 {
        match self {
            Self::CountryVerifyingCa => 0b1100_0000,
            Self::OfficialDocumentVerifier => 0b1000_0000,
            Self::NonOfficialDocumentVerifier => 0b0100_0000,
            Self::Terminal => 0b0000_0000,
        }
    }
}
impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountryVerifyingCa => write!(f, "CVCA"),
            Self::OfficialDocumentVerifier => write!(f, "official DV"),
            Self::NonOfficialDocumentVerifier => write!(f, "non-official DV"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}


/// A single right that a CHAT can grant.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AccessRight {
    /// Write access to eID data group 17 to 21.
    WriteDataGroup(u8),

    /// Read access to eID data group 1 to 21.
    ReadDataGroup(u8),

    InstallQualifiedCertificate,
    InstallCertificate,
    PinManagement,
    CanAllowed,
    PrivilegedTerminal,
    RestrictedIdentification,
    CommunityIdVerification,
    AgeVerification,

    /// Read access to ePassport DG4 (inspection systems).
    ReadIris,

    /// Read access to ePassport DG3 (inspection systems).
    ReadFingerprint,

    GenerateQualifiedSignature,
    GenerateSignature,
}
impl AccessRight {
    const AUTHENTICATION_SPECIAL_FUNCTIONS: [Self; 8] = [
        Self::AgeVerification,
        Self::CommunityIdVerification,
        Self::RestrictedIdentification,
        Self::PrivilegedTerminal,
        Self::CanAllowed,
        Self::PinManagement,
        Self::InstallCertificate,
        Self::InstallQualifiedCertificate,
    ];

    /// The bit granting this right in a CHAT of the given terminal type, or `None` if terminals
    /// of that type cannot be granted this right.
    pub fn bit(&self, terminal_type: TerminalType) -> Option<u32> {
        match (terminal_type, *self) {
            (TerminalType::AuthenticationTerminal, Self::WriteDataGroup(dg)) if (17..=21).contains(&dg)
                => Some(54 - u32::from(dg)),
            (TerminalType::AuthenticationTerminal, Self::ReadDataGroup(dg)) if (1..=21).contains(&dg)
                => Some(u32::from(dg) + 7),
            (TerminalType::AuthenticationTerminal, special) => Self::AUTHENTICATION_SPECIAL_FUNCTIONS
                .iter()
                .position(|f| *f == special)
                .and_then(|p| u32::try_from(p).ok()),
            (TerminalType::InspectionSystem, Self::ReadIris) => Some(1),
            (TerminalType::InspectionSystem, Self::ReadFingerprint) => Some(0),
            (TerminalType::SignatureTerminal, Self::GenerateQualifiedSignature) => Some(1),
            (TerminalType::SignatureTerminal, Self::GenerateSignature) => Some(0),
            _ => None,
        }
    }

    /// Every right that terminals of the given type can be granted, in descending bit order.
    pub fn all(terminal_type: TerminalType) -> Vec<Self> {
        match terminal_type {
            TerminalType::AuthenticationTerminal => {
                let mut ret = Vec::with_capacity(34);
                ret.extend((17..=21).map(Self::WriteDataGroup));
                ret.extend((1..=21).rev().map(Self::ReadDataGroup));
                ret.extend(Self::AUTHENTICATION_SPECIAL_FUNCTIONS.iter().rev());
                ret
            },
            TerminalType::InspectionSystem => vec![Self::ReadIris, Self::ReadFingerprint],
            TerminalType::SignatureTerminal => vec![Self::GenerateQualifiedSignature, Self::GenerateSignature],
        }
    }
}
impl fmt::Display for AccessRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteDataGroup(dg) => write!(f, "write DG{:02}", dg),
            Self::ReadDataGroup(dg) => write!(f, "read DG{:02}", dg),
            Self::InstallQualifiedCertificate => write!(f, "install qualified certificate"),
            Self::InstallCertificate => write!(f, "install certificate"),
            Self::PinManagement => write!(f, "PIN management"),
            Self::CanAllowed => write!(f, "CAN allowed"),
            Self::PrivilegedTerminal => write!(f, "privileged terminal"),
            Self::RestrictedIdentification => write!(f, "restricted identification"),
            Self::CommunityIdVerification => write!(f, "community ID verification"),
            Self::AgeVerification => write!(f, "age verification"),
            Self::ReadIris => write!(f, "read iris (DG4)"),
            Self::ReadFingerprint => write!(f, "read fingerprint (DG3)"),
            Self::GenerateQualifiedSignature => write!(f, "generate qualified electronic signature"),
            Self::GenerateSignature => write!(f, "generate electronic signature"),
        }
    }
}


/// A Certificate Holder Authorization Template.
///
/// `7F4C { 06 terminal type, 53 discretionary data }`
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Chat {
    terminal_type: TerminalType,
    template: Vec<u8>,
}
impl Chat {
    pub fn new(terminal_type: TerminalType, template: Vec<u8>) -> Result<Self, DecodeError> {
        if template.len() != terminal_type.template_length() {
            return Err(DecodeError::InvalidValue {
                tag: DISCRETIONARY_DATA,
                reason: "template length does not match terminal type",
            });
        }
        Ok(Self { terminal_type, template })
    }

    /// A template with the given role and no access rights.
    pub fn empty(terminal_type: TerminalType, role: Role) -> Self {
        let mut template = vec![0x00; terminal_type.template_length()];
        template[0] = role.to_bits();
        Self { terminal_type, template }
    }

    pub fn decode(tlv: &Tlv) -> Result<Self, DecodeError> {
        if tlv.tag() != CERTIFICATE_HOLDER_AUTHORIZATION_TEMPLATE {
            return Err(DecodeError::UnexpectedTag {
                expected: CERTIFICATE_HOLDER_AUTHORIZATION_TEMPLATE,
                found: tlv.tag(),
            });
        }
        let mut parser = tlv.parser();
        let oid_tlv = parser.expect(tags::OBJECT_IDENTIFIER)?;
        let terminal_type = TerminalType::from_object_identifier(&oid_tlv.to_oid()?)
            .ok_or(DecodeError::InvalidValue { tag: tags::OBJECT_IDENTIFIER, reason: "unknown terminal type" })?;
        let template = parser.expect(DISCRETIONARY_DATA)?
            .primitive_value()
            .ok_or(DecodeError::InvalidValue { tag: DISCRETIONARY_DATA, reason: "expected a primitive value" })?
            .to_vec();
        parser.expect_end()?;
        Self::new(terminal_type, template)
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&Tlv::decode_exact(bytes)?)
    }

    pub fn to_tlv(&self) -> Tlv {
        Tlv::constructed(
            CERTIFICATE_HOLDER_AUTHORIZATION_TEMPLATE,
            vec![
                Tlv::primitive(tags::OBJECT_IDENTIFIER, oid_to_der_bytes(self.terminal_type.object_identifier())),
                Tlv::primitive(DISCRETIONARY_DATA, self.template.clone()),
            ],
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_tlv().to_bytes()
    }

    pub fn terminal_type(&self) -> TerminalType { self.terminal_type }
    pub fn template(&self) -> &[u8] { &self.template }

    pub fn role(&self) -> Role {
        Role::from_first_byte(self.template[0])
    }

    fn bit_location(&self, bit: u32) -> Option<(usize, u8)> {
        let byte_from_end = usize::try_from(bit / 8).ok()?;
        let index = self.template.len().checked_sub(1 + byte_from_end)?;
        Some((index, 1 << (bit % 8)))
    }

    pub fn has_right(&self, right: AccessRight) -> bool {
        right.bit(self.terminal_type)
            .and_then(|bit| self.bit_location(bit))
            .map(|(index, mask)| self.template[index] & mask != 0)
            .unwrap_or(false)
    }

    /// Grants or revokes a right. Returns `false` if the right does not apply to this terminal
    /// type.
    pub fn set_right(&mut self, right: AccessRight, granted: bool) -> bool {
        let Some((index, mask)) = right.bit(self.terminal_type).and_then(|bit| self.bit_location(bit)) else {
            return false;
        };
        if granted {
            self.template[index] |= mask;
        } else {
            self.template[index] &= !mask;
        }
        true
    }

    /// The granted rights, in descending bit order.
    pub fn rights(&self) -> Vec<AccessRight> {
        AccessRight::all(self.terminal_type)
            .into_iter()
            .filter(|r| self.has_right(*r))
            .collect()
    }

    /// Caps these rights by those of `other`: the result has exactly the bits set in both.
    ///
    /// Templates of different terminal types share no rights; the result is then empty.
    pub fn restrict_access_rights(&self, other: &Chat) -> Chat {
        if self.terminal_type != other.terminal_type {
            return Self {
                terminal_type: self.terminal_type,
                template: vec![0x00; self.template.len()],
            };
        }
        let template = self.template.iter()
            .zip(other.template.iter())
            .map(|(a, b)| a & b)
            .collect();
        Self {
            terminal_type: self.terminal_type,
            template,
        }
    }

    /// Whether every access right of `other` is also granted by this template. Role bits are not
    /// compared.
    pub fn covers(&self, other: &Chat) -> bool {
        if self.terminal_type != other.terminal_type {
            return false;
        }
        self.template.iter()
            .zip(other.template.iter())
            .enumerate()
            .all(|(i, (mine, theirs))| {
                let mask = if i == 0 { !ROLE_MASK } else { 0xFF };
                theirs & mask & !mine == 0
            })
    }
}
impl fmt::Display for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.terminal_type, self.role())?;
        for right in self.rights() {
            write!(f, ", {}", right)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::{AccessRight, Chat, Role, TerminalType};
    use crate::tlv::{DecodeError, Tag};
    use hex_literal::hex;
    use proptest::prelude::*;

    #[test]
    fn decode_authentication_terminal() {
        // terminal, read DG01 to DG09, age verification, restricted identification
        let chat = Chat::decode_bytes(&hex!("7F4C 12 06 09 04007F00070301020253 05 000001FF05")).unwrap();
        assert_eq!(chat.terminal_type(), TerminalType::AuthenticationTerminal);
        assert_eq!(chat.role(), Role::Terminal);
        assert!(chat.has_right(AccessRight::ReadDataGroup(1)));
        assert!(chat.has_right(AccessRight::ReadDataGroup(9)));
        assert!(!chat.has_right(AccessRight::ReadDataGroup(10)));
        assert!(chat.has_right(AccessRight::ReadDataGroup(2)));
        assert!(chat.has_right(AccessRight::AgeVerification));
        assert!(chat.has_right(AccessRight::RestrictedIdentification));
        assert!(!chat.has_right(AccessRight::CommunityIdVerification));
        assert!(!chat.has_right(AccessRight::PinManagement));
        assert!(!chat.has_right(AccessRight::WriteDataGroup(17)));
        assert!(!chat.has_right(AccessRight::ReadIris));
        assert_eq!(chat.rights().len(), 11);
        assert_eq!(chat.to_bytes(), hex!("7F4C 12 06 09 04007F00070301020253 05 000001FF05"));
    }

    #[test]
    fn bit_positions() {
        let mut chat = Chat::empty(TerminalType::AuthenticationTerminal, Role::Terminal);
        assert!(chat.set_right(AccessRight::WriteDataGroup(17), true));
        assert_eq!(chat.template(), &hex!("20 00 00 00 00"));
        assert!(chat.set_right(AccessRight::WriteDataGroup(21), true));
        assert_eq!(chat.template(), &hex!("22 00 00 00 00"));
        assert!(chat.set_right(AccessRight::ReadDataGroup(21), true));
        assert_eq!(chat.template(), &hex!("22 10 00 00 00"));
        assert!(chat.set_right(AccessRight::ReadDataGroup(1), true));
        assert!(chat.set_right(AccessRight::InstallQualifiedCertificate, true));
        assert_eq!(chat.template(), &hex!("22 10 00 01 80"));
        assert!(chat.set_right(AccessRight::InstallQualifiedCertificate, false));
        assert_eq!(chat.template(), &hex!("22 10 00 01 00"));

        assert!(!chat.set_right(AccessRight::ReadDataGroup(22), true));
        assert!(!chat.set_right(AccessRight::WriteDataGroup(16), true));
        assert!(!chat.set_right(AccessRight::GenerateSignature, true));

        let mut is = Chat::empty(TerminalType::InspectionSystem, Role::CountryVerifyingCa);
        assert!(is.set_right(AccessRight::ReadIris, true));
        assert_eq!(is.template(), &hex!("C2"));
        assert_eq!(is.role(), Role::CountryVerifyingCa);
        assert_eq!(is.rights(), vec![AccessRight::ReadIris]);
    }

    #[test]
    fn wrong_template_length() {
        assert_eq!(
            Chat::decode_bytes(&hex!("7F4C 0E 06 09 04007F00070301020253 01 00")),
            Err(DecodeError::InvalidValue {
                tag: Tag::from_raw(0x53),
                reason: "template length does not match terminal type",
            }),
        );
        assert!(Chat::decode_bytes(&hex!("7F4C 0E 06 09 04007F00070301020953 01 00")).is_err());
        assert!(Chat::decode_bytes(&hex!("7F4C 0E 06 09 04007F000703010202")).is_err());
    }

    #[test]
    fn covers_ignores_role() {
        let mut authorized = Chat::empty(TerminalType::AuthenticationTerminal, Role::Terminal);
        authorized.set_right(AccessRight::ReadDataGroup(4), true);
        authorized.set_right(AccessRight::AgeVerification, true);

        let mut required = Chat::empty(TerminalType::AuthenticationTerminal, Role::CountryVerifyingCa);
        required.set_right(AccessRight::ReadDataGroup(4), true);
        assert!(authorized.covers(&required));

        required.set_right(AccessRight::ReadDataGroup(5), true);
        assert!(!authorized.covers(&required));

        let other_type = Chat::empty(TerminalType::SignatureTerminal, Role::Terminal);
        assert!(!authorized.covers(&other_type));
    }

    #[test]
    fn restricting_different_types() {
        let at = Chat::new(TerminalType::AuthenticationTerminal, hex!("3F FF FF FF FF").to_vec()).unwrap();
        let st = Chat::new(TerminalType::SignatureTerminal, hex!("03").to_vec()).unwrap();
        let restricted = at.restrict_access_rights(&st);
        assert_eq!(restricted.terminal_type(), TerminalType::AuthenticationTerminal);
        assert_eq!(restricted.template(), &[0u8; 5]);
    }

    fn arb_terminal_chats() -> impl Strategy<Value = (Chat, Chat)> {
        prop_oneof![
            Just(TerminalType::AuthenticationTerminal),
            Just(TerminalType::InspectionSystem),
            Just(TerminalType::SignatureTerminal),
        ].prop_flat_map(|terminal_type| {
            let length = terminal_type.template_length();
            (
                proptest::collection::vec(any::<u8>(), length),
                proptest::collection::vec(any::<u8>(), length),
            ).prop_map(move |(a, b)| (
                Chat::new(terminal_type, a).unwrap(),
                Chat::new(terminal_type, b).unwrap(),
            ))
        })
    }

    proptest! {
        #[test]
        fn restriction_is_a_pure_and((a, b) in arb_terminal_chats()) {
            let restricted = a.restrict_access_rights(&b);
            for ((r, x), y) in restricted.template().iter().zip(a.template()).zip(b.template()) {
                prop_assert_eq!(r & !(x & y), 0);
                prop_assert_eq!(*r, x & y);
            }
        }

        #[test]
        fn restriction_is_idempotent((a, b) in arb_terminal_chats()) {
            let once = a.restrict_access_rights(&b);
            let twice = once.restrict_access_rights(&b);
            prop_assert_eq!(once.clone(), twice);
            prop_assert!(a.covers(&once));
            prop_assert!(b.covers(&once));
        }

        #[test]
        fn encoding_round_trips((a, _b) in arb_terminal_chats()) {
            prop_assert_eq!(Chat::decode_bytes(&a.to_bytes()).unwrap(), a);
        }
    }
}
