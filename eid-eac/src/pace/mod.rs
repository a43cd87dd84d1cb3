//! Implementation of Password Authenticated Connection Establishment with Generic Mapping.
//!
//! PACE runs in five steps:
//!
//! 1. MSE:SET AT selects the protocol and the password.
//! 2. GENERAL AUTHENTICATE obtains the nonce, encrypted with a key derived from the password.
//! 3. GENERAL AUTHENTICATE exchanges mapping keys; their shared secret and the nonce map the
//!    domain parameters onto a fresh generator.
//! 4. GENERAL AUTHENTICATE exchanges ephemeral keys under the mapped parameters.
//! 5. GENERAL AUTHENTICATE exchanges authentication tokens over the ephemeral keys.
//!
//! The result is a pair of Secure Messaging session keys.


use std::fmt;

use rasn::types::{ObjectIdentifier, Oid};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::crypt::{self, KeyExchange};
use crate::crypt::cipher_mac::{cipher_and_mac_for, CipherAndMac};
use crate::der_util::{oid_to_der_bytes, oid_to_dotted};
use crate::error::ErrorKind;
use crate::iso7816::apdu::{status, Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{transmit, CommunicationError, SmartCard};
use crate::oids;
use crate::secure_messaging::{SecureChannel, SecureMessaging};
use crate::security_info::SecurityInfos;
use crate::tlv::{DecodeError, Tag, Tlv, tags};


const TAG_DYNAMIC_AUTHENTICATION_DATA: Tag = Tag::from_raw(0x7C);
const TAG_ENCRYPTED_NONCE: Tag = Tag::from_raw(0x80);
const TAG_MAPPING_DATA_TERMINAL: Tag = Tag::from_raw(0x81);
const TAG_MAPPING_DATA_CHIP: Tag = Tag::from_raw(0x82);
const TAG_EPHEMERAL_KEY_TERMINAL: Tag = Tag::from_raw(0x83);
const TAG_EPHEMERAL_KEY_CHIP: Tag = Tag::from_raw(0x84);
const TAG_TOKEN_TERMINAL: Tag = Tag::from_raw(0x85);
const TAG_TOKEN_CHIP: Tag = Tag::from_raw(0x86);
const TAG_CURRENT_CAR: Tag = Tag::from_raw(0x87);
const TAG_PREVIOUS_CAR: Tag = Tag::from_raw(0x88);
const TAG_PUBLIC_KEY: Tag = Tag::from_raw(0x7F49);

/// The number of attempts a fresh password has.
pub const INITIAL_RETRY_COUNTER: u8 = 3;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetAuthenticationTemplate,
    ObtainNonce,
    MapNonce,
    KeyAgreement,
    MutualAuthentication,
}


/// The password used for PACE.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordType {
    /// Key material from the machine readable zone: document number, date of birth and date of
    /// expiry, each with its check digit.
    Mrz,
    /// Card Access Number.
    Can,
    Pin,
    /// PIN Unblocking Key.
    Puk,
}
impl PasswordType {
    /// The password reference sent in MSE:SET AT.
    pub const fn reference(&self) -> u8 {
        match self {
            Self::Mrz => 0x01,
            Self::Can => 0x02,
            Self::Pin => 0x03,
            Self::Puk => 0x04,
        }
    }

    pub const fn from_reference(reference: u8) -> Option<Self> {
        match reference {
            0x01 => Some(Self::Mrz),
            0x02 => Some(Self::Can),
            0x03 => Some(Self::Pin),
            0x04 => Some(Self::Puk),
            _ => None,
        }
    }

    /// The input to the password-to-key derivation.
    ///
    /// The MRZ key material is hashed with SHA-1; all other passwords are used verbatim.
    pub fn key_seed(&self, password: &[u8]) -> Zeroizing<Vec<u8>> {
        match self {
            Self::Mrz => Zeroizing::new(Sha1::digest(password).to_vec()),
            Self::Can|Self::Pin|Self::Puk => Zeroizing::new(password.to_vec()),
        }
    }
}
impl fmt::Display for PasswordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mrz => write!(f, "MRZ"),
            Self::Can => write!(f, "CAN"),
            Self::Pin => write!(f, "PIN"),
            Self::Puk => write!(f, "PUK"),
        }
    }
}


/// The state of a password as reported by the status word of MSE:SET AT.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordStatus {
    Active { retry_counter: u8 },
    /// One attempt is left, which may only be used after authenticating with the CAN.
    Suspended,
    /// No attempts are left; the PUK unblocks the password.
    Blocked,
    /// The password must be reactivated by the issuer.
    Deactivated,
}
impl PasswordStatus {
    pub fn from_status_word(status_word: u16) -> Option<Self> {
        match status_word {
            status::SUCCESS => Some(Self::Active { retry_counter: INITIAL_RETRY_COUNTER }),
            status::DEACTIVATED => Some(Self::Deactivated),
            0x63C0 => Some(Self::Blocked),
            0x63C1 => Some(Self::Suspended),
            sw if sw & 0xFFF0 == 0x63C0 => Some(Self::Active { retry_counter: (sw & 0x000F) as u8 }),
            _ => None,
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordError {
    Wrong { retry_counter: u8 },
    Suspended,
    Blocked,
    Deactivated,
}
impl fmt::Display for PasswordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wrong { retry_counter }
                => write!(f, "the password is wrong ({} attempts left)", retry_counter),
            Self::Suspended
                => write!(f, "the password is suspended and must be resumed using the CAN"),
            Self::Blocked
                => write!(f, "the password is blocked and must be unblocked using the PUK"),
            Self::Deactivated
                => write!(f, "the password is deactivated"),
        }
    }
}
impl std::error::Error for PasswordError {
}


#[derive(Debug)]
pub enum Error {
    NotSupported,
    UnsupportedProtocol { protocol: ObjectIdentifier },
    IncompatibleProtocolParameters { protocol: ObjectIdentifier },
    MissingParameterId,
    Crypto(crypt::Error),
    Communication(CommunicationError),
    OperationFailed { operation: Operation, status_word: u16 },
    Decoding { operation: Operation, error: DecodeError },
    Password(PasswordError),
    EqualMappingKeys,
    EqualEphemeralKeys,
    AuthenticationToken,
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotSupported => ErrorKind::Decode,
            Self::UnsupportedProtocol { .. } => ErrorKind::Decode,
            Self::IncompatibleProtocolParameters { .. } => ErrorKind::Decode,
            Self::MissingParameterId => ErrorKind::Decode,
            Self::Crypto(e) => e.kind(),
            Self::Communication(e) => e.kind(),
            Self::OperationFailed { .. } => ErrorKind::Transport,
            Self::Decoding { .. } => ErrorKind::Decode,
            Self::Password(_) => ErrorKind::Password,
            Self::EqualMappingKeys => ErrorKind::SecurityViolation,
            Self::EqualEphemeralKeys => ErrorKind::SecurityViolation,
            Self::AuthenticationToken => ErrorKind::SecurityViolation,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported
                => write!(f, "the card offers no supported PACE protocol"),
            Self::UnsupportedProtocol { protocol }
                => write!(f, "PACE protocol {} is not supported", oid_to_dotted(protocol)),
            Self::IncompatibleProtocolParameters { protocol }
                => write!(f, "PACE protocol {} is incompatible with its domain parameters", oid_to_dotted(protocol)),
            Self::MissingParameterId
                => write!(f, "PACEInfo names neither explicit nor standardized domain parameters"),
            Self::Crypto(e)
                => write!(f, "cryptographic error: {}", e),
            Self::Communication(e)
                => write!(f, "communication error: {}", e),
            Self::OperationFailed { operation, status_word }
                => write!(f, "operation {:?} failed with response code 0x{:04X}", operation, status_word),
            Self::Decoding { operation, error }
                => write!(f, "failed to decode response to operation {:?}: {}", operation, error),
            Self::Password(e)
                => write!(f, "{}", e),
            Self::EqualMappingKeys
                => write!(f, "terminal and chip mapping keys are equal"),
            Self::EqualEphemeralKeys
                => write!(f, "terminal and chip ephemeral keys are equal"),
            Self::AuthenticationToken
                => write!(f, "the chip's authentication token is incorrect"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotSupported => None,
            Self::UnsupportedProtocol { .. } => None,
            Self::IncompatibleProtocolParameters { .. } => None,
            Self::MissingParameterId => None,
            Self::Crypto(e) => Some(e),
            Self::Communication(e) => Some(e),
            Self::OperationFailed { .. } => None,
            Self::Decoding { error, .. } => Some(error),
            Self::Password(e) => Some(e),
            Self::EqualMappingKeys => None,
            Self::EqualEphemeralKeys => None,
            Self::AuthenticationToken => None,
        }
    }
}
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}
impl From<PasswordError> for Error {
    fn from(value: PasswordError) -> Self { Self::Password(value) }
}


/// A PACE protocol offered by the card along with its domain parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceProtocol {
    pub protocol: ObjectIdentifier,
    pub parameter_id: Option<u64>,
    pub key_exchange: KeyExchange,
    /// Whether MSE:SET AT must name the parameters, because the card offers more than one set.
    pub announce_parameter_id: bool,
}
impl PaceProtocol {
    /// Picks the first protocol in EF.CardAccess that the terminal accepts.
    pub fn select(security_infos: &SecurityInfos, accepted_protocols: &[&Oid]) -> Result<Self, Error> {
        let pair = security_infos.accepted_pace_pairs(accepted_protocols)
            .into_iter()
            .next()
            .ok_or(Error::NotSupported)?;
        let protocol = pair.pace_info.protocol.clone();

        let key_exchange = match pair.domain_parameter_info {
            Some(dpi) => KeyExchange::from_domain_parameters(&dpi.domain_parameter)?,
            None => {
                let parameter_id = pair.pace_info.parameter_id
                    .ok_or(Error::MissingParameterId)?;
                KeyExchange::from_standardized(parameter_id)?
            },
        };

        let elliptic_protocol = oids::is_direct_child(&protocol, oids::PACE_ECDH_GM);
        let classic_protocol = oids::is_direct_child(&protocol, oids::PACE_DH_GM);
        if !elliptic_protocol && !classic_protocol {
            return Err(Error::UnsupportedProtocol { protocol });
        }
        if elliptic_protocol != key_exchange.is_elliptic() {
            return Err(Error::IncompatibleProtocolParameters { protocol });
        }

        Ok(Self {
            protocol,
            parameter_id: pair.pace_info.parameter_id,
            key_exchange,
            announce_parameter_id: security_infos.has_ambiguous_pace_parameters(),
        })
    }
}


/// The result of a successful PACE run.
#[derive(Debug)]
pub struct PaceOutcome {
    pub protocol: ObjectIdentifier,
    pub k_session_enc: Zeroizing<Vec<u8>>,
    pub k_session_mac: Zeroizing<Vec<u8>>,
    /// The most recent CVCA known to the chip.
    pub current_car: Option<Vec<u8>>,
    /// The preceding CVCA, during a key rollover.
    pub previous_car: Option<Vec<u8>>,
    /// The compressed ephemeral public key of the chip.
    pub id_picc: Vec<u8>,
    pub retry_counter: u8,
}
impl PaceOutcome {
    /// Creates the Secure Messaging state for the session keys.
    pub fn secure_messaging(&self) -> Result<SecureMessaging, Error> {
        let cipher_and_mac = cipher_and_mac_for(&self.protocol)
            .ok_or_else(|| Error::UnsupportedProtocol { protocol: self.protocol.clone() })?;
        Ok(SecureMessaging::new(cipher_and_mac, &self.k_session_enc, &self.k_session_mac))
    }

    /// Wraps `card` into the Secure Messaging channel established by PACE.
    pub fn secure_channel<SC: SmartCard>(&self, card: SC) -> Result<SecureChannel<SC>, Error> {
        Ok(SecureChannel::new(card, self.secure_messaging()?))
    }
}


fn general_authenticate(chained: bool, request_data: Vec<u8>) -> Apdu {
    Apdu {
        header: CommandHeader {
            cla: if chained {
                0b000_1_00_00 // not the last in a chain, no secure messaging, logical channel 0
            } else {
                0b000_0_00_00 // last in a chain, no secure messaging, logical channel 0
            },
            ins: 0x86, // GENERAL AUTHENTICATE
            p1: 0x00, // algorithm is known (from "set authentication template")
            p2: 0x00, // key index is known (from "set authentication template")
        },
        data: Data::new(request_data, Some(256), false),
    }
}

/// Wraps a single data object into dynamic authentication data (`7C`).
fn dynamic_authentication_data(tag: Tag, value: &[u8]) -> Vec<u8> {
    Tlv::constructed(TAG_DYNAMIC_AUTHENTICATION_DATA, vec![Tlv::primitive(tag, value)])
        .to_bytes()
}

/// Unwraps the data objects of a GENERAL AUTHENTICATE response.
fn decode_dynamic_authentication_data(operation: Operation, response: &Response) -> Result<Tlv, Error> {
    let tlv = Tlv::decode_exact(&response.data)
        .map_err(|error| Error::Decoding { operation, error })?;
    if tlv.tag() != TAG_DYNAMIC_AUTHENTICATION_DATA {
        return Err(Error::Decoding {
            operation,
            error: DecodeError::UnexpectedTag { expected: TAG_DYNAMIC_AUTHENTICATION_DATA, found: tlv.tag() },
        });
    }
    Ok(tlv)
}

fn expect_success(operation: Operation, response: &Response) -> Result<(), Error> {
    if response.trailer.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed { operation, status_word: response.trailer.to_word() })
    }
}


/// Calculates the authentication token over a public key.
///
/// ```plain
/// 7F49 {
///     06 protocol
///     86 point   (elliptic curves)
///     84 value   (Diffie-Hellman)
/// }
/// ```
fn authentication_token(
    cipher_and_mac: &dyn CipherAndMac,
    protocol: &Oid,
    key_exchange: &KeyExchange,
    public_key: &[u8],
    k_session_mac: &[u8],
) -> Result<Vec<u8>, Error> {
    let public_key_data = Tlv::constructed(TAG_PUBLIC_KEY, vec![
        Tlv::primitive(tags::OBJECT_IDENTIFIER, oid_to_der_bytes(protocol)),
        Tlv::primitive(Tag::from_raw(key_exchange.public_key_tag().into()), public_key),
    ]);
    Ok(cipher_and_mac.mac(&public_key_data.to_bytes(), k_session_mac)?)
}


/// Sends MSE:SET AT for PACE and returns the status word.
fn send_set_authentication_template<SC: SmartCard + ?Sized>(
    card: &mut SC,
    protocol: &Oid,
    password_type: PasswordType,
    parameter_id: Option<u64>,
    chat: Option<&[u8]>,
) -> Result<u16, Error> {
    let mut request_data = Tlv::primitive(Tag::from_raw(0x80), oid_to_der_bytes(protocol)).to_bytes();
    request_data.extend(Tlv::primitive(Tag::from_raw(0x83), [password_type.reference()]).to_bytes());
    if let Some(parameter_id) = parameter_id {
        // a private key reference, i.e. the domain parameters
        let reference = u8::try_from(parameter_id)
            .map_err(|_| Error::Crypto(crypt::Error::UnsupportedStandardizedParameters(parameter_id)))?;
        request_data.extend(Tlv::primitive(Tag::from_raw(0x84), [reference]).to_bytes());
    }
    if let Some(chat) = chat {
        // already encoded as 7F4C
        request_data.extend(chat);
    }

    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x22, // MANAGE SECURITY ENVIRONMENT
            p1: 0b1100_0001, // verify/encrypt/extauth, compute/decrypt/intauth, set
            p2: 0xA4, // control reference template for authentication
        },
        data: Data::new(request_data, None, false),
    };
    let response = transmit(card, &request)?;
    Ok(response.trailer.to_word())
}


/// Selects the protocol and password for PACE.
///
/// Returns the retry counter of the password. A blocked password is only accepted when it is the
/// PUK that is used, a suspended one only with the CAN.
pub fn set_authentication_template<SC: SmartCard + ?Sized>(
    card: &mut SC,
    protocol: &Oid,
    password_type: PasswordType,
    parameter_id: Option<u64>,
    chat: Option<&[u8]>,
) -> Result<u8, Error> {
    let status_word = send_set_authentication_template(card, protocol, password_type, parameter_id, chat)?;
    match PasswordStatus::from_status_word(status_word) {
        Some(PasswordStatus::Active { retry_counter }) => {
            if retry_counter < INITIAL_RETRY_COUNTER {
                warn!("{} has {} attempts left", password_type, retry_counter);
            }
            Ok(retry_counter)
        },
        Some(PasswordStatus::Suspended) => {
            if password_type == PasswordType::Can {
                Ok(1)
            } else {
                warn!("{} is suspended", password_type);
                Err(PasswordError::Suspended.into())
            }
        },
        Some(PasswordStatus::Blocked) => {
            if password_type == PasswordType::Puk {
                Ok(0)
            } else {
                warn!("{} is blocked", password_type);
                Err(PasswordError::Blocked.into())
            }
        },
        Some(PasswordStatus::Deactivated) => Err(PasswordError::Deactivated.into()),
        None => Err(Error::OperationFailed { operation: Operation::SetAuthenticationTemplate, status_word }),
    }
}


/// Queries the state of a password without running PACE.
#[instrument(skip(card))]
pub fn password_status<SC: SmartCard + ?Sized>(
    card: &mut SC,
    protocol: &Oid,
    password_type: PasswordType,
) -> Result<PasswordStatus, Error> {
    let status_word = send_set_authentication_template(card, protocol, password_type, None, None)?;
    PasswordStatus::from_status_word(status_word)
        .ok_or(Error::OperationFailed { operation: Operation::SetAuthenticationTemplate, status_word })
}


/// Obtains the nonce encrypted with the password key.
pub fn obtain_encrypted_nonce<SC: SmartCard + ?Sized>(card: &mut SC) -> Result<Zeroizing<Vec<u8>>, Error> {
    let request = general_authenticate(true, Tlv::constructed(TAG_DYNAMIC_AUTHENTICATION_DATA, Vec::new()).to_bytes());
    let response = transmit(card, &request)?;
    expect_success(Operation::ObtainNonce, &response)?;

    let data = decode_dynamic_authentication_data(Operation::ObtainNonce, &response)?;
    let mut parser = data.parser();
    let nonce = parser.expect(TAG_ENCRYPTED_NONCE)
        .and_then(|nonce| nonce.primitive_value().map(|v| v.to_vec()).ok_or(DecodeError::InvalidValue {
            tag: TAG_ENCRYPTED_NONCE,
            reason: "encrypted nonce must be primitive",
        }))
        .map_err(|error| Error::Decoding { operation: Operation::ObtainNonce, error })?;
    Ok(Zeroizing::new(nonce))
}


/// Sends a public key within dynamic authentication data and returns the chip's public key.
fn exchange_public_keys<SC: SmartCard + ?Sized>(
    card: &mut SC,
    operation: Operation,
    request_tag: Tag,
    response_tag: Tag,
    public_key: &[u8],
) -> Result<Vec<u8>, Error> {
    let request = general_authenticate(true, dynamic_authentication_data(request_tag, public_key));
    let response = transmit(card, &request)?;
    expect_success(operation, &response)?;

    let data = decode_dynamic_authentication_data(operation, &response)?;
    let mut parser = data.parser();
    parser.expect(response_tag)
        .and_then(|key| key.primitive_value().map(|v| v.to_vec()).ok_or(DecodeError::InvalidValue {
            tag: response_tag,
            reason: "public key must be primitive",
        }))
        .map_err(|error| Error::Decoding { operation, error })
}


/// The chip's answer to mutual authentication.
struct ChipToken {
    token: Vec<u8>,
    current_car: Option<Vec<u8>>,
    previous_car: Option<Vec<u8>>,
}

fn mutual_authentication<SC: SmartCard + ?Sized>(card: &mut SC, terminal_token: &[u8]) -> Result<ChipToken, Error> {
    let operation = Operation::MutualAuthentication;
    let request = general_authenticate(false, dynamic_authentication_data(TAG_TOKEN_TERMINAL, terminal_token));
    let response = transmit(card, &request)?;

    let status_word = response.trailer.to_word();
    if status_word != status::SUCCESS {
        // the password is only checked now
        return match PasswordStatus::from_status_word(status_word) {
            Some(PasswordStatus::Active { retry_counter }) => Err(PasswordError::Wrong { retry_counter }.into()),
            Some(PasswordStatus::Suspended) => Err(PasswordError::Suspended.into()),
            Some(PasswordStatus::Blocked) => Err(PasswordError::Blocked.into()),
            Some(PasswordStatus::Deactivated) => Err(PasswordError::Deactivated.into()),
            None => Err(Error::OperationFailed { operation, status_word }),
        };
    }

    let data = decode_dynamic_authentication_data(operation, &response)?;
    let mut parser = data.parser();
    let decode = |tlv: &Tlv| tlv.primitive_value()
        .map(|v| v.to_vec())
        .ok_or(DecodeError::InvalidValue { tag: tlv.tag(), reason: "expected primitive value" });
    let token = parser.expect(TAG_TOKEN_CHIP)
        .and_then(decode)
        .map_err(|error| Error::Decoding { operation, error })?;
    let current_car = parser.optional(TAG_CURRENT_CAR)
        .map(decode)
        .transpose()
        .map_err(|error| Error::Decoding { operation, error })?;
    let previous_car = parser.optional(TAG_PREVIOUS_CAR)
        .map(decode)
        .transpose()
        .map_err(|error| Error::Decoding { operation, error })?;
    Ok(ChipToken { token, current_car, previous_car })
}


/// Runs steps 2 to 5 of PACE with the given private keys.
///
/// `mapping_private_key` is used for the mapping in step 3, `ephemeral_private_key` for the key
/// agreement in step 4. Both must be valid scalars for `key_exchange`.
pub fn perform_generic_mapping_with_values<SC: SmartCard + ?Sized>(
    card: &mut SC,
    protocol: &Oid,
    key_exchange: &KeyExchange,
    password_type: PasswordType,
    password: &[u8],
    encrypted_nonce: &[u8],
    mapping_private_key: &[u8],
    ephemeral_private_key: &[u8],
) -> Result<PaceOutcome, Error> {
    let cipher_and_mac = cipher_and_mac_for(protocol)
        .ok_or_else(|| Error::UnsupportedProtocol { protocol: protocol.to_owned() })?;

    // decrypt the nonce using the password key
    let password_key = cipher_and_mac.derive_key_from_password(&password_type.key_seed(password));
    let nonce_iv = vec![0u8; cipher_and_mac.cipher_block_size()];
    let mut nonce = Zeroizing::new(encrypted_nonce.to_vec());
    cipher_and_mac.decrypt_padded_data(&mut nonce, &password_key, &nonce_iv)?;

    // map the nonce onto new domain parameters
    let session_key_exchange = {
        let mapping_public_key = key_exchange.calculate_public_key(mapping_private_key)?;
        let chip_mapping_public_key = exchange_public_keys(
            card,
            Operation::MapNonce,
            TAG_MAPPING_DATA_TERMINAL,
            TAG_MAPPING_DATA_CHIP,
            &mapping_public_key,
        )?;
        if bool::from(mapping_public_key.ct_eq(&chip_mapping_public_key)) {
            return Err(Error::EqualMappingKeys);
        }
        key_exchange.derive_generic_mapping(&nonce, mapping_private_key, &chip_mapping_public_key)?
    };
    debug!("nonce mapped");

    // key agreement with the mapped parameters
    let public_key = session_key_exchange.calculate_public_key(ephemeral_private_key)?;
    let chip_public_key = exchange_public_keys(
        card,
        Operation::KeyAgreement,
        TAG_EPHEMERAL_KEY_TERMINAL,
        TAG_EPHEMERAL_KEY_CHIP,
        &public_key,
    )?;
    if bool::from(public_key.ct_eq(&chip_public_key)) {
        return Err(Error::EqualEphemeralKeys);
    }
    session_key_exchange.validate_public_key(&chip_public_key)?;
    let shared_secret = session_key_exchange.exchange_keys(ephemeral_private_key, &chip_public_key)?;

    let k_session_enc = cipher_and_mac.derive_encryption_key(&shared_secret);
    let k_session_mac = cipher_and_mac.derive_mac_key(&shared_secret);

    // mutual authentication
    let terminal_token = authentication_token(
        &*cipher_and_mac,
        protocol,
        &session_key_exchange,
        &chip_public_key,
        &k_session_mac,
    )?;
    let expected_chip_token = authentication_token(
        &*cipher_and_mac,
        protocol,
        &session_key_exchange,
        &public_key,
        &k_session_mac,
    )?;
    let chip_token = mutual_authentication(card, &terminal_token)?;
    if !bool::from(chip_token.token.ct_eq(&expected_chip_token)) {
        return Err(Error::AuthenticationToken);
    }

    Ok(PaceOutcome {
        protocol: protocol.to_owned(),
        k_session_enc,
        k_session_mac,
        current_car: chip_token.current_car,
        previous_car: chip_token.previous_car,
        id_picc: session_key_exchange.compress_public_key(&chip_public_key)?,
        retry_counter: INITIAL_RETRY_COUNTER,
    })
}


/// Authenticates with the card using PACE.
///
/// `security_infos` is the content of EF.CardAccess. `chat`, if given, is the encoded certificate
/// holder authorization template (`7F4C`) requested for the subsequent Terminal Authentication.
#[instrument(skip(card, security_infos, accepted_protocols, password, chat))]
pub fn establish<SC: SmartCard + ?Sized>(
    card: &mut SC,
    security_infos: &SecurityInfos,
    accepted_protocols: &[&Oid],
    password_type: PasswordType,
    password: &[u8],
    chat: Option<&[u8]>,
) -> Result<PaceOutcome, Error> {
    let pace_protocol = PaceProtocol::select(security_infos, accepted_protocols)?;
    debug!("selected PACE protocol {}", oid_to_dotted(&pace_protocol.protocol));

    let parameter_id = if pace_protocol.announce_parameter_id {
        pace_protocol.parameter_id
    } else {
        None
    };
    let retry_counter = set_authentication_template(card, &pace_protocol.protocol, password_type, parameter_id, chat)?;

    let encrypted_nonce = obtain_encrypted_nonce(card)?;

    // the mapping does not change the group order, so both keys can be chosen up front
    let mapping_private_key = pace_protocol.key_exchange.generate_private_key();
    let ephemeral_private_key = pace_protocol.key_exchange.generate_private_key();

    let mut outcome = perform_generic_mapping_with_values(
        card,
        &pace_protocol.protocol,
        &pace_protocol.key_exchange,
        password_type,
        password,
        &encrypted_nonce,
        &mapping_private_key,
        &ephemeral_private_key,
    )?;
    outcome.retry_counter = retry_counter;
    info!("PACE established using {}", password_type);
    Ok(outcome)
}


#[cfg(test)]
mod tests {
    use super::{PasswordStatus, PasswordType, PaceProtocol, Error};
    use crate::oids;
    use crate::security_info::SecurityInfos;
    use hex_literal::hex;

    #[test]
    fn password_status_words() {
        assert_eq!(PasswordStatus::from_status_word(0x9000), Some(PasswordStatus::Active { retry_counter: 3 }));
        assert_eq!(PasswordStatus::from_status_word(0x63C2), Some(PasswordStatus::Active { retry_counter: 2 }));
        assert_eq!(PasswordStatus::from_status_word(0x63C1), Some(PasswordStatus::Suspended));
        assert_eq!(PasswordStatus::from_status_word(0x63C0), Some(PasswordStatus::Blocked));
        assert_eq!(PasswordStatus::from_status_word(0x6283), Some(PasswordStatus::Deactivated));
        assert_eq!(PasswordStatus::from_status_word(0x6A80), None);
    }

    #[test]
    fn password_references() {
        for password_type in [PasswordType::Mrz, PasswordType::Can, PasswordType::Pin, PasswordType::Puk] {
            assert_eq!(PasswordType::from_reference(password_type.reference()), Some(password_type));
        }
        assert_eq!(PasswordType::from_reference(0x05), None);
        assert_eq!(PasswordType::Pin.key_seed(b"123456").as_slice(), b"123456");
        assert_eq!(PasswordType::Mrz.key_seed(b"T22000129364081251010318").len(), 20);
    }

    #[test]
    fn protocol_selection() {
        // ECDH GM AES-128 with brainpoolP256r1
        let card_access = hex!("
            31 14
                30 12
                    06 0A 04 00 7F 00 07 02 02 04 02 02
                    02 01 02
                    02 01 0D
        ");
        let security_infos = SecurityInfos::decode(&card_access).unwrap();
        let selected = PaceProtocol::select(&security_infos, &oids::PACE_GM_AES_PROTOCOLS).unwrap();
        assert_eq!(&*selected.protocol, oids::PACE_ECDH_GM_AES_CBC_CMAC_128);
        assert_eq!(selected.parameter_id, Some(13));
        assert!(selected.key_exchange.is_elliptic());
        assert!(!selected.announce_parameter_id);

        assert!(matches!(
            PaceProtocol::select(&security_infos, &[oids::PACE_DH_GM_AES_CBC_CMAC_128]),
            Err(Error::NotSupported),
        ));
    }

    #[test]
    fn mismatched_parameters() {
        // DH protocol with an elliptic curve
        let card_access = hex!("
            31 14
                30 12
                    06 0A 04 00 7F 00 07 02 02 04 01 02
                    02 01 02
                    02 01 0D
        ");
        let security_infos = SecurityInfos::decode(&card_access).unwrap();
        assert!(matches!(
            PaceProtocol::select(&security_infos, &oids::PACE_GM_AES_PROTOCOLS),
            Err(Error::IncompatibleProtocolParameters { .. }),
        ));
    }
}
