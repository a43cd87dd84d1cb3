//! Chip Authentication version 2 (BSI TR-03110 Part 3 section 3.4).
//!
//! The chip proves possession of the static key published in EF.CardSecurity by agreeing on a
//! key with the terminal's ephemeral key. The chip answers with a nonce and an authentication
//! token; the service checks the token and derives fresh Secure Messaging keys, which supersede
//! those of PACE.


use rasn::types::{ObjectIdentifier, Oid};
use tracing::{debug, info, instrument, warn};

use crate::der_util::{oid_to_der_bytes, oid_to_dotted};
use crate::eac::{Error, Operation};
use crate::eac::ta::point_coordinates;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{transmit, SmartCard};
use crate::iso7816::file::{read_file_with, EF_CARD_SECURITY};
use crate::oids;
use crate::secure_messaging::SecureChannel;
use crate::security_info::{CaDomainParameterInfo, SecurityInfos};
use crate::tlv::{DecodeError, Tag, Tlv};


const TAG_MECHANISM: Tag = Tag::from_raw(0x80);
const TAG_PRIVATE_KEY_REFERENCE: Tag = Tag::from_raw(0x84);
const TAG_DYNAMIC_AUTHENTICATION_DATA: Tag = Tag::from_raw(0x7C);
const TAG_EPHEMERAL_PUBLIC_KEY: Tag = Tag::from_raw(0x80);
const TAG_NONCE: Tag = Tag::from_raw(0x81);
const TAG_TOKEN: Tag = Tag::from_raw(0x82);


/// The chip's answer, which the service needs to derive the new session keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChipAuthenticationOutcome {
    pub protocol: ObjectIdentifier,
    pub key_id: Option<u64>,
    /// The domain parameters the card announces for the key, which the terminal's ephemeral key
    /// has to be on.
    pub domain_parameter_info: Option<CaDomainParameterInfo>,
    pub nonce: Vec<u8>,
    pub token: Vec<u8>,
    /// EF.CardSecurity as read from the card; its signature vouches for the chip's static key.
    pub card_security: Vec<u8>,
}


fn expect_success(operation: Operation, response: &Response) -> Result<(), Error> {
    if response.trailer.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed { operation, status_word: response.trailer.to_word() })
    }
}


/// Reads and decodes EF.CardSecurity.
pub fn read_card_security<SC: SmartCard + ?Sized>(card: &mut SC, extended_length: bool) -> Result<(Vec<u8>, SecurityInfos), Error> {
    let card_security = read_file_with(card, EF_CARD_SECURITY, extended_length)?;
    let security_infos = SecurityInfos::decode_card_security(&card_security)?;
    Ok((card_security, security_infos))
}


/// Selects the protocol and the chip's static key with MSE:SET AT.
pub fn set_authentication_template<SC: SmartCard + ?Sized>(card: &mut SC, protocol: &Oid, key_id: Option<u64>) -> Result<(), Error> {
    let mut request_data = Tlv::primitive(TAG_MECHANISM, oid_to_der_bytes(protocol)).to_bytes();
    if let Some(key_id) = key_id {
        Tlv::primitive(TAG_PRIVATE_KEY_REFERENCE, minimal_be_bytes(key_id))
            .encode(&mut request_data);
    }

    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x22, // MANAGE SECURITY ENVIRONMENT
            p1: 0b0100_0001, // compute/decrypt/intauth, set
            p2: 0xA4, // control reference template for authentication
        },
        data: Data::new(request_data, None, false),
    };
    let response = transmit(card, &request)?;
    expect_success(Operation::SetChipAuthenticationTemplate, &response)
}


/// Sends the terminal's ephemeral public key and returns the chip's nonce and token.
///
/// Elliptic curve points are sent uncompressed, with the `04` marker added if missing.
pub fn general_authenticate<SC: SmartCard + ?Sized>(
    card: &mut SC,
    ephemeral_public_key: &[u8],
    elliptic: bool,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let key = if elliptic {
        let coordinates = point_coordinates(ephemeral_public_key)
            .ok_or(Error::InvalidEphemeralKey)?;
        let mut point = Vec::with_capacity(coordinates.len() + 1);
        point.push(0x04);
        point.extend(coordinates);
        point
    } else {
        ephemeral_public_key.to_vec()
    };

    let request_data = Tlv::constructed(TAG_DYNAMIC_AUTHENTICATION_DATA, vec![
        Tlv::primitive(TAG_EPHEMERAL_PUBLIC_KEY, key),
    ]).to_bytes();
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x86, // GENERAL AUTHENTICATE
            p1: 0x00, // algorithm is known (from "set authentication template")
            p2: 0x00, // key index is known (from "set authentication template")
        },
        data: Data::new(request_data, Some(256), false),
    };
    let response = transmit(card, &request)?;
    expect_success(Operation::ChipAuthenticate, &response)?;

    let data = Tlv::decode_exact(&response.data)?;
    if data.tag() != TAG_DYNAMIC_AUTHENTICATION_DATA {
        return Err(DecodeError::UnexpectedTag { expected: TAG_DYNAMIC_AUTHENTICATION_DATA, found: data.tag() }.into());
    }
    let mut parser = data.parser();
    let primitive = |tlv: &Tlv| tlv.primitive_value()
        .map(|v| v.to_vec())
        .ok_or(DecodeError::InvalidValue { tag: tlv.tag(), reason: "expected primitive value" });
    let nonce = primitive(parser.expect(TAG_NONCE)?)?;
    let token = primitive(parser.expect(TAG_TOKEN)?)?;
    Ok((nonce, token))
}


/// Runs Chip Authentication with the first accepted CAInfo of EF.CardSecurity.
#[instrument(skip(card, accepted_protocols, ephemeral_public_key))]
pub fn chip_authenticate<SC: SmartCard + ?Sized>(
    card: &mut SC,
    accepted_protocols: &[&Oid],
    ephemeral_public_key: &[u8],
    extended_length: bool,
) -> Result<ChipAuthenticationOutcome, Error> {
    let (card_security, security_infos) = read_card_security(card, extended_length)?;
    let (ca_info, domain_parameter_info) = security_infos.accepted_ca_info(accepted_protocols)
        .ok_or(Error::UnsupportedChipAuthentication)?;
    debug!("using {} with key {:?}", oid_to_dotted(&ca_info.protocol), ca_info.key_id);

    set_authentication_template(card, &ca_info.protocol, ca_info.key_id)?;
    let elliptic = oids::is_ca_ecdh(&ca_info.protocol);
    let (nonce, token) = general_authenticate(card, ephemeral_public_key, elliptic)?;
    info!("chip answered Chip Authentication");

    Ok(ChipAuthenticationOutcome {
        protocol: ca_info.protocol.clone(),
        key_id: ca_info.key_id,
        domain_parameter_info: domain_parameter_info.cloned(),
        nonce,
        token,
        card_security,
    })
}


/// Tears down the PACE channel once Chip Authentication has replaced its keys.
///
/// The session keys are wiped. A transport that runs the channel itself is asked to drop it too;
/// if that fails, the next channel established over it replaces the old one anyway.
pub fn destroy_channel<SC: SmartCard>(channel: SecureChannel<SC>) -> SC {
    let mut card = channel.into_inner();
    if let Err(e) = card.destroy_secure_channel() {
        warn!("failed to destroy the PACE channel: {}", e);
    }
    card
}


fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first_significant = bytes.iter()
        .position(|b| *b != 0x00)
        .unwrap_or(bytes.len() - 1);
    bytes[first_significant..].to_vec()
}


#[cfg(test)]
mod tests {
    use super::{general_authenticate, minimal_be_bytes, set_authentication_template};
    use crate::eac::{Error, Operation};
    use crate::iso7816::apdu::{Apdu, Response};
    use crate::iso7816::card::{CommunicationError, SmartCard};
    use crate::oids;
    use hex_literal::hex;

    /// Answers one expected command; anything else is refused.
    struct OneShotCard {
        expected: Vec<u8>,
        answer: Vec<u8>,
    }
    impl SmartCard for OneShotCard {
        fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
            if request.to_bytes().unwrap() == self.expected {
                Ok(Response::from_slice(&self.answer).unwrap())
            } else {
                Ok(Response::new(Vec::new(), 0x6988))
            }
        }
    }

    #[test]
    fn key_references() {
        assert_eq!(minimal_be_bytes(0), vec![0x00]);
        assert_eq!(minimal_be_bytes(1), vec![0x01]);
        assert_eq!(minimal_be_bytes(0x0140), vec![0x01, 0x40]);
    }

    #[test]
    fn set_template_with_key_id() {
        let mut card = OneShotCard {
            expected: hex!("00 22 41 A4 0F 80 0A 04007F00070202030202 84 01 41").to_vec(),
            answer: hex!("9000").to_vec(),
        };
        set_authentication_template(&mut card, oids::CA_ECDH_AES_CBC_CMAC_128, Some(0x41)).unwrap();
    }

    #[test]
    fn nonce_and_token() {
        let mut card = OneShotCard {
            expected: hex!("00 86 00 00 09 7C 07 80 05 04 01020304 00").to_vec(),
            answer: hex!("7C 14 81 08 0001020304050607 82 08 1011121314151617 9000").to_vec(),
        };
        // the marker is added
        let (nonce, token) = general_authenticate(&mut card, &hex!("01020304"), true).unwrap();
        assert_eq!(nonce, hex!("0001020304050607"));
        assert_eq!(token, hex!("1011121314151617"));
    }

    #[test]
    fn refused_by_card() {
        let mut card = OneShotCard {
            expected: Vec::new(),
            answer: Vec::new(),
        };
        assert!(matches!(
            general_authenticate(&mut card, &hex!("04 01020304"), true),
            Err(Error::OperationFailed { operation: Operation::ChipAuthenticate, status_word: 0x6988 }),
        ));
    }
}
