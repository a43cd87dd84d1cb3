//! Terminal Authentication version 2 (BSI TR-03110 Part 3 section 3.5).
//!
//! The card is handed the certificate chain link by link, starting below the CVCA it trusts. It
//! then learns which terminal key signs, along with the terminal's ephemeral key for the
//! subsequent Chip Authentication, and issues a challenge the terminal must sign.


use rasn::types::Oid;
use sha1::{Digest, Sha1};
use tracing::{debug, instrument};

use crate::cvc::certificate::{CvCertificate, PublicKeyReference};
use crate::cvc::chain::{self, CertificateChain};
use crate::der_util::oid_to_der_bytes;
use crate::eac::{Error, Operation};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{transmit, SmartCard};
use crate::oids;
use crate::tlv::{Tag, Tlv};


const TAG_MECHANISM: Tag = Tag::from_raw(0x80);
const TAG_PUBLIC_KEY_REFERENCE: Tag = Tag::from_raw(0x83);
const TAG_EPHEMERAL_PUBLIC_KEY: Tag = Tag::from_raw(0x91);

/// Length of the challenge returned by GET CHALLENGE.
pub const CHALLENGE_LENGTH: usize = 8;


/// How far Terminal Authentication has progressed within a session.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TaStage {
    Initial,
    /// The challenge was obtained before the certificates were sent.
    ChallengeIssued { challenge: Vec<u8> },
    /// The card accepted the certificates and waits for the signature over the challenge.
    AwaitingSignature { challenge: Vec<u8> },
    Authenticated,
}


/// What the service contributes to Terminal Authentication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerminalAuthenticationInput {
    /// The terminal's ephemeral public key for Chip Authentication, uncompressed.
    pub ephemeral_public_key: Vec<u8>,

    /// The terminal's signature over the challenge, once known.
    pub signature: Option<Vec<u8>>,
}


/// The result of one call to Terminal Authentication.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TaStep {
    /// The service has to sign this challenge; pass the signature in the next call.
    SignatureRequired { challenge: Vec<u8> },
    Authenticated,
}


fn expect_success(operation: Operation, response: &Response) -> Result<(), Error> {
    if response.trailer.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed { operation, status_word: response.trailer.to_word() })
    }
}


/// Finds the chain the card can verify, starting from its most recent CVCA and falling back to
/// the previous one.
///
/// A chain is only usable if it ends in a terminal certificate. If `verify` is set, the chain's
/// signatures are checked before it is returned.
pub fn select_chain(
    candidates: &CertificateChain,
    current_car: Option<&[u8]>,
    previous_car: Option<&[u8]>,
    verify: bool,
) -> Result<CertificateChain, Error> {
    let mut incomplete = false;
    for car in [current_car, previous_car].into_iter().flatten() {
        let car = PublicKeyReference::new(car)?;
        let chain = candidates.chain_from_car(&car);
        if chain.is_empty() {
            debug!("no chain starts at {}", car);
            continue;
        }
        if chain.terminal_certificate().is_none() {
            debug!("the chain starting at {} ends before a terminal", car);
            incomplete = true;
            continue;
        }
        if verify {
            chain.verify()?;
        }
        debug!("using chain of {} certificates starting at {}", chain.len(), car);
        return Ok(chain);
    }

    if incomplete {
        Err(chain::Error::MissingTerminalCertificate.into())
    } else {
        Err(chain::Error::EmptyChain.into())
    }
}


fn set_digital_signature_template<SC: SmartCard + ?Sized>(card: &mut SC, authority: &PublicKeyReference) -> Result<(), Error> {
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x22, // MANAGE SECURITY ENVIRONMENT
            p1: 0b1000_0001, // verify/encrypt/extauth, set
            p2: 0xB6, // control reference template for digital signature
        },
        data: Data::new(Tlv::primitive(TAG_PUBLIC_KEY_REFERENCE, authority.as_bytes()).to_bytes(), None, false),
    };
    let response = transmit(card, &request)?;
    expect_success(Operation::SetDigitalSignatureTemplate, &response)
}

fn verify_certificate<SC: SmartCard + ?Sized>(card: &mut SC, certificate: &CvCertificate) -> Result<(), Error> {
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x2A, // PERFORM SECURITY OPERATION
            p1: 0x00, // no response data
            p2: 0xBE, // verify self-descriptive certificate
        },
        data: Data::new(certificate.body_and_signature(), None, false),
    };
    let response = transmit(card, &request)?;
    expect_success(Operation::VerifyCertificate, &response)
}


/// Has the card verify every certificate of `chain` below its anchor, each against the key
/// of its issuer.
#[instrument(skip(card, chain))]
pub fn verify_certificates<SC: SmartCard + ?Sized>(card: &mut SC, chain: &CertificateChain) -> Result<(), Error> {
    for certificate in chain.links() {
        debug!("sending certificate of {}", certificate.holder_reference());
        set_digital_signature_template(card, certificate.authority_reference())?;
        verify_certificate(card, certificate)?;
    }
    Ok(())
}


/// Announces the terminal key and the compressed ephemeral key with MSE:SET AT.
///
/// `auxiliary_data`, if given, is an encoded authenticated auxiliary data template (`67`).
pub fn set_authentication_template<SC: SmartCard + ?Sized>(
    card: &mut SC,
    terminal_certificate: &CvCertificate,
    compressed_ephemeral_key: &[u8],
    auxiliary_data: Option<&[u8]>,
) -> Result<(), Error> {
    let mut request_data = Tlv::primitive(
        TAG_MECHANISM,
        oid_to_der_bytes(&terminal_certificate.public_key().object_identifier),
    ).to_bytes();
    Tlv::primitive(TAG_PUBLIC_KEY_REFERENCE, terminal_certificate.holder_reference().as_bytes())
        .encode(&mut request_data);
    Tlv::primitive(TAG_EPHEMERAL_PUBLIC_KEY, compressed_ephemeral_key)
        .encode(&mut request_data);
    if let Some(auxiliary_data) = auxiliary_data {
        // already encoded as 67
        request_data.extend(auxiliary_data);
    }

    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x22, // MANAGE SECURITY ENVIRONMENT
            p1: 0b1000_0001, // verify/encrypt/extauth, set
            p2: 0xA4, // control reference template for authentication
        },
        data: Data::new(request_data, None, false),
    };
    let response = transmit(card, &request)?;
    expect_success(Operation::SetTerminalAuthenticationTemplate, &response)
}


/// Obtains a challenge for the terminal to sign.
pub fn get_challenge<SC: SmartCard + ?Sized>(card: &mut SC) -> Result<Vec<u8>, Error> {
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x84, // GET CHALLENGE
            p1: 0x00,
            p2: 0x00,
        },
        data: Data::new(Vec::new(), Some(CHALLENGE_LENGTH), false),
    };
    let response = transmit(card, &request)?;
    expect_success(Operation::GetChallenge, &response)?;
    if response.data.len() != CHALLENGE_LENGTH {
        return Err(Error::UnexpectedResponseLength { operation: Operation::GetChallenge, length: response.data.len() });
    }
    Ok(response.data)
}


/// Hands the card the terminal's signature over the challenge.
pub fn external_authenticate<SC: SmartCard + ?Sized>(card: &mut SC, signature: &[u8]) -> Result<(), Error> {
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x82, // EXTERNAL AUTHENTICATE
            p1: 0x00, // algorithm is known (from "set authentication template")
            p2: 0x00, // key is known (from "set authentication template")
        },
        data: Data::new(signature.to_vec(), None, false),
    };
    let response = transmit(card, &request)?;
    expect_success(Operation::ExternalAuthenticate, &response)
}


/// Compresses the terminal's ephemeral key the way the Chip Authentication protocol expects: the
/// x coordinate for ECDH, the SHA-1 digest for DH.
pub fn compress_ephemeral_key(ca_protocol: &Oid, ephemeral_public_key: &[u8]) -> Result<Vec<u8>, Error> {
    if oids::is_ca_ecdh(ca_protocol) {
        let coordinates = point_coordinates(ephemeral_public_key)
            .ok_or(Error::InvalidEphemeralKey)?;
        Ok(coordinates[..coordinates.len() / 2].to_vec())
    } else if oids::is_ca_dh(ca_protocol) {
        if ephemeral_public_key.is_empty() {
            return Err(Error::InvalidEphemeralKey);
        }
        Ok(Sha1::digest(ephemeral_public_key).to_vec())
    } else {
        Err(Error::UnsupportedChipAuthentication)
    }
}

/// The concatenated coordinates of an uncompressed point, with or without the `04` marker.
pub(crate) fn point_coordinates(point: &[u8]) -> Option<&[u8]> {
    let coordinates = if point.len() % 2 == 1 {
        match point.split_first() {
            Some((0x04, rest)) => rest,
            _ => return None,
        }
    } else {
        point
    };
    if coordinates.is_empty() {
        None
    } else {
        Some(coordinates)
    }
}
