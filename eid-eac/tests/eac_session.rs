mod common;


use eid_eac::cvc::certificate::CvCertificate;
use eid_eac::cvc::chain;
use eid_eac::cvc::chat::{AccessRight, Chat};
use eid_eac::eac::config::EacConfig;
use eid_eac::eac::consent::{self, Consent, ReceiveError};
use eid_eac::eac::ta::{TaStage, TerminalAuthenticationInput};
use eid_eac::eac::{EacRequest, EacSession, Error, Step};
use eid_eac::error::ErrorKind;
use eid_eac::iso7816::file::EF_CARD_ACCESS;
use eid_eac::oids;
use eid_eac::pace::PasswordType;
use hex_literal::hex;

use crate::common::{FileCard, CARD_ACCESS, CVCA, DESCRIPTION, DV, TERMINAL, TERMINAL_PUBLIC_KEY};


/// Age verification only.
const AGE_VERIFICATION: [u8; 21] = hex!("7F4C 12 06 09 04007F000703010202 53 05 0000000001");

/// Privileged terminal, which the terminal certificate does not grant.
const PRIVILEGED: [u8; 21] = hex!("7F4C 12 06 09 04007F000703010202 53 05 0000000008");

/// Every right.
const EVERYTHING: [u8; 21] = hex!("7F4C 12 06 09 04007F000703010202 53 05 3FFFFFFFFF");


fn config() -> EacConfig {
    EacConfig {
        trust_anchors: vec![CvCertificate::decode(&CVCA).unwrap()],
        ..EacConfig::default()
    }
}

fn session(required_chat: Option<&[u8]>, optional_chat: Option<&[u8]>, description: &[u8]) -> EacSession<FileCard> {
    let request = EacRequest::decode(
        [TERMINAL.as_slice(), DV.as_slice()],
        description,
        required_chat,
        optional_chat,
        None,
    ).unwrap();
    let card = FileCard::new(vec![(EF_CARD_ACCESS, CARD_ACCESS.to_vec())]);
    EacSession::new(card, config(), request)
}

fn consent(chat: &[u8]) -> Consent {
    Consent::new(PasswordType::Pin, b"123456", Chat::decode_bytes(chat).unwrap())
}


#[test]
fn prepare_reads_card_access() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut session = session(Some(&AGE_VERIFICATION), None, &DESCRIPTION);
    let request = session.prepare().unwrap();

    assert_eq!(request.terminal_certificate.holder_reference().to_string(), "DETESTTERM00001");
    assert_eq!(request.description.subject_name, "TEST");
    assert_eq!(request.required_chat.rights(), vec![AccessRight::AgeVerification]);
    // absent optional rights default to those of the terminal
    assert_eq!(request.optional_chat.template(), hex!("003F0FFF07"));

    let infos = session.security_infos().unwrap();
    assert_eq!(&*infos.pace_infos[0].protocol, oids::PACE_ECDH_GM_AES_CBC_CMAC_128);
    assert_eq!(&*infos.ca_infos[0].protocol, oids::CA_ECDH_AES_CBC_CMAC_128);
    assert_eq!(infos.ca_infos[0].key_id, Some(0x29));

    let card = session.into_card().unwrap();
    assert_eq!(card.requests.len(), 2);
    assert_eq!(card.requests[0], hex!("00 A4 02 04 02 011C 00"));
    assert_eq!(card.requests[1], hex!("00 B0 00 00 FF"));
}


#[test]
fn optional_rights_are_cut_to_the_terminal() {
    let mut session = session(None, Some(&EVERYTHING), &DESCRIPTION);
    let request = session.prepare().unwrap();
    assert!(request.required_chat.rights().is_empty());
    assert_eq!(request.optional_chat.template(), hex!("003F0FFF07"));
}


#[test]
fn excess_rights_are_refused_before_the_card_is_touched() {
    let mut session = session(Some(&PRIVILEGED), None, &DESCRIPTION);
    let err = session.prepare().unwrap_err();
    assert!(matches!(err, Error::Chain(chain::Error::RightsExceeded)));
    assert_eq!(err.kind(), ErrorKind::Chain);
    assert!(session.into_card().unwrap().requests.is_empty());
}


#[test]
fn foreign_description_is_refused() {
    let mut description = DESCRIPTION;
    description[47] = 0x55;
    let mut session = session(None, None, &description);
    assert!(matches!(session.prepare(), Err(Error::Chain(chain::Error::DescriptionHashMismatch))));
    assert!(session.into_card().unwrap().requests.is_empty());
}


#[test]
fn cancelled_consent_sends_nothing() {
    let mut session = session(Some(&AGE_VERIFICATION), None, &DESCRIPTION);
    session.prepare().unwrap();

    let (sender, receiver) = consent::channel();
    sender.cancel();
    let err = session.establish_pace(receiver).unwrap_err();
    assert!(matches!(err, Error::Consent(ReceiveError::Cancelled)));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(session.pace_result().is_none());

    // only the reads of prepare reached the card
    assert_eq!(session.into_card().unwrap().requests.len(), 2);
}


#[test]
fn abandoned_consent_is_a_cancellation() {
    let mut session = session(None, None, &DESCRIPTION);
    session.prepare().unwrap();

    let (sender, receiver) = consent::channel::<Consent>();
    let handle = std::thread::spawn(move || drop(sender));
    let err = session.establish_pace(receiver).unwrap_err();
    handle.join().unwrap();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}


#[test]
fn withdrawn_consent_is_honoured() {
    let mut session = session(None, None, &DESCRIPTION);
    session.prepare().unwrap();

    let (sender, receiver) = consent::channel();
    let cancel = sender.cancel_handle();
    sender.deliver(consent(&AGE_VERIFICATION)).unwrap();
    cancel.cancel();
    let err = session.establish_pace(receiver).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(session.into_card().unwrap().requests.len(), 2);
}


#[test]
fn steps_must_run_in_order() {
    let mut session = session(None, None, &DESCRIPTION);

    let (sender, receiver) = consent::channel();
    sender.deliver(consent(&AGE_VERIFICATION)).unwrap();
    assert!(matches!(session.establish_pace(receiver), Err(Error::OutOfOrder { step: Step::Pace })));

    assert!(matches!(session.challenge(), Err(Error::OutOfOrder { step: Step::TerminalAuthentication })));
    let input = TerminalAuthenticationInput {
        ephemeral_public_key: TERMINAL_PUBLIC_KEY.to_vec(),
        signature: None,
    };
    assert!(matches!(
        session.terminal_authentication(&input),
        Err(Error::OutOfOrder { step: Step::TerminalAuthentication }),
    ));
    assert!(matches!(session.chip_authentication(), Err(Error::OutOfOrder { step: Step::ChipAuthentication })));
    assert_eq!(session.ta_stage(), &TaStage::Initial);

    assert!(session.into_card().unwrap().requests.is_empty());
}
