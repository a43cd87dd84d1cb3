//! Extended Access Control: PACE, Terminal Authentication and Chip Authentication in sequence.
//!
//! An [`EacSession`] owns the card for the whole run and carries everything one step hands to the
//! next. The steps are:
//!
//! 1. [`prepare`](EacSession::prepare) checks what the service sent (certificates, certificate
//!    description, requested rights) and reads EF.CardAccess. The result is shown to the user.
//! 2. [`establish_pace`](EacSession::establish_pace) waits for the user's consent and runs PACE
//!    with the password and rights it carries.
//! 3. [`terminal_authentication`](EacSession::terminal_authentication) sends the certificate
//!    chain and proves the terminal's identity, possibly over two calls if the signature over the
//!    card's challenge has to be obtained from the service first.
//! 4. [`chip_authentication`](EacSession::chip_authentication) proves the chip's identity and
//!    hands the result to the service, which derives the next Secure Messaging keys.
//!
//! Once consent is given, every command is refused as soon as the user cancels.


pub mod ca;
pub mod config;
pub mod consent;
pub mod ta;


use std::fmt;

use tracing::{debug, info, instrument};

use crate::cvc::certificate::CvCertificate;
use crate::cvc::chain::{self, CertificateChain};
use crate::cvc::chat::{Chat, Role};
use crate::cvc::description::CertificateDescription;
use crate::cvc::verifier::{verify_chat, verify_description};
use crate::eac::ca::ChipAuthenticationOutcome;
use crate::eac::config::EacConfig;
use crate::eac::consent::{Consent, ConsentReceiver, ConsentRequest, ReceiveError};
use crate::eac::ta::{TaStage, TaStep, TerminalAuthenticationInput};
use crate::error::ErrorKind;
use crate::iso7816::apdu::{Apdu, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::file::{read_file_with, ReadError, EF_CARD_ACCESS};
use crate::pace;
use crate::secure_messaging::SecureChannel;
use crate::security_info::SecurityInfos;
use crate::tlv::DecodeError;


/// A card command sent during Terminal or Chip Authentication.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetDigitalSignatureTemplate,
    VerifyCertificate,
    SetTerminalAuthenticationTemplate,
    GetChallenge,
    ExternalAuthenticate,
    SetChipAuthenticationTemplate,
    ChipAuthenticate,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetDigitalSignatureTemplate => write!(f, "MSE:SET DST"),
            Self::VerifyCertificate => write!(f, "PSO:VERIFY CERTIFICATE"),
            Self::SetTerminalAuthenticationTemplate => write!(f, "MSE:SET AT for TA"),
            Self::GetChallenge => write!(f, "GET CHALLENGE"),
            Self::ExternalAuthenticate => write!(f, "EXTERNAL AUTHENTICATE"),
            Self::SetChipAuthenticationTemplate => write!(f, "MSE:SET AT for CA"),
            Self::ChipAuthenticate => write!(f, "GENERAL AUTHENTICATE for CA"),
        }
    }
}


/// A step of the session, in the order the steps must be taken.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Step {
    Pace,
    TerminalAuthentication,
    ChipAuthentication,
}
impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pace => write!(f, "PACE"),
            Self::TerminalAuthentication => write!(f, "Terminal Authentication"),
            Self::ChipAuthentication => write!(f, "Chip Authentication"),
        }
    }
}


#[derive(Debug)]
pub enum Error {
    Chain(chain::Error),
    Pace(pace::Error),
    Communication(CommunicationError),
    Reading(ReadError),
    Decoding(DecodeError),
    Consent(ReceiveError),
    OperationFailed { operation: Operation, status_word: u16 },
    UnexpectedResponseLength { operation: Operation, length: usize },
    UnsupportedChipAuthentication,
    InvalidEphemeralKey,
    MissingChallenge,
    OutOfOrder { step: Step },
    CardReleased,
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Chain(e) => e.kind(),
            Self::Pace(e) => e.kind(),
            Self::Communication(e) => e.kind(),
            Self::Reading(e) => e.kind(),
            Self::Decoding(e) => e.kind(),
            Self::Consent(_) => ErrorKind::Cancelled,
            Self::OperationFailed { .. } => ErrorKind::Transport,
            Self::UnexpectedResponseLength { .. } => ErrorKind::Decode,
            Self::UnsupportedChipAuthentication => ErrorKind::Decode,
            Self::InvalidEphemeralKey => ErrorKind::Decode,
            Self::MissingChallenge => ErrorKind::Transport,
            Self::OutOfOrder { .. } => ErrorKind::Transport,
            Self::CardReleased => ErrorKind::Transport,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chain(e)
                => write!(f, "certificate error: {}", e),
            Self::Pace(e)
                => write!(f, "PACE failed: {}", e),
            Self::Communication(e)
                => write!(f, "communication error: {}", e),
            Self::Reading(e)
                => write!(f, "failed to read file: {}", e),
            Self::Decoding(e)
                => write!(f, "decoding error: {}", e),
            Self::Consent(e)
                => write!(f, "no consent: {}", e),
            Self::OperationFailed { operation, status_word }
                => write!(f, "{} failed with status word 0x{:04X}", operation, status_word),
            Self::UnexpectedResponseLength { operation, length }
                => write!(f, "{} returned {} bytes of unexpected length", operation, length),
            Self::UnsupportedChipAuthentication
                => write!(f, "the card offers no supported Chip Authentication protocol"),
            Self::InvalidEphemeralKey
                => write!(f, "the ephemeral public key of the terminal is malformed"),
            Self::MissingChallenge
                => write!(f, "a signature was given before the card issued a challenge"),
            Self::OutOfOrder { step }
                => write!(f, "{} is not possible at this point", step),
            Self::CardReleased
                => write!(f, "the card is no longer held by the session"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Chain(e) => Some(e),
            Self::Pace(e) => Some(e),
            Self::Communication(e) => Some(e),
            Self::Reading(e) => Some(e),
            Self::Decoding(e) => Some(e),
            Self::Consent(e) => Some(e),
            Self::OperationFailed { .. } => None,
            Self::UnexpectedResponseLength { .. } => None,
            Self::UnsupportedChipAuthentication => None,
            Self::InvalidEphemeralKey => None,
            Self::MissingChallenge => None,
            Self::OutOfOrder { .. } => None,
            Self::CardReleased => None,
        }
    }
}
impl From<chain::Error> for Error {
    fn from(value: chain::Error) -> Self { Self::Chain(value) }
}
impl From<pace::Error> for Error {
    fn from(value: pace::Error) -> Self { Self::Pace(value) }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self {
        match value {
            CommunicationError::Cancelled => Self::Consent(ReceiveError::Cancelled),
            other => Self::Communication(other),
        }
    }
}
impl From<ReadError> for Error {
    fn from(value: ReadError) -> Self { Self::Reading(value) }
}
impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self { Self::Decoding(value) }
}
impl From<ReceiveError> for Error {
    fn from(value: ReceiveError) -> Self { Self::Consent(value) }
}


/// What the service sends to start an authentication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EacRequest {
    /// Terminal, DV and possibly link certificates, in any order.
    pub certificates: Vec<CvCertificate>,
    pub certificate_description: CertificateDescription,

    /// Rights the service needs; none if absent.
    pub required_chat: Option<Chat>,

    /// Rights the user may grant in addition; those of the terminal certificate if absent.
    pub optional_chat: Option<Chat>,

    /// The encoded authenticated auxiliary data (`67`) for age or validity checks.
    pub authenticated_auxiliary_data: Option<Vec<u8>>,
}
impl EacRequest {
    /// Decodes a request from its encoded parts. Both CHATs are encoded templates (`7F4C`).
    pub fn decode<'b, I: IntoIterator<Item = &'b [u8]>>(
        certificates: I,
        certificate_description: &[u8],
        required_chat: Option<&[u8]>,
        optional_chat: Option<&[u8]>,
        authenticated_auxiliary_data: Option<&[u8]>,
    ) -> Result<Self, DecodeError> {
        let certificates = certificates.into_iter()
            .map(CvCertificate::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            certificates,
            certificate_description: CertificateDescription::decode(certificate_description)?,
            required_chat: required_chat.map(Chat::decode_bytes).transpose()?,
            optional_chat: optional_chat.map(Chat::decode_bytes).transpose()?,
            authenticated_auxiliary_data: authenticated_auxiliary_data.map(|aad| aad.to_vec()),
        })
    }
}


/// What PACE tells the service about the card.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceResult {
    pub retry_counter: u8,
    /// The rights PACE was run with.
    pub chat: Chat,
    pub current_car: Option<Vec<u8>>,
    pub previous_car: Option<Vec<u8>>,
    pub id_picc: Vec<u8>,
    /// EF.CardAccess as read from the card.
    pub card_access: Vec<u8>,
}


/// The card, either plain or behind Secure Messaging.
enum Channel<SC: SmartCard> {
    Plain(SC),
    Secure(SecureChannel<SC>),
}
impl<SC: SmartCard> Channel<SC> {
    fn into_card(self) -> SC {
        match self {
            Self::Plain(card) => card,
            Self::Secure(channel) => channel.into_inner(),
        }
    }
}
impl<SC: SmartCard> SmartCard for Channel<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        match self {
            Self::Plain(card) => card.communicate(request),
            Self::Secure(channel) => channel.communicate(request),
        }
    }

    fn destroy_secure_channel(&mut self) -> Result<(), CommunicationError> {
        match self {
            Self::Plain(card) => card.destroy_secure_channel(),
            Self::Secure(channel) => channel.card_mut().destroy_secure_channel(),
        }
    }
}


/// Everything that survives between two steps of one authentication.
pub struct EacSession<SC: SmartCard> {
    channel: Option<Channel<SC>>,
    config: EacConfig,
    request: EacRequest,
    candidates: CertificateChain,
    consent_request: Option<ConsentRequest>,
    card_access: Option<(Vec<u8>, SecurityInfos)>,
    consent: Option<ConsentReceiver<Consent>>,
    pace: Option<PaceResult>,
    ta_stage: TaStage,
    ephemeral_public_key: Option<Vec<u8>>,
}
impl<SC: SmartCard> EacSession<SC> {
    pub fn new(card: SC, config: EacConfig, request: EacRequest) -> Self {
        Self {
            channel: Some(Channel::Plain(card)),
            config,
            request,
            candidates: CertificateChain::new(),
            consent_request: None,
            card_access: None,
            consent: None,
            pace: None,
            ta_stage: TaStage::Initial,
            ephemeral_public_key: None,
        }
    }

    pub fn config(&self) -> &EacConfig { &self.config }
    pub fn pace_result(&self) -> Option<&PaceResult> { self.pace.as_ref() }
    pub fn ta_stage(&self) -> &TaStage { &self.ta_stage }
    pub fn security_infos(&self) -> Option<&SecurityInfos> { self.card_access.as_ref().map(|(_, infos)| infos) }

    /// Checks the request of the service and reads EF.CardAccess.
    ///
    /// The terminal certificate must attest the certificate description and hold every required
    /// right. The optional rights are cut down to those of the terminal certificate.
    #[instrument(skip(self))]
    pub fn prepare(&mut self) -> Result<ConsentRequest, Error> {
        let mut candidates = CertificateChain::new();
        candidates.add_certificates(self.request.certificates.iter().cloned())?;
        candidates.add_certificates(self.config.trust_anchors.iter().cloned())?;

        let terminal_certificate = self.request.certificates.iter()
            .find(|c| c.chat().role() == Role::Terminal)
            .ok_or(chain::Error::MissingTerminalCertificate)?
            .clone();
        verify_description(&terminal_certificate, &self.request.certificate_description)?;

        let terminal_chat = terminal_certificate.chat();
        let required_chat = self.request.required_chat.clone()
            .unwrap_or_else(|| Chat::empty(terminal_chat.terminal_type(), Role::Terminal));
        verify_chat(terminal_chat, &required_chat)?;
        let optional_chat = self.request.optional_chat.as_ref()
            .unwrap_or(terminal_chat)
            .restrict_access_rights(terminal_chat);
        debug!("terminal {} requires {} and offers {}", terminal_certificate.holder_reference(), required_chat, optional_chat);

        let card = self.channel.as_mut().ok_or(Error::CardReleased)?;
        let card_access = read_file_with(card, EF_CARD_ACCESS, self.config.extended_length)?;
        let security_infos = SecurityInfos::decode(&card_access)?;

        let consent_request = ConsentRequest {
            terminal_certificate,
            description: self.request.certificate_description.clone(),
            required_chat,
            optional_chat,
        };
        self.candidates = candidates;
        self.card_access = Some((card_access, security_infos));
        self.consent_request = Some(consent_request.clone());
        info!("request of {} checked", consent_request.description.subject_name);
        Ok(consent_request)
    }

    /// Waits for the user's consent, then runs PACE with it.
    ///
    /// A wrong password leaves the session prepared; another attempt needs a fresh consent.
    #[instrument(skip(self, consent))]
    pub fn establish_pace(&mut self, consent: ConsentReceiver<Consent>) -> Result<PaceResult, Error> {
        if self.pace.is_some() {
            return Err(Error::OutOfOrder { step: Step::Pace });
        }
        let consent_request = self.consent_request.as_ref()
            .ok_or(Error::OutOfOrder { step: Step::Pace })?;
        let (card_access, security_infos) = self.card_access.as_ref()
            .ok_or(Error::OutOfOrder { step: Step::Pace })?;

        let answer = consent.receive()?;
        let chat = effective_chat(&consent_request.required_chat, &consent_request.optional_chat, &answer.selected_chat);
        debug!("running PACE with {} for {}", answer.password_type, chat);

        let Some(Channel::Plain(card)) = self.channel.as_mut() else {
            return Err(Error::OutOfOrder { step: Step::Pace });
        };
        let outcome = {
            let mut gated = consent.gate(card);
            pace::establish(
                &mut gated,
                security_infos,
                &self.config.accepted_pace_protocols,
                answer.password_type,
                &answer.password,
                Some(chat.to_bytes().as_slice()),
            )?
        };
        let secure_messaging = outcome.secure_messaging()?;

        let result = PaceResult {
            retry_counter: outcome.retry_counter,
            chat,
            current_car: outcome.current_car.clone(),
            previous_car: outcome.previous_car.clone(),
            id_picc: outcome.id_picc.clone(),
            card_access: card_access.clone(),
        };
        if let Some(channel) = self.channel.take() {
            self.channel = Some(Channel::Secure(SecureChannel::new(channel.into_card(), secure_messaging)));
        }
        self.consent = Some(consent);
        self.pace = Some(result.clone());
        Ok(result)
    }

    /// Obtains the card's challenge ahead of Terminal Authentication, for services that want it
    /// together with the PACE result.
    #[instrument(skip(self))]
    pub fn challenge(&mut self) -> Result<Vec<u8>, Error> {
        if self.pace.is_none() || self.ta_stage != TaStage::Initial {
            return Err(Error::OutOfOrder { step: Step::TerminalAuthentication });
        }
        let consent = self.consent.as_ref().ok_or(Error::OutOfOrder { step: Step::TerminalAuthentication })?;
        let channel = self.channel.as_mut().ok_or(Error::CardReleased)?;
        let challenge = ta::get_challenge(&mut consent.gate(channel))?;
        self.ta_stage = TaStage::ChallengeIssued { challenge: challenge.clone() };
        Ok(challenge)
    }

    /// Runs Terminal Authentication.
    ///
    /// Without a signature, the certificates are sent and the card's challenge is returned for the
    /// service to sign; the next call with the signature completes the protocol.
    #[instrument(skip(self, input))]
    pub fn terminal_authentication(&mut self, input: &TerminalAuthenticationInput) -> Result<TaStep, Error> {
        let pace = self.pace.as_ref().ok_or(Error::OutOfOrder { step: Step::TerminalAuthentication })?;
        let consent = self.consent.as_ref().ok_or(Error::OutOfOrder { step: Step::TerminalAuthentication })?;

        let send_certificates = match (&self.ta_stage, &input.signature) {
            (TaStage::Authenticated, _) => return Err(Error::OutOfOrder { step: Step::TerminalAuthentication }),
            (TaStage::Initial, Some(_)) => return Err(Error::MissingChallenge),
            (TaStage::Initial, None) => true,
            (TaStage::ChallengeIssued { .. }, _) => true,
            (TaStage::AwaitingSignature { .. }, _) => false,
        };

        if send_certificates {
            let chain = ta::select_chain(
                &self.candidates,
                pace.current_car.as_deref(),
                pace.previous_car.as_deref(),
                self.config.verify_chain_signatures,
            )?;
            let terminal_certificate = chain.terminal_certificate()
                .ok_or(chain::Error::MissingTerminalCertificate)?;
            let security_infos = self.card_access.as_ref()
                .map(|(_, infos)| infos)
                .ok_or(Error::OutOfOrder { step: Step::TerminalAuthentication })?;
            let (ca_info, _) = security_infos.accepted_ca_info(&self.config.accepted_ca_protocols)
                .ok_or(Error::UnsupportedChipAuthentication)?;
            let compressed_key = ta::compress_ephemeral_key(&ca_info.protocol, &input.ephemeral_public_key)?;

            let channel = self.channel.as_mut().ok_or(Error::CardReleased)?;
            let mut card = consent.gate(channel);
            ta::verify_certificates(&mut card, &chain)?;
            ta::set_authentication_template(
                &mut card,
                terminal_certificate,
                &compressed_key,
                self.request.authenticated_auxiliary_data.as_deref(),
            )?;
            let challenge = match &self.ta_stage {
                TaStage::ChallengeIssued { challenge } => challenge.clone(),
                _ => ta::get_challenge(&mut card)?,
            };
            self.ta_stage = TaStage::AwaitingSignature { challenge };
            self.ephemeral_public_key = Some(input.ephemeral_public_key.clone());
            info!("certificate chain of {} accepted", terminal_certificate.holder_reference());
        }

        let TaStage::AwaitingSignature { challenge } = &self.ta_stage else {
            return Err(Error::OutOfOrder { step: Step::TerminalAuthentication });
        };
        let Some(signature) = &input.signature else {
            debug!("waiting for the signature over the challenge");
            return Ok(TaStep::SignatureRequired { challenge: challenge.clone() });
        };

        let channel = self.channel.as_mut().ok_or(Error::CardReleased)?;
        ta::external_authenticate(&mut consent.gate(channel), signature)?;
        self.ta_stage = TaStage::Authenticated;
        info!("terminal authenticated");
        Ok(TaStep::Authenticated)
    }

    /// Runs Chip Authentication and tears down the PACE channel, whose keys the service replaces
    /// with those derived from the result.
    #[instrument(skip(self))]
    pub fn chip_authentication(&mut self) -> Result<ChipAuthenticationOutcome, Error> {
        if self.ta_stage != TaStage::Authenticated {
            return Err(Error::OutOfOrder { step: Step::ChipAuthentication });
        }
        let consent = self.consent.as_ref().ok_or(Error::OutOfOrder { step: Step::ChipAuthentication })?;
        let ephemeral_public_key = self.ephemeral_public_key.as_deref()
            .ok_or(Error::OutOfOrder { step: Step::ChipAuthentication })?;

        let channel = self.channel.as_mut().ok_or(Error::CardReleased)?;
        let outcome = ca::chip_authenticate(
            &mut consent.gate(channel),
            &self.config.accepted_ca_protocols,
            ephemeral_public_key,
            self.config.extended_length,
        )?;

        self.channel = match self.channel.take() {
            Some(Channel::Secure(secure_channel)) => Some(Channel::Plain(ca::destroy_channel(secure_channel))),
            other => other,
        };
        info!("chip authenticated");
        Ok(outcome)
    }

    /// Ends the session, returning the card.
    pub fn into_card(self) -> Option<SC> {
        self.channel.map(Channel::into_card)
    }
}


/// The rights PACE is run with: all required ones plus those optional ones the user selected.
fn effective_chat(required: &Chat, optional: &Chat, selected: &Chat) -> Chat {
    let mut chat = required.clone();
    let granted = selected.restrict_access_rights(optional);
    for right in granted.rights() {
        chat.set_right(right, true);
    }
    chat
}


#[cfg(test)]
mod tests {
    use super::effective_chat;
    use crate::cvc::chat::{AccessRight, Chat, Role, TerminalType};

    fn chat(rights: &[AccessRight]) -> Chat {
        let mut chat = Chat::empty(TerminalType::AuthenticationTerminal, Role::Terminal);
        for right in rights {
            chat.set_right(*right, true);
        }
        chat
    }

    #[test]
    fn selection_is_limited_to_optional_rights() {
        let required = chat(&[AccessRight::ReadDataGroup(4)]);
        let optional = chat(&[AccessRight::ReadDataGroup(5), AccessRight::AgeVerification]);
        let selected = chat(&[AccessRight::ReadDataGroup(5), AccessRight::ReadDataGroup(6)]);

        let effective = effective_chat(&required, &optional, &selected);
        assert_eq!(effective, chat(&[AccessRight::ReadDataGroup(4), AccessRight::ReadDataGroup(5)]));
    }

    #[test]
    fn required_rights_cannot_be_deselected() {
        let required = chat(&[AccessRight::ReadDataGroup(4), AccessRight::RestrictedIdentification]);
        let optional = chat(&[AccessRight::AgeVerification]);
        let selected = chat(&[]);

        assert_eq!(effective_chat(&required, &optional, &selected), required);
    }

    #[test]
    fn selection_of_another_terminal_type_grants_nothing() {
        let required = chat(&[AccessRight::ReadDataGroup(1)]);
        let optional = chat(&[AccessRight::ReadDataGroup(2)]);
        let mut selected = Chat::empty(TerminalType::InspectionSystem, Role::Terminal);
        selected.set_right(AccessRight::ReadFingerprint, true);

        assert_eq!(effective_chat(&required, &optional, &selected), required);
    }
}
