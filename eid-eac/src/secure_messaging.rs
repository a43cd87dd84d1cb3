//! Secure Messaging with AES (BSI TR-03110 Part 3 Appendix F).
//!
//! Command APDUs are wrapped into data objects `87` (encrypted data), `97` (protected Le) and `8E`
//! (MAC); response APDUs carry `87` or `81`, `99` (status word) and `8E`.


use std::fmt;

use subtle::ConstantTimeEq;
use tracing::{debug, trace};
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt;
use crate::crypt::cipher_mac::{CipherAndMac, MAC_LENGTH};
use crate::error::ErrorKind;
use crate::iso7816::apdu::{self, Apdu, CommandHeader, Data, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::tlv::{DecodeError, RawElement, Tag};


/// Length of the send sequence counter in bytes.
pub const SEND_SEQUENCE_COUNTER_LENGTH: usize = 16;

const TAG_PLAIN_DATA: Tag = Tag::from_raw(0x81);
const TAG_ENCRYPTED_DATA: Tag = Tag::from_raw(0x87);
const TAG_STATUS: Tag = Tag::from_raw(0x99);
const TAG_MAC: Tag = Tag::from_raw(0x8E);


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    AlreadyProtected { cla: u8 },
    UnsupportedClass { cla: u8 },
    Crypto(crypt::Error),
    CounterOverflow,
    RejectedByCard { status_word: u16 },
    Decoding(DecodeError),
    UnexpectedDataObject { tag: Tag },
    IncompleteResponse,
    InvalidStatusLength { length: usize },
    InvalidMacLength { length: usize },
    UnknownPadding { indicator: u8 },
    InvalidPadding,
    ResponseMac,
}
impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyProtected { .. } => ErrorKind::Decode,
            Self::UnsupportedClass { .. } => ErrorKind::Decode,
            Self::Crypto(e) => e.kind(),
            Self::CounterOverflow => ErrorKind::SecurityViolation,
            Self::RejectedByCard { .. } => ErrorKind::SecurityViolation,
            Self::Decoding(_) => ErrorKind::Decode,
            Self::UnexpectedDataObject { .. } => ErrorKind::Decode,
            Self::IncompleteResponse => ErrorKind::Decode,
            Self::InvalidStatusLength { .. } => ErrorKind::Decode,
            Self::InvalidMacLength { .. } => ErrorKind::Decode,
            Self::UnknownPadding { .. } => ErrorKind::Decode,
            Self::InvalidPadding => ErrorKind::SecurityViolation,
            Self::ResponseMac => ErrorKind::SecurityViolation,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyProtected { cla }
                => write!(f, "command with CLA 0x{:02X} is already protected", cla),
            Self::UnsupportedClass { cla }
                => write!(f, "CLA 0x{:02X} cannot be protected by Secure Messaging", cla),
            Self::Crypto(e)
                => write!(f, "cryptographic error: {}", e),
            Self::CounterOverflow
                => write!(f, "send sequence counter overflow"),
            Self::RejectedByCard { status_word }
                => write!(f, "card rejected Secure Messaging data objects with status 0x{:04X}", status_word),
            Self::Decoding(e)
                => write!(f, "failed to decode response data objects: {}", e),
            Self::UnexpectedDataObject { tag }
                => write!(f, "unexpected data object with tag {} in response", tag),
            Self::IncompleteResponse
                => write!(f, "response lacks status or MAC data object"),
            Self::InvalidStatusLength { length }
                => write!(f, "status data object has length {}, expected 2", length),
            Self::InvalidMacLength { length }
                => write!(f, "MAC data object has length {}, expected {}", length, MAC_LENGTH),
            Self::UnknownPadding { indicator }
                => write!(f, "unknown padding indicator 0x{:02X}", indicator),
            Self::InvalidPadding
                => write!(f, "response payload has invalid padding"),
            Self::ResponseMac
                => write!(f, "response MAC incorrect"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyProtected { .. } => None,
            Self::UnsupportedClass { .. } => None,
            Self::Crypto(e) => Some(e),
            Self::CounterOverflow => None,
            Self::RejectedByCard { .. } => None,
            Self::Decoding(e) => Some(e),
            Self::UnexpectedDataObject { .. } => None,
            Self::IncompleteResponse => None,
            Self::InvalidStatusLength { .. } => None,
            Self::InvalidMacLength { .. } => None,
            Self::UnknownPadding { .. } => None,
            Self::InvalidPadding => None,
            Self::ResponseMac => None,
        }
    }
}
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}
impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self { Self::Decoding(value) }
}


/// Which data object the response parser expects next.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum ReadState {
    Init,
    Data,
    Status,
    Mac,
}
impl ReadState {
    fn next(self, tag: Tag) -> Result<Self, Error> {
        let next = if tag == TAG_PLAIN_DATA || tag == TAG_ENCRYPTED_DATA {
            Self::Data
        } else if tag == TAG_STATUS {
            Self::Status
        } else if tag == TAG_MAC {
            Self::Mac
        } else {
            return Err(Error::UnexpectedDataObject { tag });
        };
        match (self, next) {
            (Self::Init, Self::Data)|(Self::Init|Self::Data, Self::Status)|(Self::Status, Self::Mac) => Ok(next),
            _ => Err(Error::UnexpectedDataObject { tag }),
        }
    }
}


/// Appends ISO/IEC 7816-4 padding: `0x80`, then zeroes up to the block size. Always pads.
fn pad(data: &mut Vec<u8>, block_size: usize) {
    data.push(0x80);
    while data.len() % block_size != 0 {
        data.push(0x00);
    }
}

/// Strips ISO/IEC 7816-4 padding.
fn unpad(data: &mut Vec<u8>) -> Result<(), Error> {
    while data.last() == Some(&0x00) {
        data.pop();
    }
    if data.pop() != Some(0x80) {
        return Err(Error::InvalidPadding);
    }
    Ok(())
}

/// Appends a data object with a single-byte tag.
fn push_data_object(output: &mut Vec<u8>, tag: u8, value: &[u8]) {
    output.push(tag);
    crate::der_util::encode_primitive_length(output, value.len());
    output.extend(value);
}

fn increment_counter(counter: &mut [u8; SEND_SEQUENCE_COUNTER_LENGTH]) -> Result<(), Error> {
    for b in counter.iter_mut().rev() {
        if *b == 0xFF {
            *b = 0x00;
            // carry; keep going
        } else {
            *b += 1;
            // the buck stops here
            return Ok(());
        }
    }
    Err(Error::CounterOverflow)
}

fn protected_class(cla: u8) -> Result<u8, Error> {
    match cla & 0b1110_0000 {
        0b0000_0000 => {
            // first interindustry values: SM in bits 4 and 3
            if cla & 0b0000_1100 != 0 {
                return Err(Error::AlreadyProtected { cla });
            }
            Ok(cla | 0b0000_1100) // SM, header authenticated
        },
        0b0100_0000|0b0110_0000 => {
            // further interindustry values: SM in bit 6
            if cla & 0b0010_0000 != 0 {
                return Err(Error::AlreadyProtected { cla });
            }
            Ok(cla | 0b0010_0000)
        },
        _ => Err(Error::UnsupportedClass { cla }),
    }
}


/// The Secure Messaging state shared between terminal and card: session keys and the send
/// sequence counter.
///
/// The counter starts at zero. Protecting a command uses the counter incremented by one and
/// leaves it incremented by two; the response to that command is verified with the current value.
#[derive(ZeroizeOnDrop)]
pub struct SecureMessaging {
    #[zeroize(skip)] cipher: Box<dyn CipherAndMac>,
    k_session_enc: Vec<u8>,
    k_session_mac: Vec<u8>,
    send_sequence_counter: [u8; SEND_SEQUENCE_COUNTER_LENGTH],
}
impl SecureMessaging {
    pub fn new(cipher: Box<dyn CipherAndMac>, k_session_enc: &[u8], k_session_mac: &[u8]) -> Self {
        Self {
            cipher,
            k_session_enc: k_session_enc.to_vec(),
            k_session_mac: k_session_mac.to_vec(),
            send_sequence_counter: [0u8; SEND_SEQUENCE_COUNTER_LENGTH],
        }
    }

    pub fn send_sequence_counter(&self) -> &[u8; SEND_SEQUENCE_COUNTER_LENGTH] {
        &self.send_sequence_counter
    }

    pub fn set_send_sequence_counter(&mut self, counter: [u8; SEND_SEQUENCE_COUNTER_LENGTH]) {
        self.send_sequence_counter = counter;
    }

    fn derive_iv(&self, counter: &[u8; SEND_SEQUENCE_COUNTER_LENGTH]) -> Result<[u8; SEND_SEQUENCE_COUNTER_LENGTH], Error> {
        let mut iv = *counter;
        self.cipher.encrypt_block(&mut iv, &self.k_session_enc)?;
        Ok(iv)
    }

    fn mac(&self, counter: &[u8; SEND_SEQUENCE_COUNTER_LENGTH], padded_data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut mac_input = Vec::with_capacity(counter.len() + padded_data.len());
        mac_input.extend(counter);
        mac_input.extend(padded_data);
        Ok(self.cipher.mac(&mac_input, &self.k_session_mac)?)
    }

    /// Protects a plain command APDU.
    pub fn encrypt(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        let mut counter = self.send_sequence_counter;
        increment_counter(&mut counter)?;
        let protected = self.protect(request, &counter)?;
        increment_counter(&mut counter)?;
        self.send_sequence_counter = counter;
        Ok(protected)
    }

    fn protect(&self, request: &Apdu, counter: &[u8; SEND_SEQUENCE_COUNTER_LENGTH]) -> Result<Apdu, Error> {
        let block_size = self.cipher.cipher_block_size();
        let header = CommandHeader {
            cla: protected_class(request.header.cla)?,
            ..request.header.clone()
        };

        let mut body_data = Vec::new();

        if let Some(request_data) = request.data.request_data() {
            let mut padded_data = Zeroizing::new(request_data.to_vec());
            pad(&mut padded_data, block_size);
            let iv = self.derive_iv(counter)?;
            self.cipher.encrypt_padded_data(&mut padded_data, &self.k_session_enc, &iv)?;

            // 0x87 len padtype data...
            let mut value = Vec::with_capacity(1 + padded_data.len());
            value.push(0x01); // ISO 7816 padding
            value.extend(padded_data.iter());
            push_data_object(&mut body_data, 0x87, &value);
        }

        // protected Le, encoded as in the plain command
        let protected_le = match &request.data {
            Data::NoData|Data::RequestDataShort { .. }|Data::RequestDataExtended { .. } => None,
            Data::ResponseDataShort { response_data_length }|Data::BothDataShort { response_data_length, .. }
                => Some(vec![*response_data_length]),
            Data::ResponseDataExtended { response_data_length }|Data::BothDataExtended { response_data_length, .. }
                => Some(response_data_length.to_be_bytes().to_vec()),
        };
        if let Some(le) = &protected_le {
            push_data_object(&mut body_data, 0x97, le);
        }

        let mut mac_data = header.to_bytes().to_vec();
        pad(&mut mac_data, block_size);
        if !body_data.is_empty() {
            let mut padded_body = body_data.clone();
            pad(&mut padded_body, block_size);
            mac_data.extend(&padded_body);
        }
        let mac = self.mac(counter, &mac_data)?;
        push_data_object(&mut body_data, 0x8E, &mac);

        // the encrypted response may be longer than requested, so always ask for the maximum
        let response_length = if body_data.len() <= 255 && protected_le.is_none() {
            256
        } else {
            65536
        };
        Ok(Apdu {
            header,
            data: Data::new(body_data, Some(response_length), false),
        })
    }

    /// Verifies and decrypts a protected response APDU.
    ///
    /// The counter is not changed; it was already advanced when the command was protected.
    pub fn decrypt(&self, response: &Response) -> Result<Response, Error> {
        let status_word = response.trailer.to_word();
        if status_word == apdu::status::SM_DATA_OBJECTS_MISSING || status_word == apdu::status::SM_DATA_OBJECTS_INCORRECT {
            return Err(Error::RejectedByCard { status_word });
        }

        let elements = RawElement::read_all(&response.data)?;

        let mut state = ReadState::Init;
        let mut plain_data = None;
        let mut encrypted_data = None;
        let mut with_padding = true;
        let mut status = None;
        let mut received_mac = None;
        let mut mac_data = Vec::with_capacity(response.data.len());
        for element in &elements {
            state = state.next(element.tag)?;
            match state {
                ReadState::Init => unreachable!(),
                ReadState::Data => {
                    if element.tag == TAG_PLAIN_DATA {
                        plain_data = Some(element.value);
                    } else {
                        let (indicator, cryptogram) = element.value.split_first()
                            .ok_or(Error::IncompleteResponse)?;
                        with_padding = match indicator {
                            0x01 => true,
                            0x02 => false,
                            other => return Err(Error::UnknownPadding { indicator: *other }),
                        };
                        encrypted_data = Some(cryptogram);
                    }
                    mac_data.extend(element.encoded);
                },
                ReadState::Status => {
                    if element.value.len() != 2 {
                        return Err(Error::InvalidStatusLength { length: element.value.len() });
                    }
                    status = Some(ResponseTrailer::new(element.value[0], element.value[1]));
                    mac_data.extend(element.encoded);
                },
                ReadState::Mac => {
                    if element.value.len() != MAC_LENGTH {
                        return Err(Error::InvalidMacLength { length: element.value.len() });
                    }
                    received_mac = Some(element.value);
                },
            }
        }
        let (Some(status), Some(received_mac)) = (status, received_mac) else {
            return Err(Error::IncompleteResponse);
        };

        let counter = self.send_sequence_counter;
        pad(&mut mac_data, self.cipher.cipher_block_size());
        let computed_mac = self.mac(&counter, &mac_data)?;
        if !bool::from(computed_mac.ct_eq(received_mac)) {
            return Err(Error::ResponseMac);
        }

        let data = if let Some(cryptogram) = encrypted_data {
            let mut decrypted = cryptogram.to_vec();
            let iv = self.derive_iv(&counter)?;
            self.cipher.decrypt_padded_data(&mut decrypted, &self.k_session_enc, &iv)?;
            if with_padding {
                unpad(&mut decrypted)?;
            }
            decrypted
        } else if let Some(plain) = plain_data {
            plain.to_vec()
        } else {
            Vec::new()
        };

        Ok(Response {
            data,
            trailer: status,
        })
    }
}


/// A smart card reached through an established Secure Messaging channel.
pub struct SecureChannel<SC: SmartCard> {
    card: SC,
    secure_messaging: SecureMessaging,
}
impl<SC: SmartCard> SecureChannel<SC> {
    pub fn new(card: SC, secure_messaging: SecureMessaging) -> Self {
        Self {
            card,
            secure_messaging,
        }
    }

    pub fn secure_messaging(&self) -> &SecureMessaging {
        &self.secure_messaging
    }

    pub fn card_mut(&mut self) -> &mut SC {
        &mut self.card
    }

    /// Tears down the channel, returning the underlying card. The session keys are wiped.
    pub fn into_inner(self) -> SC {
        self.card
    }
}
impl<SC: SmartCard> SmartCard for SecureChannel<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        debug!("protecting command {:?}", request.header);
        let protected_request = self.secure_messaging.encrypt(request)?;
        let protected_response = self.card.communicate(&protected_request)?;
        let response = self.secure_messaging.decrypt(&protected_response)?;
        trace!("decrypted response data:\n{}", crate::hexdump(&response.data));
        Ok(response)
    }
}


#[cfg(test)]
mod tests {
    use super::{Error, SecureMessaging};
    use crate::crypt::cipher_mac::CamAes128;
    use crate::error::ErrorKind;
    use crate::iso7816::apdu::{Apdu, Response};
    use crate::tlv::Tag;
    use hex_literal::hex;

    fn make_sm() -> SecureMessaging {
        SecureMessaging::new(
            Box::new(CamAes128),
            &hex!("68406B41 62100563 D9C901A6 154D2901"),
            &hex!("73FF2687 84F72AF8 33FDC946 4049AFC9"),
        )
    }

    fn encrypt_bytes(sm: &mut SecureMessaging, plain: &[u8]) -> Vec<u8> {
        let request = Apdu::try_from_bytes(plain).unwrap();
        sm.encrypt(&request).unwrap().to_bytes().unwrap()
    }

    fn decrypt_bytes(sm: &SecureMessaging, protected: &[u8]) -> Result<Vec<u8>, Error> {
        let response = Response::from_slice(protected).unwrap();
        sm.decrypt(&response).map(|r| r.to_bytes())
    }

    #[test]
    fn test_encryption() {
        let mut sm = make_sm();

        // case 1
        assert_eq!(encrypt_bytes(&mut sm, &hex!("00840000")), hex!("0C840000 0A 8E08F146CA58D9D87962 00"));
        assert_eq!(sm.send_sequence_counter()[15], 2);

        // case 2 short
        assert_eq!(
            encrypt_bytes(&mut sm, &hex!("00840000 08")),
            hex!("0C840000 00000D 970108 8E081DC3357110820CAD 0000"),
        );

        // case 2 extended
        assert_eq!(
            encrypt_bytes(&mut sm, &hex!("00840000 001111")),
            hex!("0C840000 00000E 97021111 8E08EEF70779FD0263D6 0000"),
        );

        // case 3
        assert_eq!(
            encrypt_bytes(&mut sm, &hex!("002281B6 0F 830D444543564341415430303030 31")),
            hex!("0C2281B6 1D 871101BEE6E33D7D2F6D8662ED4CF56739794C 8E0808FEA4E3EEEC9720 00"),
        );
        assert_eq!(sm.send_sequence_counter()[15], 8);
    }

    #[test]
    fn test_decryption() {
        let mut sm = make_sm();

        // DO99|DO8E|SW1SW2
        assert_eq!(decrypt_bytes(&sm, &hex!("99029000 8E0812503AC2A74CC463 9000")).unwrap(), hex!("9000"));

        // DO87|DO99|DO8E|SW1SW2 after one command
        encrypt_bytes(&mut sm, &hex!("002281B6"));
        let protected = hex!("
            871101FFC073CB761DC0461DDAFA3217DFB392
            99029000
            8E08442DFAAF0E458896
            9000
        ");
        assert_eq!(decrypt_bytes(&sm, &protected).unwrap(), hex!("547E4EAB03B235D2 9000"));

        // decryption does not advance the counter
        assert_eq!(decrypt_bytes(&sm, &protected).unwrap(), hex!("547E4EAB03B235D2 9000"));
    }

    #[test]
    fn malformed_responses() {
        let mut sm = make_sm();
        encrypt_bytes(&mut sm, &hex!("002281B6"));

        // not protected at all
        assert_eq!(decrypt_bytes(&sm, &hex!("9000")), Err(Error::IncompleteResponse));

        // missing DO99
        assert_eq!(
            decrypt_bytes(&sm, &hex!("8E0812503AC2A74CC463 9000")),
            Err(Error::UnexpectedDataObject { tag: Tag::from_raw(0x8E) }),
        );

        // missing DO8E
        assert_eq!(decrypt_bytes(&sm, &hex!("99029000 9000")), Err(Error::IncompleteResponse));

        // missing status bytes: the MAC object is cut short
        let err = decrypt_bytes(&sm, &hex!("
            871101FFC073CB761DC0461DDAFA3217DFB392
            99029000
            8E08442DFAAF0E458896
        ")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);

        // wrong MAC
        assert_eq!(
            decrypt_bytes(&sm, &hex!("
                871101FFC073CB761DC0461DDAFA3217DFB392
                99029000
                8E081234567891011126
                9000
            ")),
            Err(Error::ResponseMac),
        );

        // only 01 announces ISO/IEC 7816-4 padding
        assert_eq!(
            decrypt_bytes(&sm, &hex!("
                871100FFC073CB761DC0461DDAFA3217DFB392
                99029000
                8E08442DFAAF0E458896
                9000
            ")),
            Err(Error::UnknownPadding { indicator: 0x00 }),
        );

        // rejected by the card
        assert_eq!(decrypt_bytes(&sm, &hex!("6988")), Err(Error::RejectedByCard { status_word: 0x6988 }));
    }

    #[test]
    fn tampered_cryptogram_fails_mac() {
        let mut sm = make_sm();
        encrypt_bytes(&mut sm, &hex!("002281B6"));
        let mut protected = hex!("
            871101FFC073CB761DC0461DDAFA3217DFB392
            99029000
            8E08442DFAAF0E458896
            9000
        ");
        for index in [3, 10, 18, 22, 27] {
            protected[index] ^= 0x01;
            let err = decrypt_bytes(&sm, &protected).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SecurityViolation);
            protected[index] ^= 0x01;
        }
    }

    #[test]
    fn already_protected_commands_are_refused() {
        let mut sm = make_sm();
        let request = Apdu::try_from_bytes(&hex!("0C840000 08")).unwrap();
        assert_eq!(sm.encrypt(&request), Err(Error::AlreadyProtected { cla: 0x0C }));
        let request = Apdu::try_from_bytes(&hex!("80840000 08")).unwrap();
        assert_eq!(sm.encrypt(&request), Err(Error::UnsupportedClass { cla: 0x80 }));
        // failed attempts leave the counter untouched
        assert_eq!(sm.send_sequence_counter(), &[0u8; 16]);
    }
}
