//! Selecting and reading transparent elementary files.


use std::fmt;

use tracing::{debug, instrument, warn};

use crate::error::ErrorKind;
use crate::iso7816::apdu::{self, status};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::tlv::{DecodeError, Tag, Tlv};


/// File identifier of EF.CardAccess.
pub const EF_CARD_ACCESS: u16 = 0x011C;

/// File identifier of EF.CardSecurity.
pub const EF_CARD_SECURITY: u16 = 0x011D;

/// File identifier of EF.CVCA.
pub const EF_CVCA: u16 = 0x011C;


const FCP_TEMPLATE: Tag = Tag::from_raw(0x62);
const FMD_TEMPLATE: Tag = Tag::from_raw(0x64);
const FCI_TEMPLATE: Tag = Tag::from_raw(0x6F);


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MetadataEntry {
    FileLengthWithoutStructural { length_bytes: Vec<u8> },
    FileLengthWithStructural { length_bytes: Vec<u8> },
    FileIdentifier { identifier: u16 },
    ShortEfIdentifier { identifier: Option<u8> },
    Other { tag: Tag, data: Vec<u8> },
}


#[derive(Debug)]
pub enum ReadError {
    SelectCommunication(CommunicationError),
    FileNotFound,
    SelectFailed(apdu::Response),
    MetadataDecoding(DecodeError),
    ReadCommunication(CommunicationError),
    ReadFailed(apdu::Response),
}
impl ReadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SelectCommunication(e) => e.kind(),
            Self::FileNotFound => ErrorKind::Transport,
            Self::SelectFailed(_) => ErrorKind::Transport,
            Self::MetadataDecoding(e) => e.kind(),
            Self::ReadCommunication(e) => e.kind(),
            Self::ReadFailed(_) => ErrorKind::Transport,
        }
    }
}
impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::SelectCommunication(e)
                => write!(f, "SELECT communication failed: {}", e),
            Self::FileNotFound
                => write!(f, "file not found"),
            Self::SelectFailed(response)
                => write!(f, "SELECT operation failed with status code 0x{:04X}", response.trailer.to_word()),
            Self::MetadataDecoding(e)
                => write!(f, "metadata decoding failed: {}", e),
            Self::ReadCommunication(e)
                => write!(f, "READ BINARY communication failed: {}", e),
            Self::ReadFailed(response)
                => write!(f, "READ BINARY operation failed with status code 0x{:04X}", response.trailer.to_word()),
        }
    }
}
impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SelectCommunication(e) => Some(e),
            Self::FileNotFound => None,
            Self::SelectFailed(_response) => None,
            Self::MetadataDecoding(e) => Some(e),
            Self::ReadCommunication(e) => Some(e),
            Self::ReadFailed(_response) => None,
        }
    }
}


/// Decodes the file control parameters returned by SELECT.
pub fn decode_metadata_entries(buf: &[u8]) -> Result<Vec<MetadataEntry>, DecodeError> {
    let template = Tlv::decode_exact(buf)?;
    let tag = template.tag();
    if tag != FCP_TEMPLATE && tag != FMD_TEMPLATE && tag != FCI_TEMPLATE {
        return Err(DecodeError::UnexpectedTag { expected: FCP_TEMPLATE, found: tag });
    }

    let mut entries = Vec::with_capacity(template.children().len());
    for child in template.children() {
        let Some(data) = child.primitive_value() else {
            entries.push(MetadataEntry::Other { tag: child.tag(), data: child.value_bytes() });
            continue;
        };
        let entry = match child.tag().to_bytes().as_slice() {
            [0x80] => MetadataEntry::FileLengthWithoutStructural { length_bytes: data.to_vec() },
            [0x81] => MetadataEntry::FileLengthWithStructural { length_bytes: data.to_vec() },
            [0x83] => {
                let [hi, lo] = data else { continue };
                MetadataEntry::FileIdentifier { identifier: u16::from_be_bytes([*hi, *lo]) }
            },
            [0x88] => {
                if data.len() > 1 {
                    continue;
                }
                MetadataEntry::ShortEfIdentifier { identifier: data.first().copied() }
            },
            _ => MetadataEntry::Other { tag: child.tag(), data: data.to_vec() },
        };
        entries.push(entry);
    }
    Ok(entries)
}


/// The number of data bytes of the file, if the metadata announces it.
pub fn file_length(entries: &[MetadataEntry]) -> Option<usize> {
    let length_bytes = entries.iter()
        .find_map(|me| if let MetadataEntry::FileLengthWithoutStructural { length_bytes } = me { Some(length_bytes) } else { None })?;
    if length_bytes.is_empty() || length_bytes.len() > 4 {
        return None;
    }
    let mut length: usize = 0;
    for &b in length_bytes {
        length = length.checked_mul(0x100)?;
        length += usize::from(b);
    }
    Some(length)
}


/// Selects an elementary file below the current dedicated file, requesting its control parameters.
///
/// Returns the announced file length, if any.
#[instrument(skip(card))]
pub fn select_file<SC: SmartCard + ?Sized>(card: &mut SC, file_identifier: u16) -> Result<Option<usize>, ReadError> {
    let select_apdu = apdu::Apdu {
        header: apdu::CommandHeader {
            cla: 0x00,
            ins: 0xA4, // SELECT
            p1: 0b000_000_10, // select EF under current DF
            p2: 0b0000_01_00, // return FCP template, return first or only occurrence
        },
        data: apdu::Data::BothDataShort {
            request_data: file_identifier.to_be_bytes().to_vec(),
            response_data_length: 0x00,
        },
    };
    let select_response = card.communicate(&select_apdu)
        .map_err(ReadError::SelectCommunication)?;
    match select_response.trailer.to_word() {
        status::FILE_NOT_FOUND => return Err(ReadError::FileNotFound),
        status::SUCCESS|status::END_OF_FILE => {},
        _ => return Err(ReadError::SelectFailed(select_response)),
    }

    if select_response.data.is_empty() {
        return Ok(None);
    }
    match decode_metadata_entries(&select_response.data) {
        Ok(entries) => Ok(file_length(&entries)),
        Err(e) => {
            // the length is only an optimization
            warn!("failed to decode file control parameters: {}", e);
            Ok(None)
        },
    }
}


/// Reads the currently selected transparent file using READ BINARY.
///
/// With a known length, chunks are requested until the length is reached; otherwise until the card
/// returns no more data or signals the end of the file. Chunks are at most 255 bytes long unless
/// `extended_length` allows extended Le fields.
#[instrument(skip(card))]
pub fn read_binary<SC: SmartCard + ?Sized>(card: &mut SC, known_length: Option<usize>, extended_length: bool) -> Result<Vec<u8>, ReadError> {
    let max_chunk_length = if extended_length { 0xFFFF } else { 0xFF };
    let mut data = Vec::with_capacity(known_length.unwrap_or(0));
    loop {
        let chunk_length = match known_length {
            Some(length) => {
                let remaining = length.saturating_sub(data.len());
                if remaining == 0 {
                    break;
                }
                remaining.min(max_chunk_length)
            },
            None => max_chunk_length,
        };
        // offset is limited to 15 bits in this form of READ BINARY
        let offset = u16::try_from(data.len())
            .ok()
            .filter(|offset| *offset <= 0x7FFF)
            .ok_or(ReadError::ReadFailed(apdu::Response::new(Vec::new(), status::WRONG_OFFSET)))?;
        let offset_bytes = offset.to_be_bytes();

        let read_response = card.communicate(
            &apdu::Apdu {
                header: apdu::CommandHeader {
                    cla: 0x00,
                    ins: 0xB0, // READ BINARY, offset or short EF identifier
                    p1: offset_bytes[0], // offset in curEF
                    p2: offset_bytes[1], // continued
                },
                data: apdu::Data::new(Vec::new(), Some(chunk_length), extended_length),
            }
        )
            .map_err(ReadError::ReadCommunication)?;

        match read_response.trailer.to_word() {
            status::SUCCESS => {
                if read_response.data.is_empty() {
                    break;
                }
                data.extend(&read_response.data);
            },
            status::END_OF_FILE => {
                data.extend(&read_response.data);
                break;
            },
            status::NOT_ENOUGH_MEMORY|status::RECORD_NOT_FOUND|status::INCORRECT_P1_P2|status::WRONG_OFFSET if known_length.is_none() => {
                // some cards signal the end of the file this way
                break;
            },
            _ => return Err(ReadError::ReadFailed(read_response)),
        }
    }
    debug!("read {} bytes", data.len());
    Ok(data)
}


/// Selects and reads a whole transparent elementary file.
pub fn read_file<SC: SmartCard + ?Sized>(card: &mut SC, file_identifier: u16) -> Result<Vec<u8>, ReadError> {
    read_file_with(card, file_identifier, false)
}

/// Selects and reads a whole transparent elementary file, optionally in extended-length chunks.
pub fn read_file_with<SC: SmartCard + ?Sized>(card: &mut SC, file_identifier: u16, extended_length: bool) -> Result<Vec<u8>, ReadError> {
    let known_length = select_file(card, file_identifier)?;
    read_binary(card, known_length, extended_length)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso7816::apdu::{Apdu, Response};
    use hex_literal::hex;

    struct FileCard {
        fcp: Vec<u8>,
        content: Vec<u8>,
        requests: Vec<Vec<u8>>,
    }
    impl SmartCard for FileCard {
        fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
            self.requests.push(request.to_bytes().unwrap());
            match request.header.ins {
                0xA4 => Ok(Response::new(self.fcp.clone(), 0x9000)),
                0xB0 => {
                    let offset = usize::from(u16::from_be_bytes([request.header.p1, request.header.p2]));
                    let le = request.data.response_data_length().unwrap();
                    if offset >= self.content.len() {
                        return Ok(Response::new(Vec::new(), 0x6B00));
                    }
                    let end = (offset + le).min(self.content.len());
                    let sw = if offset + le > self.content.len() { 0x6282 } else { 0x9000 };
                    Ok(Response::new(self.content[offset..end].to_vec(), sw))
                },
                _ => Ok(Response::new(Vec::new(), 0x6D00)),
            }
        }
    }

    #[test]
    fn metadata() {
        let entries = decode_metadata_entries(&hex!("62 0A 80 02 01 2C 83 02 01 1D 88 00")).unwrap();
        assert_eq!(file_length(&entries), Some(300));
        assert!(entries.contains(&MetadataEntry::FileIdentifier { identifier: 0x011D }));
        assert!(entries.contains(&MetadataEntry::ShortEfIdentifier { identifier: None }));
        assert!(decode_metadata_entries(&hex!("30 00")).is_err());
        assert_eq!(file_length(&[]), None);
    }

    #[test]
    fn read_with_known_length() {
        let content: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        let mut card = FileCard {
            fcp: hex!("62 04 80 02 01 2C").to_vec(),
            content: content.clone(),
            requests: Vec::new(),
        };
        let read = read_file(&mut card, EF_CARD_SECURITY).unwrap();
        assert_eq!(read, content);
        assert_eq!(card.requests.len(), 3);
        assert_eq!(card.requests[0], hex!("00 A4 02 04 02 01 1D 00"));
        assert_eq!(card.requests[1], hex!("00 B0 00 00 FF"));
        assert_eq!(card.requests[2], hex!("00 B0 00 FF 2D"));
    }

    #[test]
    fn read_with_unknown_length() {
        let content = vec![0x5A; 20];
        let mut card = FileCard {
            fcp: Vec::new(),
            content: content.clone(),
            requests: Vec::new(),
        };
        let read = read_file(&mut card, EF_CARD_ACCESS).unwrap();
        assert_eq!(read, content);
        assert_eq!(card.requests[1], hex!("00 B0 00 00 FF"));
    }

    #[test]
    fn read_extended() {
        let content: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        let mut card = FileCard {
            fcp: hex!("62 04 80 02 01 2C").to_vec(),
            content: content.clone(),
            requests: Vec::new(),
        };
        let read = read_file_with(&mut card, EF_CARD_SECURITY, true).unwrap();
        assert_eq!(read, content);
        assert_eq!(card.requests.len(), 2);
        assert_eq!(card.requests[1], hex!("00 B0 00 00 00 01 2C"));
    }

    #[test]
    fn file_not_found() {
        struct Empty;
        impl SmartCard for Empty {
            fn communicate(&mut self, _request: &Apdu) -> Result<Response, CommunicationError> {
                Ok(Response::new(Vec::new(), 0x6A82))
            }
        }
        assert!(matches!(read_file(&mut Empty, EF_CARD_ACCESS), Err(ReadError::FileNotFound)));
    }
}
