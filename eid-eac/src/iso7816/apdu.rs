//! Structures related to application protocol data units (APDUs).


use std::fmt;
use std::io::{self, Write};


/// Frequently encountered status words.
pub mod status {
    pub const SUCCESS: u16 = 0x9000;
    pub const END_OF_FILE: u16 = 0x6282;
    pub const DEACTIVATED: u16 = 0x6283;
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const SM_DATA_OBJECTS_MISSING: u16 = 0x6987;
    pub const SM_DATA_OBJECTS_INCORRECT: u16 = 0x6988;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    pub const RECORD_NOT_FOUND: u16 = 0x6A83;
    pub const NOT_ENOUGH_MEMORY: u16 = 0x6A84;
    pub const INCORRECT_P1_P2: u16 = 0x6A86;
    pub const WRONG_OFFSET: u16 = 0x6B00;
}


#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    EmptyData,
    DataTooLong { maximum: usize, obtained: usize },
}
impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::EmptyData => write!(f, "data is, but must not be, empty"),
            Self::DataTooLong { maximum, obtained } => write!(f, "too much data: obtained {} bytes, expected maximum {} bytes", obtained, maximum),
        }
    }
}
impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::EmptyData => None,
            Self::DataTooLong { .. } => None,
        }
    }
}
impl From<io::Error> for WriteError {
    fn from(value: io::Error) -> Self { Self::Io(value) }
}


#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub const fn to_be_u32(&self) -> u32 {
        ((self.cla as u32) << 24)
        | ((self.ins as u32) << 16)
        | ((self.p1 as u32) <<  8)
        | ((self.p2 as u32) <<  0)
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Whether the class byte announces that further commands of the same chain follow.
    pub const fn is_chained(&self) -> bool {
        self.cla & 0b000_1_00_00 != 0
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}

#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn from_word(word: u16) -> Self {
        let bytes = word.to_be_bytes();
        Self::new(bytes[0], bytes[1])
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub const fn is_success(&self) -> bool {
        self.to_word() == status::SUCCESS
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(())
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}


/// The body of a command APDU.
///
/// A short response data length of 0 requests 256 bytes; an extended one of 0 requests 65536.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Data {
    NoData,
    RequestDataShort {
        request_data: Vec<u8>,
    },
    RequestDataExtended {
        request_data: Vec<u8>,
    },
    ResponseDataShort {
        response_data_length: u8,
    },
    ResponseDataExtended {
        response_data_length: u16,
    },
    BothDataShort {
        request_data: Vec<u8>,
        response_data_length: u8,
    },
    BothDataExtended {
        request_data: Vec<u8>,
        response_data_length: u16,
    },
}
impl Data {
    /// Chooses the short or extended encoding for the given request data and expected response
    /// length.
    ///
    /// The extended encoding is used if either length does not fit the short one or if
    /// `force_extended` is set and there is anything to encode.
    pub fn new(request_data: Vec<u8>, response_data_length: Option<usize>, force_extended: bool) -> Self {
        let extended = force_extended
            || request_data.len() > 255
            || response_data_length.map(|le| le > 256).unwrap_or(false);
        let short_le = |le: usize| if le >= 256 { 0x00 } else { le as u8 };
        let extended_le = |le: usize| if le >= 65536 { 0x0000 } else { le as u16 };

        match (request_data.is_empty(), response_data_length, extended) {
            (true, None, _) => Self::NoData,
            (false, None, false) => Self::RequestDataShort { request_data },
            (false, None, true) => Self::RequestDataExtended { request_data },
            (true, Some(le), false) => Self::ResponseDataShort { response_data_length: short_le(le) },
            (true, Some(le), true) => Self::ResponseDataExtended { response_data_length: extended_le(le) },
            (false, Some(le), false) => Self::BothDataShort { request_data, response_data_length: short_le(le) },
            (false, Some(le), true) => Self::BothDataExtended { request_data, response_data_length: extended_le(le) },
        }
    }

    pub fn response_data_length(&self) -> Option<usize> {
        fn short(le: u8) -> usize {
            if le == 0 { 256 } else { le.into() }
        }
        fn extended(le: u16) -> usize {
            if le == 0 { 65536 } else { le.into() }
        }

        match self {
            Self::NoData => None,
            Self::RequestDataShort { .. } => None,
            Self::RequestDataExtended { .. } => None,
            Self::ResponseDataShort { response_data_length } => Some(short(*response_data_length)),
            Self::ResponseDataExtended { response_data_length } => Some(extended(*response_data_length)),
            Self::BothDataShort { response_data_length, .. } => Some(short(*response_data_length)),
            Self::BothDataExtended { response_data_length, .. } => Some(extended(*response_data_length)),
        }
    }

    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::NoData => None,
            Self::RequestDataShort { request_data } => Some(request_data.as_slice()),
            Self::RequestDataExtended { request_data } => Some(request_data.as_slice()),
            Self::ResponseDataShort { .. } => None,
            Self::ResponseDataExtended { .. } => None,
            Self::BothDataShort { request_data, .. } => Some(request_data.as_slice()),
            Self::BothDataExtended { request_data, .. } => Some(request_data.as_slice()),
        }
    }

    pub fn is_extended(&self) -> bool {
        match self {
            Self::RequestDataExtended { .. } => true,
            Self::ResponseDataExtended { .. } => true,
            Self::BothDataExtended { .. } => true,
            _ => false,
        }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        fn ensure_not_empty(request_data: &[u8]) -> Result<(), WriteError> {
            if request_data.len() == 0 {
                Err(WriteError::EmptyData)
            } else {
                Ok(())
            }
        }
        fn short_length(request_data: &[u8]) -> Result<u8, WriteError> {
            ensure_not_empty(request_data)?;
            u8::try_from(request_data.len())
                .map_err(|_| WriteError::DataTooLong { maximum: 255, obtained: request_data.len() })
        }
        fn extended_length(request_data: &[u8]) -> Result<[u8; 2], WriteError> {
            ensure_not_empty(request_data)?;
            u16::try_from(request_data.len())
                .map(|length| length.to_be_bytes())
                .map_err(|_| WriteError::DataTooLong { maximum: 65535, obtained: request_data.len() })
        }

        match self {
            // "case" refers to the cases in ISO/IEC 7816-3:2006 § 12.1.3
            Data::NoData => {
                // case 1
                Ok(())
            },
            Data::RequestDataShort { request_data } => {
                // case 3S
                let length_byte = short_length(request_data)?;

                // [Lc] [Data]
                writer.write_all(&[length_byte])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::RequestDataExtended { request_data } => {
                // case 3E
                let length_bytes = extended_length(request_data)?;

                // [0x00] [LcMSB] [LcLSB] [Data]
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::ResponseDataShort { response_data_length } => {
                // case 2S
                // [Le]
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::ResponseDataExtended { response_data_length } => {
                // case 2E
                // [0x00] [LeMSB] [LeLSB]
                let length_bytes = response_data_length.to_be_bytes();
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                Ok(())
            },
            Data::BothDataShort { request_data, response_data_length } => {
                // case 4S
                let length_byte = short_length(request_data)?;

                // [Lc] [Data] [Le]
                writer.write_all(&[length_byte])?;
                writer.write_all(request_data)?;
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::BothDataExtended { request_data, response_data_length } => {
                // case 4E
                let request_length_bytes = extended_length(request_data)?;
                let response_length_bytes = response_data_length.to_be_bytes();

                // [0x00] [LcMSB] [LcLSB] [Data] [LeMSB] [LeLSB]
                writer.write_all(&[0x00, request_length_bytes[0], request_length_bytes[1]])?;
                writer.write_all(request_data)?;
                writer.write_all(&response_length_bytes)?;
                Ok(())
            },
        }
    }

    /// Parses the bytes following the command header.
    ///
    /// Returns `None` if the lengths are inconsistent with the amount of data.
    pub fn try_from_body(body: &[u8]) -> Option<Self> {
        match body {
            [] => Some(Self::NoData),
            [le] => Some(Self::ResponseDataShort { response_data_length: *le }),
            [0x00, le_hi, le_lo] => Some(Self::ResponseDataExtended {
                response_data_length: u16::from_be_bytes([*le_hi, *le_lo]),
            }),
            [0x00, lc_hi, lc_lo, rest @ ..] => {
                let lc = usize::from(u16::from_be_bytes([*lc_hi, *lc_lo]));
                if lc == 0 {
                    None
                } else if rest.len() == lc {
                    Some(Self::RequestDataExtended { request_data: rest.to_vec() })
                } else if rest.len() == lc + 2 {
                    Some(Self::BothDataExtended {
                        request_data: rest[..lc].to_vec(),
                        response_data_length: u16::from_be_bytes([rest[lc], rest[lc + 1]]),
                    })
                } else {
                    None
                }
            },
            [lc, rest @ ..] => {
                let lc = usize::from(*lc);
                if rest.len() == lc {
                    Some(Self::RequestDataShort { request_data: rest.to_vec() })
                } else if rest.len() == lc + 1 {
                    Some(Self::BothDataShort {
                        request_data: rest[..lc].to_vec(),
                        response_data_length: rest[lc],
                    })
                } else {
                    None
                }
            },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        self.header.write_bytes(writer)?;
        self.data.write_bytes(writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut ret = Vec::new();
        self.write_bytes(&mut ret)?;
        Ok(ret)
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let header = CommandHeader {
            cla: bytes[0],
            ins: bytes[1],
            p1: bytes[2],
            p2: bytes[3],
        };
        let data = Data::try_from_body(&bytes[4..])?;
        Some(Self {
            header,
            data,
        })
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub fn new(data: Vec<u8>, status_word: u16) -> Self {
        Self {
            data,
            trailer: ResponseTrailer::from_word(status_word),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let data = bytes[..bytes.len() - 2].to_vec();
        let trailer = ResponseTrailer {
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        };
        Some(Self {
            data,
            trailer,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.data.len() + 2);
        ret.extend(&self.data);
        ret.extend(self.trailer.to_bytes());
        ret
    }

    pub fn is_success(&self) -> bool {
        self.trailer.is_success()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_cases() {
        let apdu = Apdu {
            header: CommandHeader { cla: 0x00, ins: 0x84, p1: 0x00, p2: 0x00 },
            data: Data::new(Vec::new(), Some(8), false),
        };
        assert_eq!(apdu.to_bytes().unwrap(), hex!("00 84 00 00 08"));

        let apdu = Apdu {
            header: CommandHeader { cla: 0x00, ins: 0x22, p1: 0x81, p2: 0xB6 },
            data: Data::new(hex!("83 01 01").to_vec(), None, false),
        };
        assert_eq!(apdu.to_bytes().unwrap(), hex!("00 22 81 B6 03 83 01 01"));

        let data = Data::new(vec![0xAB; 300], Some(256), false);
        assert!(data.is_extended());
        let mut bytes = Vec::new();
        data.write_bytes(&mut bytes).unwrap();
        assert_eq!(&bytes[..3], &hex!("00 01 2C"));
        assert_eq!(&bytes[303..], &hex!("01 00"));
    }

    #[test]
    fn maximum_response_lengths() {
        assert_eq!(Data::ResponseDataShort { response_data_length: 0 }.response_data_length(), Some(256));
        assert_eq!(Data::ResponseDataExtended { response_data_length: 0 }.response_data_length(), Some(65536));
        assert_eq!(Data::new(Vec::new(), Some(256), false), Data::ResponseDataShort { response_data_length: 0 });
        assert_eq!(Data::new(Vec::new(), Some(65536), false), Data::ResponseDataExtended { response_data_length: 0 });
    }

    #[test]
    fn short_data_limit() {
        let data = Data::RequestDataShort { request_data: vec![0x00; 256] };
        assert!(matches!(
            data.write_bytes(&mut Vec::new()),
            Err(WriteError::DataTooLong { maximum: 255, obtained: 256 }),
        ));
        assert!(matches!(
            Data::RequestDataShort { request_data: Vec::new() }.write_bytes(&mut Vec::new()),
            Err(WriteError::EmptyData),
        ));
    }

    #[test]
    fn parse_cases() {
        let parsed = Apdu::try_from_bytes(&hex!("00 22 81 B6")).unwrap();
        assert_eq!(parsed.data, Data::NoData);

        let parsed = Apdu::try_from_bytes(&hex!("00 B0 00 00 00")).unwrap();
        assert_eq!(parsed.data.response_data_length(), Some(256));

        let parsed = Apdu::try_from_bytes(&hex!("00 A4 02 04 02 01 1C 00")).unwrap();
        assert_eq!(parsed.data.request_data(), Some(&hex!("01 1C")[..]));
        assert_eq!(parsed.data.response_data_length(), Some(256));

        let parsed = Apdu::try_from_bytes(&hex!("00 2A 00 BE 00 00 02 AB CD")).unwrap();
        assert_eq!(parsed.data, Data::RequestDataExtended { request_data: hex!("AB CD").to_vec() });

        let parsed = Apdu::try_from_bytes(&hex!("0C B0 00 00 00 00 02 AB CD 00 00")).unwrap();
        assert_eq!(parsed.data.response_data_length(), Some(65536));

        assert_eq!(Apdu::try_from_bytes(&hex!("00 22 81 B6 05 83 01")), None);
        assert_eq!(Apdu::try_from_bytes(&hex!("00 22 81")), None);
    }
}
