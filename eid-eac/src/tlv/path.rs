//! ISO 7816-15 `Path` objects.
//!
//! ```plain
//! Path ::= SEQUENCE {
//!     efidOrPath OCTET STRING,
//!     index INTEGER (0..cia-ub-index) OPTIONAL,
//!     length [0] INTEGER (0..cia-ub-index) OPTIONAL
//! } (WITH COMPONENTS {..., index PRESENT, length PRESENT}|
//!    WITH COMPONENTS {..., index ABSENT, length ABSENT})
//! ```


use crate::tlv::{DecodeError, Tag, Tlv, encode_unsigned, tags};


const LENGTH_TAG: Tag = Tag::from_raw(0x80);


/// A reference to a file, or to a part of a file, on the card.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Path {
    /// A file identifier or a concatenation of file identifiers.
    pub efid_or_path: Vec<u8>,

    /// Offset and length of the referenced part, if only a part of the file is meant.
    pub range: Option<PathRange>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PathRange {
    pub index: u64,
    pub length: u64,
}

impl Path {
    pub fn decode(tlv: &Tlv) -> Result<Self, DecodeError> {
        if tlv.tag() != tags::SEQUENCE {
            return Err(DecodeError::UnexpectedTag { expected: tags::SEQUENCE, found: tlv.tag() });
        }
        let mut parser = tlv.parser();
        let efid_or_path = parser.expect(tags::OCTET_STRING)?
            .primitive_value()
            .ok_or(DecodeError::InvalidValue { tag: tags::OCTET_STRING, reason: "constructed path" })?
            .to_vec();

        // index and length come as a pair or not at all
        let range = if parser.match_tag(tags::INTEGER) {
            if !parser.match_lookahead(1, LENGTH_TAG) {
                return Err(match parser.lookahead(1) {
                    Some(other) => DecodeError::UnexpectedTag { expected: LENGTH_TAG, found: other.tag() },
                    None => DecodeError::MissingElement { expected: LENGTH_TAG },
                });
            }
            let index = parser.expect(tags::INTEGER)?.to_u64()?;
            let length = parser.expect(LENGTH_TAG)?.to_u64()?;
            Some(PathRange { index, length })
        } else {
            None
        };
        parser.expect_end()?;

        Ok(Self { efid_or_path, range })
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&Tlv::decode_exact(bytes)?)
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut children = vec![Tlv::primitive(tags::OCTET_STRING, self.efid_or_path.clone())];
        if let Some(range) = &self.range {
            children.push(Tlv::primitive(tags::INTEGER, encode_unsigned(&range.index.to_be_bytes())));
            children.push(Tlv::primitive(LENGTH_TAG, encode_unsigned(&range.length.to_be_bytes())));
        }
        Tlv::constructed(tags::SEQUENCE, children)
    }

    /// The file identifier of the referenced elementary file, if the path consists of exactly one.
    pub fn file_identifier(&self) -> Option<u16> {
        match self.efid_or_path.as_slice() {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{Path, PathRange};
    use crate::tlv::{DecodeError, Tag};
    use hex_literal::hex;

    #[test]
    fn plain_file_identifier() {
        let path = Path::decode_bytes(&hex!("30 04 04 02 01 1D")).unwrap();
        assert_eq!(path.efid_or_path, hex!("01 1D"));
        assert_eq!(path.range, None);
        assert_eq!(path.file_identifier(), Some(0x011D));
        assert_eq!(path.to_tlv().to_bytes(), hex!("30 04 04 02 01 1D"));
    }

    #[test]
    fn with_range() {
        let path = Path {
            efid_or_path: hex!("3F 00 01 1D").to_vec(),
            range: Some(PathRange { index: 4, length: 300 }),
        };
        let encoded = path.to_tlv().to_bytes();
        assert_eq!(encoded, hex!("30 0D 04 04 3F 00 01 1D 02 01 04 80 02 01 2C"));
        assert_eq!(Path::decode_bytes(&encoded).unwrap(), path);
        assert_eq!(path.file_identifier(), None);
    }

    #[test]
    fn index_without_length() {
        assert_eq!(
            Path::decode_bytes(&hex!("30 07 04 02 01 1D 02 01 04")),
            Err(DecodeError::MissingElement { expected: Tag::from_raw(0x80) }),
        );
        assert_eq!(
            Path::decode_bytes(&hex!("30 0A 04 02 01 1D 02 01 04 81 01 01")),
            Err(DecodeError::UnexpectedTag { expected: Tag::from_raw(0x80), found: Tag::from_raw(0x81) }),
        );
    }
}
