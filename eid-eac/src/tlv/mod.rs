//! BER-TLV (Basic Encoding Rules tag-length-value) structures.
//!
//! Card data objects, SecurityInfos and Card Verifiable Certificates are all encoded as BER-TLV.
//! This module decodes them into an owned tree of [`Tlv`] nodes, each node owning its children, and
//! encodes such trees back into bytes. The [`parser::Parser`] cursor is then used to match the
//! children of a node against the expected structure.
//!
//! Indefinite lengths are never used by the protocols in question and are rejected.


pub mod parser;
pub mod path;
pub mod template;


use std::fmt;

use rasn::types::ObjectIdentifier;

use crate::der_util::{encode_primitive_length, oid_from_der_bytes, try_decode_primitive_length};
use crate::error::ErrorKind;


/// Nesting depth beyond which decoding is refused.
const MAX_DEPTH: usize = 32;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}
impl TagClass {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Universal,
            0b01 => Self::Application,
            0b10 => Self::ContextSpecific,
            _ => Self::Private,
        }
    }

    const fn to_bits(&self) -> u8 {
        match self {
            Self::Universal => 0b00,
            Self::Application => 0b01,
            Self::ContextSpecific => 0b10,
            Self::Private => 0b11,
        }
    }
}


/// A BER tag: class, constructed flag and tag number.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag {
    class: TagClass,
    constructed: bool,
    number: u32,
}
impl Tag {
    pub const fn new(class: TagClass, constructed: bool, number: u32) -> Self {
        Self { class, constructed, number }
    }

    /// Interprets the big-endian value `raw` as the encoded tag bytes, e.g. `0x7F21`.
    ///
    /// Only meant for constants; an encoding that does not make sense yields a mangled tag rather
    /// than an error.
    pub const fn from_raw(raw: u32) -> Self {
        let bytes = raw.to_be_bytes();
        let mut start = 0;
        while start < 3 && bytes[start] == 0x00 {
            start += 1;
        }
        let first = bytes[start];
        let class = TagClass::from_bits(first >> 6);
        let constructed = first & 0b0010_0000 != 0;
        let mut number = (first & 0b0001_1111) as u32;
        if number == 0b0001_1111 {
            number = 0;
            let mut i = start + 1;
            while i < 4 {
                number = (number << 7) | (bytes[i] & 0b0111_1111) as u32;
                i += 1;
            }
        }
        Self { class, constructed, number }
    }

    pub const fn class(&self) -> TagClass { self.class }
    pub const fn is_constructed(&self) -> bool { self.constructed }
    pub const fn number(&self) -> u32 { self.number }

    /// Decodes a tag from the start of `input`, returning it along with the rest of the input.
    pub fn decode(input: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (&first, mut rest) = input.split_first()
            .ok_or(DecodeError::Truncated)?;
        let class = TagClass::from_bits(first >> 6);
        let constructed = first & 0b0010_0000 != 0;
        let low_bits = first & 0b0001_1111;
        if low_bits != 0b0001_1111 {
            return Ok((Self { class, constructed, number: low_bits.into() }, rest));
        }

        // multi-byte tag number, base 128, at most four subsequent bytes
        let mut number: u32 = 0;
        let mut count = 0;
        loop {
            let (&b, next_rest) = rest.split_first()
                .ok_or(DecodeError::Truncated)?;
            rest = next_rest;
            if count == 0 && b == 0b1000_0000 {
                return Err(DecodeError::MalformedTag);
            }
            count += 1;
            if count > 4 {
                return Err(DecodeError::MalformedTag);
            }
            number = (number << 7) | u32::from(b & 0b0111_1111);
            if b & 0b1000_0000 == 0 {
                break;
            }
        }
        Ok((Self { class, constructed, number }, rest))
    }

    /// Appends the encoding of this tag to `output`.
    pub fn encode(&self, output: &mut Vec<u8>) {
        let mut first = self.class.to_bits() << 6;
        if self.constructed {
            first |= 0b0010_0000;
        }
        if self.number < 0b0001_1111 {
            output.push(first | (self.number as u8));
            return;
        }

        output.push(first | 0b0001_1111);
        let mut groups = [0u8; 5];
        let mut count = 0;
        let mut rest = self.number;
        loop {
            groups[count] = (rest & 0b0111_1111) as u8;
            count += 1;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        for i in (0..count).rev() {
            let continuation = if i > 0 { 0b1000_0000 } else { 0 };
            output.push(groups[i] | continuation);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(2);
        self.encode(&mut ret);
        ret
    }
}
impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}
impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.to_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}


/// Universal tags.
pub mod tags {
    use super::Tag;

    pub const BOOLEAN: Tag = Tag::from_raw(0x01);
    pub const INTEGER: Tag = Tag::from_raw(0x02);
    pub const BIT_STRING: Tag = Tag::from_raw(0x03);
    pub const OCTET_STRING: Tag = Tag::from_raw(0x04);
    pub const NULL: Tag = Tag::from_raw(0x05);
    pub const OBJECT_IDENTIFIER: Tag = Tag::from_raw(0x06);
    pub const UTF8_STRING: Tag = Tag::from_raw(0x0C);
    pub const PRINTABLE_STRING: Tag = Tag::from_raw(0x13);
    pub const IA5_STRING: Tag = Tag::from_raw(0x16);
    pub const SEQUENCE: Tag = Tag::from_raw(0x30);
    pub const SET: Tag = Tag::from_raw(0x31);
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DecodeError {
    Truncated,
    MalformedTag,
    MalformedLength,
    IndefiniteLength,
    NestingTooDeep,
    TrailingData { count: usize },
    UnexpectedTag { expected: Tag, found: Tag },
    MissingElement { expected: Tag },
    UnexpectedElement { found: Tag },
    InvalidValue { tag: Tag, reason: &'static str },
}
impl DecodeError {
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Decode
    }
}
impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated
                => write!(f, "data is truncated"),
            Self::MalformedTag
                => write!(f, "malformed tag"),
            Self::MalformedLength
                => write!(f, "malformed length"),
            Self::IndefiniteLength
                => write!(f, "indefinite length is not supported"),
            Self::NestingTooDeep
                => write!(f, "structure is nested more than {} levels deep", MAX_DEPTH),
            Self::TrailingData { count }
                => write!(f, "{} bytes of trailing data", count),
            Self::UnexpectedTag { expected, found }
                => write!(f, "expected tag {}, found {}", expected, found),
            Self::MissingElement { expected }
                => write!(f, "expected tag {}, found end of structure", expected),
            Self::UnexpectedElement { found }
                => write!(f, "expected end of structure, found tag {}", found),
            Self::InvalidValue { tag, reason }
                => write!(f, "invalid value for tag {}: {}", tag, reason),
        }
    }
}
impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Truncated => None,
            Self::MalformedTag => None,
            Self::MalformedLength => None,
            Self::IndefiniteLength => None,
            Self::NestingTooDeep => None,
            Self::TrailingData { .. } => None,
            Self::UnexpectedTag { .. } => None,
            Self::MissingElement { .. } => None,
            Self::UnexpectedElement { .. } => None,
            Self::InvalidValue { .. } => None,
        }
    }
}


/// A single encoded element borrowed from an input buffer.
///
/// Used where the exact original encoding matters (signed certificate bodies, MAC input).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RawElement<'d> {
    pub tag: Tag,
    /// Value bytes.
    pub value: &'d [u8],
    /// Tag, length and value bytes.
    pub encoded: &'d [u8],
}
impl<'d> RawElement<'d> {
    /// Reads one element from the start of `input`, returning it along with the rest of the input.
    pub fn read(input: &'d [u8]) -> Result<(Self, &'d [u8]), DecodeError> {
        let (tag, after_tag) = Tag::decode(input)?;
        let length_byte = *after_tag.first()
            .ok_or(DecodeError::Truncated)?;
        if length_byte == 0b1000_0000 {
            return Err(DecodeError::IndefiniteLength);
        }
        if length_byte == 0b1111_1111 || (length_byte & 0b1000_0000 != 0 && usize::from(length_byte & 0b0111_1111) > 4) {
            return Err(DecodeError::MalformedLength);
        }
        let (length, after_length) = try_decode_primitive_length(after_tag)
            .ok_or(DecodeError::Truncated)?;
        if length > after_length.len() {
            return Err(DecodeError::Truncated);
        }
        let header_length = input.len() - after_length.len();
        let value = &after_length[..length];
        let encoded = &input[..header_length + length];
        Ok((Self { tag, value, encoded }, &after_length[length..]))
    }

    /// Reads all elements concatenated in `input`.
    pub fn read_all(mut input: &'d [u8]) -> Result<Vec<Self>, DecodeError> {
        let mut ret = Vec::new();
        while !input.is_empty() {
            let (element, rest) = Self::read(input)?;
            ret.push(element);
            input = rest;
        }
        Ok(ret)
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Content {
    Primitive(Vec<u8>),
    Constructed(Vec<Tlv>),
}


/// A decoded BER-TLV node.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tlv {
    tag: Tag,
    content: Content,
}
impl Tlv {
    /// Creates a primitive node. The constructed flag of `tag` is cleared.
    pub fn primitive(tag: Tag, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: Tag::new(tag.class, false, tag.number),
            content: Content::Primitive(value.into()),
        }
    }

    /// Creates a constructed node. The constructed flag of `tag` is set.
    pub fn constructed(tag: Tag, children: Vec<Tlv>) -> Self {
        Self {
            tag: Tag::new(tag.class, true, tag.number),
            content: Content::Constructed(children),
        }
    }

    pub fn tag(&self) -> Tag { self.tag }
    pub fn content(&self) -> &Content { &self.content }

    /// The children of a constructed node; empty for primitive nodes.
    pub fn children(&self) -> &[Tlv] {
        match &self.content {
            Content::Primitive(_) => &[],
            Content::Constructed(children) => children.as_slice(),
        }
    }

    /// The content octets of a primitive node.
    pub fn primitive_value(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Primitive(value) => Some(value.as_slice()),
            Content::Constructed(_) => None,
        }
    }

    /// The content octets of this node; for a constructed node, the concatenated encodings of its
    /// children.
    pub fn value_bytes(&self) -> Vec<u8> {
        match &self.content {
            Content::Primitive(value) => value.clone(),
            Content::Constructed(children) => {
                let mut ret = Vec::new();
                for child in children {
                    child.encode(&mut ret);
                }
                ret
            },
        }
    }

    /// Returns a cursor over the children of this node.
    pub fn parser(&self) -> parser::Parser<'_> {
        parser::Parser::new(self.children())
    }

    /// The first direct child with the given tag.
    pub fn find_child(&self, tag: Tag) -> Option<&Tlv> {
        self.children().iter().find(|c| c.tag == tag)
    }

    /// Decodes one node from the start of `input`, returning it with the rest of the input.
    pub fn decode(input: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (element, rest) = RawElement::read(input)?;
        let tlv = Self::from_raw_element(&element, 0)?;
        Ok((tlv, rest))
    }

    /// Decodes exactly one node spanning the whole of `input`.
    pub fn decode_exact(input: &[u8]) -> Result<Self, DecodeError> {
        let (tlv, rest) = Self::decode(input)?;
        if !rest.is_empty() {
            return Err(DecodeError::TrailingData { count: rest.len() });
        }
        Ok(tlv)
    }

    /// Decodes all nodes concatenated in `input`.
    pub fn decode_all(mut input: &[u8]) -> Result<Vec<Self>, DecodeError> {
        let mut ret = Vec::new();
        while !input.is_empty() {
            let (tlv, rest) = Self::decode(input)?;
            ret.push(tlv);
            input = rest;
        }
        Ok(ret)
    }

    fn from_raw_element(element: &RawElement<'_>, depth: usize) -> Result<Self, DecodeError> {
        if !element.tag.constructed {
            return Ok(Self {
                tag: element.tag,
                content: Content::Primitive(element.value.to_vec()),
            });
        }
        if depth >= MAX_DEPTH {
            return Err(DecodeError::NestingTooDeep);
        }

        let mut children = Vec::new();
        let mut rest = element.value;
        while !rest.is_empty() {
            let (child_element, child_rest) = RawElement::read(rest)?;
            children.push(Self::from_raw_element(&child_element, depth + 1)?);
            rest = child_rest;
        }
        Ok(Self {
            tag: element.tag,
            content: Content::Constructed(children),
        })
    }

    /// Appends the encoding of this node to `output`.
    pub fn encode(&self, output: &mut Vec<u8>) {
        self.tag.encode(output);
        match &self.content {
            Content::Primitive(value) => {
                encode_primitive_length(output, value.len());
                output.extend(value);
            },
            Content::Constructed(_) => {
                let value = self.value_bytes();
                encode_primitive_length(output, value.len());
                output.extend(&value);
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::new();
        self.encode(&mut ret);
        ret
    }

    fn expect_primitive(&self) -> Result<&[u8], DecodeError> {
        self.primitive_value()
            .ok_or(DecodeError::InvalidValue { tag: self.tag, reason: "expected a primitive value" })
    }

    /// Interprets this node as a non-negative INTEGER fitting into 64 bits.
    pub fn to_u64(&self) -> Result<u64, DecodeError> {
        let value = self.expect_primitive()?;
        if value.is_empty() {
            return Err(DecodeError::InvalidValue { tag: self.tag, reason: "empty integer" });
        }
        if value[0] & 0b1000_0000 != 0 {
            return Err(DecodeError::InvalidValue { tag: self.tag, reason: "negative integer" });
        }
        let significant = if value[0] == 0x00 { &value[1..] } else { value };
        if significant.len() > 8 {
            return Err(DecodeError::InvalidValue { tag: self.tag, reason: "integer too large" });
        }
        Ok(significant.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Interprets this node as a non-negative INTEGER of arbitrary size, returning its big-endian
    /// magnitude without leading zero bytes.
    pub fn to_unsigned_bytes(&self) -> Result<&[u8], DecodeError> {
        let value = self.expect_primitive()?;
        if value.is_empty() {
            return Err(DecodeError::InvalidValue { tag: self.tag, reason: "empty integer" });
        }
        let first_significant = value.iter()
            .position(|b| *b != 0x00)
            .unwrap_or(value.len());
        Ok(&value[first_significant..])
    }

    /// Interprets this node as an OBJECT IDENTIFIER.
    pub fn to_oid(&self) -> Result<ObjectIdentifier, DecodeError> {
        let value = self.expect_primitive()?;
        oid_from_der_bytes(value)
            .ok_or(DecodeError::InvalidValue { tag: self.tag, reason: "malformed object identifier" })
    }

    /// Interprets this node as a character string.
    pub fn to_text(&self) -> Result<String, DecodeError> {
        let value = self.expect_primitive()?;
        String::from_utf8(value.to_vec())
            .map_err(|_| DecodeError::InvalidValue { tag: self.tag, reason: "not valid UTF-8" })
    }
}


/// Encodes a non-negative integer as minimal INTEGER content octets.
pub fn encode_unsigned(value: &[u8]) -> Vec<u8> {
    let first_significant = value.iter()
        .position(|b| *b != 0x00)
        .unwrap_or(value.len());
    let significant = &value[first_significant..];
    let mut ret = Vec::with_capacity(significant.len() + 1);
    if significant.first().map(|b| b & 0b1000_0000 != 0).unwrap_or(true) {
        ret.push(0x00);
    }
    ret.extend(significant);
    ret
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn tag_encodings() {
        let t = Tag::from_raw(0x7F21);
        assert_eq!(t.class(), TagClass::Application);
        assert!(t.is_constructed());
        assert_eq!(t.number(), 0x21);
        assert_eq!(t.to_bytes(), hex!("7F 21"));

        let t = Tag::from_raw(0x5F37);
        assert!(!t.is_constructed());
        assert_eq!(t.number(), 0x37);

        let t = Tag::from_raw(0x7F8101);
        assert_eq!(t.number(), 0x81);
        assert_eq!(t.to_bytes(), hex!("7F 81 01"));

        assert_eq!(Tag::decode(&hex!("5F 80 01")), Err(DecodeError::MalformedTag));
        assert_eq!(Tag::from_raw(0x87).class(), TagClass::ContextSpecific);
        assert_eq!(format!("{}", Tag::from_raw(0x7F4C)), "0x7F4C");
    }

    #[test]
    fn decode_nested() {
        let bytes = hex!("7C 0A 85 08 C2 B0 BD 78 D9 4B A8 66");
        let tlv = Tlv::decode_exact(&bytes).unwrap();
        assert_eq!(tlv.tag(), Tag::from_raw(0x7C));
        assert_eq!(tlv.children().len(), 1);
        let token = tlv.find_child(Tag::from_raw(0x85)).unwrap();
        assert_eq!(token.primitive_value(), Some(&hex!("C2 B0 BD 78 D9 4B A8 66")[..]));
        assert_eq!(tlv.value_bytes(), bytes[2..].to_vec());
        assert_eq!(tlv.to_bytes(), bytes.to_vec());
    }

    #[test]
    fn long_lengths() {
        let mut bytes = vec![0x04, 0x81, 0x80];
        bytes.extend([0xAB; 0x80]);
        let tlv = Tlv::decode_exact(&bytes).unwrap();
        assert_eq!(tlv.primitive_value().unwrap().len(), 0x80);
        assert_eq!(tlv.to_bytes(), bytes);
    }

    #[test]
    fn zero_length() {
        let tlv = Tlv::decode_exact(&hex!("30 00")).unwrap();
        assert!(tlv.children().is_empty());
        assert_eq!(tlv.to_bytes(), hex!("30 00"));
    }

    #[test]
    fn truncation_never_panics() {
        let bytes = hex!("
            30 12 06 0A 04 00 7F 00 07 02 02 04 02 02
            02 01 02 02 01 0D
        ");
        assert!(Tlv::decode_exact(&bytes).is_ok());
        for cut in 0..bytes.len() {
            let result = Tlv::decode_exact(&bytes[..cut]);
            assert!(result.is_err(), "prefix of length {} decoded", cut);
        }
    }

    #[test]
    fn malformed_lengths() {
        assert_eq!(Tlv::decode(&hex!("30 80 00 00")), Err(DecodeError::IndefiniteLength));
        assert_eq!(Tlv::decode(&hex!("04 85 00 00 00 00 01 00")), Err(DecodeError::MalformedLength));
        assert_eq!(Tlv::decode(&hex!("04 84 FF FF FF FF 00")), Err(DecodeError::Truncated));
        assert_eq!(Tlv::decode(&hex!("04")), Err(DecodeError::Truncated));
        assert_eq!(Tlv::decode_exact(&hex!("05 00 00")), Err(DecodeError::TrailingData { count: 1 }));
    }

    #[test]
    fn integers() {
        assert_eq!(Tlv::primitive(tags::INTEGER, hex!("0D")).to_u64(), Ok(13));
        assert_eq!(Tlv::primitive(tags::INTEGER, hex!("00 FF")).to_u64(), Ok(255));
        assert!(Tlv::primitive(tags::INTEGER, hex!("FF")).to_u64().is_err());
        assert!(Tlv::primitive(tags::INTEGER, Vec::new()).to_u64().is_err());
        assert_eq!(encode_unsigned(&hex!("00 00 FF")), hex!("00 FF"));
        assert_eq!(encode_unsigned(&hex!("7F")), hex!("7F"));
        assert_eq!(encode_unsigned(&[]), hex!("00"));
    }

    #[test]
    fn nesting_limit() {
        let mut bytes = Vec::new();
        for _ in 0..40 {
            let mut wrapped = vec![0x30];
            encode_primitive_length(&mut wrapped, bytes.len());
            wrapped.extend(&bytes);
            bytes = wrapped;
        }
        assert_eq!(Tlv::decode_exact(&bytes), Err(DecodeError::NestingTooDeep));
    }
}
