//! A cursor for matching the children of a constructed node against an expected structure.


use crate::tlv::{DecodeError, Tag, TagClass, Tlv};


/// A cursor over a sequence of sibling nodes.
///
/// Elements are consumed front to back. Matching functions only inspect; `expect`, `optional` and
/// `next` consume.
#[derive(Clone, Debug)]
pub struct Parser<'t> {
    elements: &'t [Tlv],
    position: usize,
}
impl<'t> Parser<'t> {
    pub const fn new(elements: &'t [Tlv]) -> Self {
        Self {
            elements,
            position: 0,
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.position >= self.elements.len()
    }

    /// The elements not consumed yet.
    pub fn remaining(&self) -> &'t [Tlv] {
        &self.elements[self.position.min(self.elements.len())..]
    }

    pub fn peek(&self) -> Option<&'t Tlv> {
        self.lookahead(0)
    }

    /// The element `n` positions after the next unconsumed one, without consuming anything.
    pub fn lookahead(&self, n: usize) -> Option<&'t Tlv> {
        self.elements.get(self.position.checked_add(n)?)
    }

    pub fn next(&mut self) -> Option<&'t Tlv> {
        let element = self.elements.get(self.position)?;
        self.position += 1;
        Some(element)
    }

    /// Whether the next unconsumed element has the given tag.
    pub fn match_tag(&self, tag: Tag) -> bool {
        self.match_lookahead(0, tag)
    }

    /// Whether the element `n` positions ahead has the given tag.
    pub fn match_lookahead(&self, n: usize, tag: Tag) -> bool {
        self.lookahead(n)
            .map(|element| element.tag() == tag)
            .unwrap_or(false)
    }

    /// Whether the next unconsumed element has any of the given tags.
    pub fn match_any(&self, tags: &[Tag]) -> bool {
        self.peek()
            .map(|element| tags.contains(&element.tag()))
            .unwrap_or(false)
    }

    /// Whether the next unconsumed element is of the given class and form, regardless of its tag
    /// number.
    pub fn match_class(&self, class: TagClass, constructed: bool) -> bool {
        self.peek()
            .map(|element| element.tag().class() == class && element.tag().is_constructed() == constructed)
            .unwrap_or(false)
    }

    /// Consumes the next element, failing if it is absent or has a different tag.
    pub fn expect(&mut self, tag: Tag) -> Result<&'t Tlv, DecodeError> {
        match self.peek() {
            None => Err(DecodeError::MissingElement { expected: tag }),
            Some(element) if element.tag() != tag => Err(DecodeError::UnexpectedTag {
                expected: tag,
                found: element.tag(),
            }),
            Some(element) => {
                self.position += 1;
                Ok(element)
            },
        }
    }

    /// Consumes the next element if it has the given tag.
    pub fn optional(&mut self, tag: Tag) -> Option<&'t Tlv> {
        if self.match_tag(tag) {
            self.next()
        } else {
            None
        }
    }

    /// Skips elements until one with the given tag is found and consumes it.
    ///
    /// Used for structures whose elements may appear with unknown extensions in between.
    pub fn find(&mut self, tag: Tag) -> Option<&'t Tlv> {
        while let Some(element) = self.next() {
            if element.tag() == tag {
                return Some(element);
            }
        }
        None
    }

    /// Fails if any element remains unconsumed.
    pub fn expect_end(&self) -> Result<(), DecodeError> {
        match self.peek() {
            None => Ok(()),
            Some(element) => Err(DecodeError::UnexpectedElement { found: element.tag() }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::Parser;
    use crate::tlv::{DecodeError, Tag, TagClass, Tlv, tags};
    use hex_literal::hex;

    #[test]
    fn matching() {
        let tlv = Tlv::decode_exact(&hex!("30 09 06 01 00 02 01 01 80 01 05")).unwrap();
        let mut parser = tlv.parser();
        assert!(parser.match_tag(tags::OBJECT_IDENTIFIER));
        assert!(parser.match_lookahead(1, tags::INTEGER));
        assert!(parser.match_lookahead(2, Tag::from_raw(0x80)));
        assert!(!parser.match_lookahead(3, Tag::from_raw(0x80)));
        assert!(parser.match_class(TagClass::Universal, false));

        parser.expect(tags::OBJECT_IDENTIFIER).unwrap();
        assert!(parser.optional(tags::BOOLEAN).is_none());
        assert_eq!(
            parser.expect(tags::OCTET_STRING),
            Err(DecodeError::UnexpectedTag { expected: tags::OCTET_STRING, found: tags::INTEGER }),
        );
        assert_eq!(parser.expect(tags::INTEGER).unwrap().to_u64(), Ok(1));
        assert_eq!(parser.expect_end(), Err(DecodeError::UnexpectedElement { found: Tag::from_raw(0x80) }));
        parser.next();
        assert!(parser.is_at_end());
        assert_eq!(parser.expect(tags::INTEGER), Err(DecodeError::MissingElement { expected: tags::INTEGER }));
        assert_eq!(parser.expect_end(), Ok(()));
    }

    #[test]
    fn empty() {
        let parser = Parser::new(&[]);
        assert!(parser.is_at_end());
        assert!(!parser.match_tag(tags::SEQUENCE));
        assert!(parser.remaining().is_empty());
    }
}
