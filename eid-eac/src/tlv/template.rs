//! Discretionary data templates.
//!
//! A template is identified by an object identifier and carries arbitrary data objects whose
//! meaning depends on that identifier. Certificate extensions are encoded this way.


use rasn::types::{ObjectIdentifier, Oid};

use crate::der_util::oid_to_der_bytes;
use crate::tlv::{DecodeError, Tag, Tlv, tags};


pub const DISCRETIONARY_DATA_TEMPLATE: Tag = Tag::from_raw(0x73);


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscretionaryDataTemplate {
    pub object_identifier: ObjectIdentifier,
    pub data_objects: Vec<Tlv>,
}
impl DiscretionaryDataTemplate {
    pub fn new(object_identifier: &Oid, data_objects: Vec<Tlv>) -> Result<Self, DecodeError> {
        // round-trip through the encoding to obtain an owned identifier
        let oid_tlv = Tlv::primitive(tags::OBJECT_IDENTIFIER, oid_to_der_bytes(object_identifier));
        Ok(Self {
            object_identifier: oid_tlv.to_oid()?,
            data_objects,
        })
    }

    pub fn decode(tlv: &Tlv) -> Result<Self, DecodeError> {
        if tlv.tag() != DISCRETIONARY_DATA_TEMPLATE {
            return Err(DecodeError::UnexpectedTag { expected: DISCRETIONARY_DATA_TEMPLATE, found: tlv.tag() });
        }
        let mut parser = tlv.parser();
        let object_identifier = parser.expect(tags::OBJECT_IDENTIFIER)?.to_oid()?;
        let data_objects = parser.remaining().to_vec();
        Ok(Self {
            object_identifier,
            data_objects,
        })
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut children = Vec::with_capacity(1 + self.data_objects.len());
        children.push(Tlv::primitive(tags::OBJECT_IDENTIFIER, oid_to_der_bytes(&self.object_identifier)));
        children.extend(self.data_objects.iter().cloned());
        Tlv::constructed(DISCRETIONARY_DATA_TEMPLATE, children)
    }

    pub fn is(&self, oid: &Oid) -> bool {
        &*self.object_identifier == oid
    }

    /// The value of the first primitive data object with the given tag.
    pub fn data_object(&self, tag: Tag) -> Option<&[u8]> {
        self.data_objects.iter()
            .find(|tlv| tlv.tag() == tag)
            .and_then(|tlv| tlv.primitive_value())
    }
}
