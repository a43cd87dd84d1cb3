//! Utility functions for Distinguished Encoding Rules.


use rasn::types::{ObjectIdentifier, Oid};


/// Encode an ASN.1 DER value length.
///
/// Lengths below 128 are encoded in a single byte; longer lengths use the long form with as few
/// length bytes as possible.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional bytes that actually specify the length
        // (big-endian)
        let length_bytes = length.to_be_bytes();
        let first_significant = length_bytes.iter()
            .position(|b| *b != 0x00)
            .unwrap_or(length_bytes.len() - 1);
        let trimmed_length_slice = &length_bytes[first_significant..];
        output.push(0b1000_0000 | (trimmed_length_slice.len() as u8));
        output.extend(trimmed_length_slice);
    }
}


/// Decode an ASN.1 DER value length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input slice once the length has
/// been removed. Indefinite lengths and lengths that do not fit into `usize` are rejected.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&start_byte, rest) = input.split_first()?;
    let start_lower_bits = start_byte & 0b0111_1111;
    if start_byte & 0b1000_0000 == 0 {
        return Some((start_lower_bits.into(), rest));
    }

    // multiple bytes
    let length_byte_count: usize = start_lower_bits.into();
    if length_byte_count == 0 || length_byte_count > rest.len() {
        return None;
    }
    let mut length: usize = 0;
    for length_byte in &rest[..length_byte_count] {
        length = length.checked_mul(256)?
            .checked_add(usize::from(*length_byte))?;
    }
    Some((length, &rest[length_byte_count..]))
}


/// Encode an object identifier value into bytes using DER encoding rules.
///
/// No tag or length is encoded, only the actual value.
pub fn oid_to_der_bytes(oid: &Oid) -> Vec<u8> {
    fn encode_arc(ret: &mut Vec<u8>, arc: u32) {
        // base-128, most significant group first, continuation bit on all but the last group
        let mut groups = [0u8; 5];
        let mut count = 0;
        let mut rest = arc;
        loop {
            groups[count] = (rest & 0b0111_1111) as u8;
            count += 1;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        for i in (0..count).rev() {
            let continuation = if i > 0 { 0b1000_0000 } else { 0b0000_0000 };
            ret.push(groups[i] | continuation);
        }
    }

    assert!(oid.len() >= 2);
    assert!(oid[0] <= 2);

    let mut ret = Vec::new();
    encode_arc(&mut ret, 40*oid[0] + oid[1]);
    for arc in oid.iter().skip(2) {
        encode_arc(&mut ret, *arc);
    }
    ret
}


/// Decode the DER value bytes of an object identifier.
///
/// Returns `None` if the encoding is truncated, not minimal or an arc overflows 32 bits.
pub fn oid_from_der_bytes(bytes: &[u8]) -> Option<ObjectIdentifier> {
    let mut arcs: Vec<u32> = Vec::new();
    let mut current: u32 = 0;
    let mut in_arc = false;
    for &b in bytes {
        if !in_arc && b == 0b1000_0000 {
            // leading zero group
            return None;
        }
        current = current.checked_mul(128)?
            | u32::from(b & 0b0111_1111);
        if b & 0b1000_0000 != 0 {
            in_arc = true;
            continue;
        }

        if arcs.is_empty() {
            // the first encoded arc packs the first two arcs
            let (first, second) = match current {
                0..=39 => (0, current),
                40..=79 => (1, current - 40),
                _ => (2, current - 80),
            };
            arcs.push(first);
            arcs.push(second);
        } else {
            arcs.push(current);
        }
        current = 0;
        in_arc = false;
    }
    if in_arc || arcs.is_empty() {
        return None;
    }
    ObjectIdentifier::new(arcs)
}


/// Renders an object identifier in dotted-decimal notation.
pub fn oid_to_dotted(oid: &Oid) -> String {
    let arcs: Vec<String> = oid.iter()
        .map(|arc| arc.to_string())
        .collect();
    arcs.join(".")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::oids;
    use hex_literal::hex;

    #[test]
    fn length_forms() {
        let mut out = Vec::new();
        encode_primitive_length(&mut out, 0x7F);
        encode_primitive_length(&mut out, 0x80);
        encode_primitive_length(&mut out, 0x0102);
        assert_eq!(out, hex!("7F 81 80 82 01 02"));

        assert_eq!(try_decode_primitive_length(&hex!("82 01 02 FF")), Some((0x0102, &[0xFF][..])));
        assert_eq!(try_decode_primitive_length(&hex!("80")), None);
        assert_eq!(try_decode_primitive_length(&hex!("83 01 02")), None);
        assert_eq!(try_decode_primitive_length(&[]), None);
    }

    #[test]
    fn pace_oid_bytes() {
        let bytes = oid_to_der_bytes(oids::PACE_ECDH_GM_AES_CBC_CMAC_128);
        assert_eq!(bytes, hex!("04 00 7F 00 07 02 02 04 02 02"));

        let decoded = oid_from_der_bytes(&bytes).unwrap();
        assert_eq!(&*decoded, oids::PACE_ECDH_GM_AES_CBC_CMAC_128);
        assert_eq!(oid_to_dotted(&decoded), "0.4.0.127.0.7.2.2.4.2.2");
    }

    #[test]
    fn multi_byte_arcs() {
        // 1.2.840.10045.2.1 (ecPublicKey)
        let decoded = oid_from_der_bytes(&hex!("2A 86 48 CE 3D 02 01")).unwrap();
        assert_eq!(oid_to_dotted(&decoded), "1.2.840.10045.2.1");
        assert_eq!(oid_to_der_bytes(&decoded), hex!("2A 86 48 CE 3D 02 01"));

        assert!(oid_from_der_bytes(&hex!("2A 86")).is_none());
        assert!(oid_from_der_bytes(&hex!("2A 80 01")).is_none());
    }
}
