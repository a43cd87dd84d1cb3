//! Extended Access Control for electronic identity cards (BSI TR-03110): PACE with Generic
//! Mapping, AES Secure Messaging, Terminal Authentication and Chip Authentication.


pub mod crypt;
pub mod cvc;
pub mod der_util;
pub mod eac;
pub mod error;
pub mod iso7816;
pub mod oids;
pub mod pace;
pub mod secure_messaging;
pub mod security_info;
pub mod tlv;


use std::fmt::Write;


/// Renders `buf` as a classic hex dump: offset, 16 bytes in hex, and their printable characters.
pub fn hexdump(buf: &[u8]) -> String {
    let mut ret = String::new();
    for (row, chunk) in buf.chunks(16).enumerate() {
        let _ = write!(ret, "{:08X}  ", row * 16);

        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => { let _ = write!(ret, " {:02X}", b); },
                None => ret.push_str("   "),
            }
        }

        ret.push_str(" |");
        for &b in chunk {
            if b >= b' ' && b <= b'~' {
                ret.push(char::from(b));
            } else {
                ret.push('.');
            }
        }
        ret.push_str("|\n");
    }
    ret
}
