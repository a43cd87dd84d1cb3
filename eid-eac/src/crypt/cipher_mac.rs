//! Cipher and MAC (message authentication code) combinations.


use aes::{Aes128, Aes192, Aes256};
use block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use cmac::Cmac;
use rasn::types::Oid;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::Error;


/// The block size of AES in bytes, independent of the key size.
const AES_BLOCK_SIZE: usize = 16;

/// The MAC is truncated to this many bytes.
pub const MAC_LENGTH: usize = 8;


/// A combination of cipher, MAC and KDF (key derivation function) usable during authentication and
/// Secure Messaging.
pub trait CipherAndMac {
    /// Size of the cipher key in bytes.
    fn cipher_key_size(&self) -> usize;

    /// Block size of the cipher in bytes.
    fn cipher_block_size(&self) -> usize;

    /// The key derivation function.
    fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>>;

    /// The key derivation function for encryption purposes.
    fn derive_encryption_key(&self, key_seed: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(key_seed, 1)
    }

    /// The key derivation function for message authentication purposes.
    fn derive_mac_key(&self, key_seed: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(key_seed, 2)
    }

    /// The password-to-key derivation function.
    fn derive_key_from_password(&self, password: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(password, 3)
    }

    /// Decrypts data in-place using the given key and CBC IV.
    ///
    /// Does not strip padding.
    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Encrypts pre-padded data in-place using the given key and CBC IV.
    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Encrypts a single block in-place without chaining.
    fn encrypt_block(&self, block: &mut [u8], key: &[u8]) -> Result<(), Error>;

    /// Generates a MAC (message authentication code) for the given data and key.
    fn mac(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>, Error>;

    /// Verifies whether the given data fits the given MAC (message authentication code).
    fn verify_mac(&self, data: &[u8], key: &[u8], expected_mac: &[u8]) -> Result<bool, Error> {
        let computed_mac = self.mac(data, key)?;
        Ok(computed_mac.ct_eq(expected_mac).into())
    }
}


fn check_data_length(data: &[u8]) -> Result<(), Error> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::InvalidDataLength { block_size: AES_BLOCK_SIZE, obtained: data.len() });
    }
    Ok(())
}


macro_rules! aes_cipher_and_mac {
    ($(#[$attr:meta])* $name:ident, $aes:ty, $key_size:expr, $hash:ty) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name;
        impl CipherAndMac for $name {
            fn cipher_key_size(&self) -> usize { $key_size }
            fn cipher_block_size(&self) -> usize { AES_BLOCK_SIZE }

            fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>> {
                let mut hasher = <$hash>::new();
                hasher.update(key_seed);
                hasher.update(&counter.to_be_bytes());
                let result = Zeroizing::new(hasher.finalize().to_vec());

                Zeroizing::new(result[0..$key_size].to_vec())
            }

            fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
                check_data_length(data)?;
                let decryptor = cbc::Decryptor::<$aes>::new_from_slices(key, iv)
                    .map_err(|_| Error::InvalidKeyLength)?;
                let length = data.len();
                decryptor.decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|_| Error::InvalidDataLength { block_size: AES_BLOCK_SIZE, obtained: length })?;
                Ok(())
            }

            fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
                check_data_length(data)?;
                let length = data.len();
                let encryptor = cbc::Encryptor::<$aes>::new_from_slices(key, iv)
                    .map_err(|_| Error::InvalidKeyLength)?;
                encryptor.encrypt_padded_mut::<NoPadding>(data, length)
                    .map_err(|_| Error::InvalidDataLength { block_size: AES_BLOCK_SIZE, obtained: length })?;
                Ok(())
            }

            fn encrypt_block(&self, block: &mut [u8], key: &[u8]) -> Result<(), Error> {
                if block.len() != AES_BLOCK_SIZE {
                    return Err(Error::InvalidDataLength { block_size: AES_BLOCK_SIZE, obtained: block.len() });
                }
                let cipher = <$aes as KeyInit>::new_from_slice(key)
                    .map_err(|_| Error::InvalidKeyLength)?;
                cipher.encrypt_block(aes::Block::from_mut_slice(block));
                Ok(())
            }

            fn mac(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>, Error> {
                let mut mac = <Cmac<$aes> as digest::Mac>::new_from_slice(key)
                    .map_err(|_| Error::InvalidKeyLength)?;
                digest::Mac::update(&mut mac, data);
                let full_mac = digest::Mac::finalize(mac).into_bytes();
                Ok(full_mac[0..MAC_LENGTH].to_vec())
            }
        }
    };
}


aes_cipher_and_mac!(
    /// AES-128-based cipher and MAC.
    ///
    /// The block mode of operation is Cipher Block Chaining (CBC).
    ///
    /// The KDF is equivalent to:
    /// ```plain
    /// keydata = sha1(key || counter)[0..16]
    /// ```
    ///
    /// The MAC is CMAC with AES-128 truncated to the initial 8 bytes.
    CamAes128, Aes128, 16, Sha1
);

aes_cipher_and_mac!(
    /// AES-192-based cipher and MAC.
    ///
    /// The KDF is equivalent to:
    /// ```plain
    /// keydata = sha256(key || counter)[0..24]
    /// ```
    CamAes192, Aes192, 24, Sha256
);

aes_cipher_and_mac!(
    /// AES-256-based cipher and MAC.
    ///
    /// The KDF is equivalent to:
    /// ```plain
    /// keydata = sha256(key || counter)
    /// ```
    CamAes256, Aes256, 32, Sha256
);


/// Picks the cipher and MAC combination from the last arc of a PACE or Chip Authentication
/// protocol identifier.
///
/// Only the AES variants are supported; 3DES protocols (last arc 1) yield `None`.
pub fn cipher_and_mac_for(protocol: &Oid) -> Option<Box<dyn CipherAndMac>> {
    match protocol.last().copied() {
        Some(2) => Some(Box::new(CamAes128)),
        Some(3) => Some(Box::new(CamAes192)),
        Some(4) => Some(Box::new(CamAes256)),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::{cipher_and_mac_for, CipherAndMac, CamAes128, CamAes192, CamAes256};
    use crate::crypt::Error;
    use crate::oids;
    use hex_literal::hex;
    use sha1::{Digest, Sha1};

    #[test]
    fn password_key_from_mrz() {
        // PACE with the MRZ as password: the key seed is SHA-1 of document number, date of birth
        // and date of expiry including their check digits
        let key_seed = Sha1::digest(b"T22000129364081251010318");
        let k_pi = CamAes128.derive_key_from_password(&key_seed);
        assert_eq!(k_pi.as_slice(), &hex!("89DED1B2 6624EC1E 634C1989 302849DD"));
    }

    #[test]
    fn session_keys() {
        let shared_secret = hex!("
            28768D20 701247DA E81804C9 E780EDE5
            82A9996D B4A31502 0B273319 7DB84925
        ");
        assert_eq!(
            CamAes128.derive_encryption_key(&shared_secret).as_slice(),
            &hex!("F5F0E35C 0D7161EE 6724EE51 3A0D9A7F"),
        );
        assert_eq!(
            CamAes128.derive_mac_key(&shared_secret).as_slice(),
            &hex!("FE251C78 58B356B2 4514B3BD 5F4297D1"),
        );
        assert_eq!(CamAes192.derive_encryption_key(&shared_secret).len(), 24);
        assert_eq!(CamAes256.derive_encryption_key(&shared_secret).len(), 32);
    }

    #[test]
    fn rfc4493_cmac_truncated() {
        let key = hex!("2b7e1516 28aed2a6 abf71588 09cf4f3c");
        assert_eq!(CamAes128.mac(&[], &key).unwrap(), hex!("bb1d6929 e9593728"));

        let message = hex!("6bc1bee2 2e409f96 e93d7e11 7393172a");
        assert_eq!(CamAes128.mac(&message, &key).unwrap(), hex!("070a16b4 6b4d4144"));
        assert!(CamAes128.verify_mac(&message, &key, &hex!("070a16b4 6b4d4144")).unwrap());
        assert!(!CamAes128.verify_mac(&message, &key, &hex!("070a16b4 6b4d4145")).unwrap());
    }

    #[test]
    fn single_block_and_cbc() {
        let key = hex!("2b7e1516 28aed2a6 abf71588 09cf4f3c");
        let mut block = [0u8; 16];
        CamAes128.encrypt_block(&mut block, &key).unwrap();
        assert_eq!(block, hex!("7df76b0c 1ab899b3 3e42f047 b91b546f"));

        // with a zero IV, CBC of a single block is the block cipher itself
        let mut data = [0u8; 32];
        CamAes128.encrypt_padded_data(&mut data, &key, &[0u8; 16]).unwrap();
        assert_eq!(data[0..16], block);
        CamAes128.decrypt_padded_data(&mut data, &key, &[0u8; 16]).unwrap();
        assert_eq!(data, [0u8; 32]);
    }

    #[test]
    fn misaligned_input() {
        let key = [0u8; 16];
        let mut data = [0u8; 15];
        assert_eq!(
            CamAes128.encrypt_padded_data(&mut data, &key, &[0u8; 16]),
            Err(Error::InvalidDataLength { block_size: 16, obtained: 15 }),
        );
        assert_eq!(CamAes128.encrypt_block(&mut data, &key), Err(Error::InvalidDataLength { block_size: 16, obtained: 15 }));
        assert_eq!(CamAes256.mac(b"x", &key), Err(Error::InvalidKeyLength));
    }

    #[test]
    fn selection_by_protocol() {
        let aes128 = cipher_and_mac_for(oids::PACE_ECDH_GM_AES_CBC_CMAC_128).unwrap();
        assert_eq!(aes128.cipher_key_size(), 16);
        let aes256 = cipher_and_mac_for(oids::PACE_ECDH_GM_AES_CBC_CMAC_256).unwrap();
        assert_eq!(aes256.cipher_key_size(), 32);
        assert_eq!(aes256.cipher_block_size(), 16);
        assert!(cipher_and_mac_for(oids::CA_ECDH_3DES_CBC_CBC).is_none());
    }
}
