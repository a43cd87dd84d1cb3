//! ECDSA signature verification for Terminal Authentication and card verifiable certificates.
//!
//! Signatures use the plain format of BSI TR-03111: `r || s`, both padded to the length of the
//! group order.


use num_bigint::BigUint;
use num_traits::{One, Zero};
use rasn::types::Oid;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::crypt::{byte_length, Error};
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};
use crate::oids;


/// The hash function used with ECDSA.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}
impl HashAlgorithm {
    /// Obtains the hash algorithm of an `id-TA-ECDSA-*` protocol identifier.
    pub fn from_ta_protocol(protocol: &Oid) -> Option<Self> {
        if protocol == oids::TA_ECDSA_SHA_1 {
            Some(Self::Sha1)
        } else if protocol == oids::TA_ECDSA_SHA_224 {
            Some(Self::Sha224)
        } else if protocol == oids::TA_ECDSA_SHA_256 {
            Some(Self::Sha256)
        } else if protocol == oids::TA_ECDSA_SHA_384 {
            Some(Self::Sha384)
        } else if protocol == oids::TA_ECDSA_SHA_512 {
            Some(Self::Sha512)
        } else {
            None
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha224 => Sha224::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}


/// Converts a digest into an integer, keeping only as many leftmost bits as the order has.
fn digest_to_integer(digest: &[u8], order: &BigUint) -> BigUint {
    let value = BigUint::from_bytes_be(digest);
    let digest_bits = u64::try_from(digest.len() * 8).unwrap_or(u64::MAX);
    let order_bits = order.bits();
    if digest_bits > order_bits {
        value >> (digest_bits - order_bits)
    } else {
        value
    }
}


/// Verifies a plain ECDSA signature over an already computed digest.
pub fn verify_digest(
    curve: &PrimeWeierstrassCurve,
    public_key: &AffinePoint,
    digest: &[u8],
    signature: &[u8],
) -> Result<(), Error> {
    let order = curve.order();
    let scalar_length = byte_length(order);
    if signature.len() != 2 * scalar_length {
        return Err(Error::InvalidSignature);
    }
    if !curve.is_on_curve_affine(public_key) {
        return Err(Error::InvalidPublicKey);
    }

    let r = BigUint::from_bytes_be(&signature[..scalar_length]);
    let s = BigUint::from_bytes_be(&signature[scalar_length..]);
    if r.is_zero() || s.is_zero() || &r >= order || &s >= order {
        return Err(Error::InvalidSignature);
    }

    let e = digest_to_integer(digest, order);

    // order is prime: s ** (order - 2) is the inverse of s
    let s_inverse = s.modpow(&(order - BigUint::from(2u8)), order);
    debug_assert!(((&s * &s_inverse) % order).is_one());

    let u1 = (&e * &s_inverse) % order;
    let u2 = (&r * &s_inverse) % order;
    let point = curve.linear_combination(&u1, &u2, public_key)
        .ok_or(Error::InvalidSignature)?;

    if point.x() % order == r {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

/// Hashes `message` and verifies the plain ECDSA signature over it.
pub fn verify(
    curve: &PrimeWeierstrassCurve,
    public_key: &AffinePoint,
    hash: HashAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> Result<(), Error> {
    verify_digest(curve, public_key, &hash.digest(message), signature)
}


#[cfg(test)]
mod tests {
    use super::{verify, HashAlgorithm};
    use crate::crypt::Error;
    use crate::crypt::elliptic::AffinePoint;
    use crate::crypt::elliptic::curves;
    use crate::oids;
    use hex_literal::hex;
    use num_bigint::BigUint;

    const MESSAGE: &[u8] = b"terminal authentication test message";

    fn brainpool_key() -> AffinePoint {
        AffinePoint::new(
            BigUint::from_bytes_be(&hex!("643380ebc58aa82c84db8a714a47f65cf52a3f7fdee5cd6ab291ac2637b15715")),
            BigUint::from_bytes_be(&hex!("6f7011e66112e0d06985579afb763ad8d89fdda4c7f2f19fbb4cbe18eb036802")),
        )
    }

    fn brainpool_signature() -> Vec<u8> {
        let mut signature = hex!("9b3e137724a1f43b6b8837c118894081258a8c3afcf3ccd2298c4fc59b77446e").to_vec();
        signature.extend(hex!("21a9da07235794cdeafb9a8335c84826db83b6997f726b979c0e7b117bf5c2ac"));
        signature
    }

    #[test]
    fn brainpool_p256r1_sha256() {
        let curve = curves::get_brainpool_p256r1();
        verify(&curve, &brainpool_key(), HashAlgorithm::Sha256, MESSAGE, &brainpool_signature()).unwrap();
    }

    #[test]
    fn nist_p384_sha384() {
        let curve = curves::get_nist_p384();
        let key = AffinePoint::new(
            BigUint::from_bytes_be(&hex!("c787d37c05c2c199a12c7e85baa2354aaad83260c08a156dce611b3cdfce17076f28fc663c8a5f74b82e910595e2d6b5")),
            BigUint::from_bytes_be(&hex!("c8cc2cd81f71dc13134d55f1ae20a8d70ee52add3b9ab0387e96efb2ccfae6da6b81128990b1a142c2bfc26119801766")),
        );
        let mut signature = hex!("966d20c05d58bb0f58e0429f034bcf7f24991ceccf52a91d0d2ea36e0de9dab2a773749c27694f24fac12438e040ef20").to_vec();
        signature.extend(hex!("58f38c9c8f24bc171a3561d27dbd0761a1198cee8083f0f627e6d957af93148f1f3439b2bb4a50cd0ce1318bd4c20516"));
        verify(&curve, &key, HashAlgorithm::Sha384, MESSAGE, &signature).unwrap();
    }

    #[test]
    fn tampering_is_detected() {
        let curve = curves::get_brainpool_p256r1();
        let key = brainpool_key();

        assert_eq!(
            verify(&curve, &key, HashAlgorithm::Sha256, b"terminal authentication test messagE", &brainpool_signature()),
            Err(Error::InvalidSignature),
        );
        assert_eq!(
            verify(&curve, &key, HashAlgorithm::Sha224, MESSAGE, &brainpool_signature()),
            Err(Error::InvalidSignature),
        );

        let mut flipped = brainpool_signature();
        flipped[40] ^= 0x80;
        assert_eq!(verify(&curve, &key, HashAlgorithm::Sha256, MESSAGE, &flipped), Err(Error::InvalidSignature));

        let truncated = &brainpool_signature()[..63];
        assert_eq!(verify(&curve, &key, HashAlgorithm::Sha256, MESSAGE, truncated), Err(Error::InvalidSignature));

        assert_eq!(verify(&curve, &key, HashAlgorithm::Sha256, MESSAGE, &[0u8; 64]), Err(Error::InvalidSignature));
    }

    #[test]
    fn hash_from_protocol() {
        assert_eq!(HashAlgorithm::from_ta_protocol(oids::TA_ECDSA_SHA_256), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_ta_protocol(oids::TA_ECDSA_SHA_512), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::from_ta_protocol(oids::TA_RSA), None);
    }
}
