//! Cryptographic functionality.


pub mod cipher_mac;
pub mod dh;
pub mod ecdsa;
pub mod elliptic;


use std::fmt;

use num_bigint::BigUint;
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypt::dh::DiffieHellmanParams;
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};
use crate::crypt::elliptic::curves;
use crate::error::ErrorKind;
use crate::security_info::DomainParameters;


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    InvalidKeyLength,
    InvalidDataLength { block_size: usize, obtained: usize },
    InvalidPublicKey,
    PointAtInfinity,
    InvalidSignature,
    InvalidDomainParameters(&'static str),
    UnsupportedStandardizedParameters(u64),
    UnsupportedDomainParameters,
}
impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKeyLength => ErrorKind::Decode,
            Self::InvalidDataLength { .. } => ErrorKind::Decode,
            Self::InvalidPublicKey => ErrorKind::SecurityViolation,
            Self::PointAtInfinity => ErrorKind::SecurityViolation,
            Self::InvalidSignature => ErrorKind::SecurityViolation,
            Self::InvalidDomainParameters(_) => ErrorKind::Decode,
            Self::UnsupportedStandardizedParameters(_) => ErrorKind::Decode,
            Self::UnsupportedDomainParameters => ErrorKind::Decode,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyLength
                => write!(f, "invalid key length"),
            Self::InvalidDataLength { block_size, obtained }
                => write!(f, "data length {} is not a multiple of the block size {}", obtained, block_size),
            Self::InvalidPublicKey
                => write!(f, "invalid public key"),
            Self::PointAtInfinity
                => write!(f, "computation resulted in the point at infinity"),
            Self::InvalidSignature
                => write!(f, "invalid signature"),
            Self::InvalidDomainParameters(reason)
                => write!(f, "invalid domain parameters: {}", reason),
            Self::UnsupportedStandardizedParameters(id)
                => write!(f, "standardized domain parameters {} are not supported", id),
            Self::UnsupportedDomainParameters
                => write!(f, "unsupported domain parameters"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidKeyLength => None,
            Self::InvalidDataLength { .. } => None,
            Self::InvalidPublicKey => None,
            Self::PointAtInfinity => None,
            Self::InvalidSignature => None,
            Self::InvalidDomainParameters(_) => None,
            Self::UnsupportedStandardizedParameters(_) => None,
            Self::UnsupportedDomainParameters => None,
        }
    }
}


/// A key exchange method.
///
/// Private keys are unsigned integers serialized in big-endian byte order.
///
/// The representation of public and secret keys differs according to the key exchange method.
///
/// For classic Diffie-Hellman, public and secret keys are represented as unsigned integers in
/// big-endian byte order, padded to the length of the prime.
///
/// For elliptic-curve Diffie-Hellman, public keys are represented as affine coordinates of a point
/// on the curve. They are serialized in the following sequence:
/// 1. the byte `0x04` to signify uncompressed coordinates
/// 2. the x coordinate as an unsigned integer in big-endian byte order
/// 3. the y coordinate as an unsigned integer in big-endian byte order
/// Both coordinates are padded to the length of the prime. Shared secrets are the x coordinate
/// alone.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyExchange {
    DiffieHellman(DiffieHellmanParams),
    PrimeWeierstrassEllipticDiffieHellman(PrimeWeierstrassCurve),
}
impl KeyExchange {
    /// Obtains the standardized domain parameters with the given identifier (TR-03110 Part 3
    /// Table 4).
    pub fn from_standardized(parameter_id: u64) -> Result<Self, Error> {
        let curve = match parameter_id {
            0 => return Ok(Self::DiffieHellman(dh::get_1024_bit_160_bit_subgroup())),
            8 => curves::get_nist_p192(),
            9 => curves::get_brainpool_p192r1(),
            10 => curves::get_nist_p224(),
            11 => curves::get_brainpool_p224r1(),
            12 => curves::get_nist_p256(),
            13 => curves::get_brainpool_p256r1(),
            14 => curves::get_brainpool_p320r1(),
            15 => curves::get_nist_p384(),
            16 => curves::get_brainpool_p384r1(),
            17 => curves::get_brainpool_p512r1(),
            18 => curves::get_nist_p521(),
            other => return Err(Error::UnsupportedStandardizedParameters(other)),
        };
        Ok(Self::PrimeWeierstrassEllipticDiffieHellman(curve))
    }

    pub fn from_domain_parameters(parameters: &DomainParameters) -> Result<Self, Error> {
        match parameters {
            DomainParameters::Standardized(parameter_id)
                => Self::from_standardized(*parameter_id),
            DomainParameters::EllipticCurve(ec)
                => Ok(Self::PrimeWeierstrassEllipticDiffieHellman(PrimeWeierstrassCurve::from_explicit(ec)?)),
            DomainParameters::DiffieHellman(dh)
                => Ok(Self::DiffieHellman(DiffieHellmanParams::from_explicit(dh)?)),
            DomainParameters::Other(_)
                => Err(Error::UnsupportedDomainParameters),
        }
    }

    pub fn is_elliptic(&self) -> bool {
        matches!(self, Self::PrimeWeierstrassEllipticDiffieHellman(_))
    }

    /// Returns the recommended number of bytes for a private key using this key exchange method.
    pub fn private_key_len_bytes(&self) -> usize {
        match self {
            Self::DiffieHellman(dhp) => dhp.subgroup_size_bytes(),
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => curve.order_len_bytes(),
        }
    }

    /// Generates a random private key.
    pub fn generate_private_key(&self) -> Zeroizing<Vec<u8>> {
        match self {
            Self::DiffieHellman(dhp) => random_scalar(dhp.order()),
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => random_scalar(curve.order()),
        }
    }

    /// Calculates a public key for the given private key, returning it serialized to bytes.
    pub fn calculate_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, Error> {
        let private_key_int = BigUint::from_bytes_be(private_key);
        match self {
            Self::DiffieHellman(dhp) => {
                let public_key_int = dhp.calculate_public_key(&private_key_int);
                Ok(to_fixed_be_bytes(&public_key_int, dhp.prime_len_bytes()))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let public_key_point = curve.calculate_public_key(&private_key_int)?;
                Ok(public_key_point.to_be_bytes(curve.prime_len_bytes()))
            },
        }
    }

    /// Checks that the other party's public key is a valid element of the group.
    pub fn validate_public_key(&self, public_key: &[u8]) -> Result<(), Error> {
        match self {
            Self::DiffieHellman(dhp) => {
                dhp.validate_public_key(&BigUint::from_bytes_be(public_key))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let point = AffinePoint::try_from_be_bytes(public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                if curve.is_on_curve_affine(&point) {
                    Ok(())
                } else {
                    Err(Error::InvalidPublicKey)
                }
            },
        }
    }

    /// Performs the key exchange using the given private key and the other party's public key,
    /// generating a shared secret.
    pub fn exchange_keys(&self, private_key: &[u8], other_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let private_key_int = BigUint::from_bytes_be(private_key);
        match self {
            Self::DiffieHellman(dhp) => {
                let other_public_key_int = BigUint::from_bytes_be(other_public_key);
                let shared_secret = dhp.diffie_hellman(&private_key_int, &other_public_key_int)?;
                Ok(Zeroizing::new(to_fixed_be_bytes(&shared_secret, dhp.prime_len_bytes())))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other_public_key_point = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                let shared_secret_point = curve.diffie_hellman(&private_key_int, &other_public_key_point)?;
                Ok(Zeroizing::new(to_fixed_be_bytes(shared_secret_point.x(), curve.prime_len_bytes())))
            },
        }
    }

    /// Derives a new key exchange method using generic mapping.
    ///
    /// The generic mapping process keeps the same parameters but derives a new generator using a
    /// given nonce and a shared secret derived from the given private key and the other party's
    /// public key using the current key exchange method.
    ///
    /// Since the derivation requires both coordinates of the secret key with elliptic-curve
    /// Diffie-Hellman, the key exchange step is integrated into this function, as
    /// [`Self::exchange_keys`] only returns the x coordinate.
    pub fn derive_generic_mapping(&self, nonce: &[u8], private_key: &[u8], other_public_key: &[u8]) -> Result<Self, Error> {
        let nonce_int = BigUint::from_bytes_be(nonce);
        let private_key_int = BigUint::from_bytes_be(private_key);
        match self {
            Self::DiffieHellman(dhp) => {
                let other_public_key_int = BigUint::from_bytes_be(other_public_key);
                let shared_secret = dhp.diffie_hellman(&private_key_int, &other_public_key_int)?;
                Ok(Self::DiffieHellman(dhp.derive_generic_mapping(&nonce_int, &shared_secret)?))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other_public_key_point = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                let shared_secret_point = curve.diffie_hellman(&private_key_int, &other_public_key_point)?;
                let session_curve = curve.derive_generic_mapping_session_curve(&nonce_int, &shared_secret_point)?;
                debug!("mapped generator computed");
                Ok(Self::PrimeWeierstrassEllipticDiffieHellman(session_curve))
            },
        }
    }

    /// The compressed representation of a public key.
    ///
    /// For elliptic curves, this is the x coordinate; for classic Diffie-Hellman, the SHA-1 digest
    /// of the encoded public key.
    pub fn compress_public_key(&self, public_key: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Self::DiffieHellman(_) => {
                Ok(Sha1::digest(public_key).to_vec())
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let point = AffinePoint::try_from_be_bytes(public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                Ok(to_fixed_be_bytes(point.x(), curve.prime_len_bytes()))
            },
        }
    }

    /// The ASN.1 tag representing this type of public key.
    pub fn public_key_tag(&self) -> u8 {
        match self {
            Self::DiffieHellman(_) => 0x84, // Diffie-Hellman public key
            Self::PrimeWeierstrassEllipticDiffieHellman(_) => 0x86, // elliptic curve point
        }
    }
}


/// Encodes an unsigned integer in big-endian byte order, left-padded with zeroes to `length` bytes.
///
/// Values that do not fit are returned in their shortest encoding.
pub fn to_fixed_be_bytes(value: &BigUint, length: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= length {
        return bytes;
    }
    let mut ret = vec![0u8; length - bytes.len()];
    ret.extend(&bytes);
    ret
}

/// The number of bytes needed to encode `value`.
pub fn byte_length(value: &BigUint) -> usize {
    let bits = value.bits();
    usize::try_from((bits + 7) / 8).unwrap_or(usize::MAX)
}


/// Generates a uniformly distributed integer in `[1, order - 1]`, encoded with the length of the
/// order.
fn random_scalar(order: &BigUint) -> Zeroizing<Vec<u8>> {
    let order_len = byte_length(order);

    // 64 extra bits make the modulo bias negligible
    let mut random_bytes = Zeroizing::new(vec![0u8; order_len + 8]);
    OsRng.fill_bytes(random_bytes.as_mut_slice());
    let random_int = BigUint::from_bytes_be(&random_bytes);

    let one = BigUint::from(1u8);
    let order_minus_one = if order > &one { order - &one } else { one.clone() };
    let scalar = (&random_int % &order_minus_one) + &one;
    Zeroizing::new(to_fixed_be_bytes(&scalar, order_len))
}
