//! Discovery and verification of certificate chains.
//!
//! The terminal hands over an unordered set of certificates. Starting from the trust anchor the
//! card names (its CVCA reference), the chain is found by following the certificate references:
//! each certificate's Certification Authority Reference is the Certificate Holder Reference of its
//! predecessor.


use std::fmt;

use tracing::debug;

use crate::crypt;
use crate::crypt::elliptic::PrimeWeierstrassCurve;
use crate::cvc::certificate::{CvCertificate, PublicKeyParameters, PublicKeyReference};
use crate::cvc::chat::{Role, TerminalType};
use crate::error::ErrorKind;
use crate::security_info::EcParameters;
use crate::tlv::DecodeError;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    Decoding(DecodeError),
    DuplicateHolder { holder: PublicKeyReference },
    EmptyChain,
    BrokenLink { authority: PublicKeyReference, holder: PublicKeyReference },
    MissingDomainParameters { holder: PublicKeyReference },
    UnsupportedPublicKey { holder: PublicKeyReference },
    InvalidSignature { holder: PublicKeyReference, error: crypt::Error },
    MissingTerminalCertificate,
    TerminalTypeMismatch { authorized: TerminalType, required: TerminalType },
    RightsExceeded,
    MissingDescriptionHash,
    DescriptionHashMismatch,
}
impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Decoding(_) => ErrorKind::Decode,
            _ => ErrorKind::Chain,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoding(e)
                => write!(f, "failed to decode certificate: {}", e),
            Self::DuplicateHolder { holder }
                => write!(f, "a different certificate for holder {} is already known", holder),
            Self::EmptyChain
                => write!(f, "no certificate chain leads from the trust anchor"),
            Self::BrokenLink { authority, holder }
                => write!(f, "certificate {} is not issued by {}", holder, authority),
            Self::MissingDomainParameters { holder }
                => write!(f, "no domain parameters available for the key of {}", holder),
            Self::UnsupportedPublicKey { holder }
                => write!(f, "the public key of {} uses an unsupported algorithm", holder),
            Self::InvalidSignature { holder, error }
                => write!(f, "signature of {} is invalid: {}", holder, error),
            Self::MissingTerminalCertificate
                => write!(f, "the chain does not end in a terminal certificate"),
            Self::TerminalTypeMismatch { authorized, required }
                => write!(f, "rights for a {} were requested from a {} certificate", required, authorized),
            Self::RightsExceeded
                => write!(f, "requested access rights exceed those of the terminal certificate"),
            Self::MissingDescriptionHash
                => write!(f, "terminal certificate does not attest a certificate description"),
            Self::DescriptionHashMismatch
                => write!(f, "certificate description does not match the terminal certificate"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decoding(e) => Some(e),
            Self::DuplicateHolder { .. } => None,
            Self::EmptyChain => None,
            Self::BrokenLink { .. } => None,
            Self::MissingDomainParameters { .. } => None,
            Self::UnsupportedPublicKey { .. } => None,
            Self::InvalidSignature { error, .. } => Some(error),
            Self::MissingTerminalCertificate => None,
            Self::TerminalTypeMismatch { .. } => None,
            Self::RightsExceeded => None,
            Self::MissingDescriptionHash => None,
            Self::DescriptionHashMismatch => None,
        }
    }
}
impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self { Self::Decoding(value) }
}


/// A set of certificates; once discovered, an ordered chain from trust anchor to terminal.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CertificateChain {
    certificates: Vec<CvCertificate>,
}
impl CertificateChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes and collects encoded certificates.
    pub fn decode_all<'b, I: IntoIterator<Item = &'b [u8]>>(encoded: I) -> Result<Self, Error> {
        let certificates = encoded.into_iter()
            .map(CvCertificate::decode)
            .collect::<Result<Vec<_>, _>>()?;
        let mut chain = Self::new();
        chain.add_certificates(certificates)?;
        Ok(chain)
    }

    pub fn certificates(&self) -> &[CvCertificate] { &self.certificates }
    pub fn len(&self) -> usize { self.certificates.len() }
    pub fn is_empty(&self) -> bool { self.certificates.is_empty() }

    /// Merges certificates into the set.
    ///
    /// A certificate that is already known is skipped. A different certificate with the holder
    /// reference of a known one is refused, in which case the set remains unchanged.
    pub fn add_certificates<I: IntoIterator<Item = CvCertificate>>(&mut self, certificates: I) -> Result<(), Error> {
        let mut staged: Vec<CvCertificate> = Vec::new();
        for certificate in certificates {
            let known = self.certificates.iter()
                .chain(staged.iter())
                .find(|c| c.holder_reference() == certificate.holder_reference());
            match known {
                Some(existing) if existing == &certificate => continue,
                Some(_) => return Err(Error::DuplicateHolder { holder: certificate.holder_reference().clone() }),
                None => staged.push(certificate),
            }
        }
        self.certificates.extend(staged);
        Ok(())
    }

    pub fn find_holder(&self, holder: &PublicKeyReference) -> Option<&CvCertificate> {
        self.certificates.iter()
            .find(|c| c.holder_reference() == holder)
    }

    /// Builds the chain starting at the certificate whose holder is `car`.
    ///
    /// Each following certificate is one issued by its predecessor; a path ending in a terminal
    /// certificate is preferred. No certificate is visited twice. The result is empty if no
    /// certificate of the set is held by `car`.
    pub fn chain_from_car(&self, car: &PublicKeyReference) -> CertificateChain {
        let Some(anchor) = self.certificates.iter().position(|c| c.holder_reference() == car) else {
            debug!("no certificate held by {} among {} candidates", car, self.certificates.len());
            return CertificateChain::new();
        };

        let mut path = vec![anchor];
        if !self.extend_to_terminal(&mut path) {
            // no terminal reachable; follow the first successor each time
            while let Some(next) = self.successor(&path) {
                path.push(next);
            }
        }

        CertificateChain {
            certificates: path.into_iter()
                .map(|i| self.certificates[i].clone())
                .collect(),
        }
    }

    fn successors<'s>(&'s self, path: &'s [usize]) -> impl Iterator<Item = usize> + 's {
        let current = path.last()
            .map(|i| self.certificates[*i].holder_reference());
        self.certificates.iter()
            .enumerate()
            .filter(move |(i, c)| !path.contains(i) && Some(c.authority_reference()) == current)
            .map(|(i, _)| i)
    }

    fn successor(&self, path: &[usize]) -> Option<usize> {
        self.successors(path).next()
    }

    fn extend_to_terminal(&self, path: &mut Vec<usize>) -> bool {
        let Some(last) = path.last() else {
            return false;
        };
        if self.certificates[*last].chat().role() == Role::Terminal {
            return true;
        }
        let candidates: Vec<usize> = self.successors(path).collect();
        for candidate in candidates {
            path.push(candidate);
            if self.extend_to_terminal(path) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// The trust anchor, which begins a discovered chain.
    pub fn anchor(&self) -> Option<&CvCertificate> {
        self.certificates.first()
    }

    /// The terminal certificate, which ends a complete chain.
    pub fn terminal_certificate(&self) -> Option<&CvCertificate> {
        self.certificates.last()
            .filter(|c| c.chat().role() == Role::Terminal)
    }

    /// The certificates the card has to verify: all but the anchor, which it already knows.
    pub fn links(&self) -> &[CvCertificate] {
        self.certificates.get(1..).unwrap_or(&[])
    }

    /// Verifies a discovered chain: every certificate must be issued by its predecessor and carry a
    /// valid signature of the predecessor's key. A self-signed anchor is verified against its own
    /// key. Domain parameters missing from a certificate are inherited from its issuer.
    pub fn verify(&self) -> Result<(), Error> {
        let (anchor, rest) = self.certificates.split_first()
            .ok_or(Error::EmptyChain)?;

        let (anchor_parameters, _) = ec_public_key(anchor)?;
        let anchor_parameters = anchor_parameters
            .ok_or_else(|| Error::MissingDomainParameters { holder: anchor.holder_reference().clone() })?;
        let mut issuer_curve = curve(anchor, anchor_parameters)?;
        if anchor.is_self_signed() {
            verify_issued_by(anchor, anchor, &issuer_curve)?;
        }

        let mut issuer = anchor;
        for certificate in rest {
            if certificate.authority_reference() != issuer.holder_reference() {
                return Err(Error::BrokenLink {
                    authority: issuer.holder_reference().clone(),
                    holder: certificate.holder_reference().clone(),
                });
            }
            verify_issued_by(certificate, issuer, &issuer_curve)?;
            debug!("{} verified against {}", certificate.holder_reference(), issuer.holder_reference());

            if let (Some(parameters), _) = ec_public_key(certificate)? {
                issuer_curve = curve(certificate, parameters)?;
            }
            issuer = certificate;
        }
        Ok(())
    }
}
impl FromIterator<CvCertificate> for CertificateChain {
    /// Collects certificates in the given order without checking them.
    fn from_iter<T: IntoIterator<Item = CvCertificate>>(iter: T) -> Self {
        Self { certificates: iter.into_iter().collect() }
    }
}


fn ec_public_key(certificate: &CvCertificate) -> Result<(Option<&EcParameters>, &[u8]), Error> {
    match &certificate.public_key().parameters {
        PublicKeyParameters::Ec { domain_parameters, public_point }
            => Ok((domain_parameters.as_ref(), public_point.as_slice())),
        PublicKeyParameters::Rsa { .. }
            => Err(Error::UnsupportedPublicKey { holder: certificate.holder_reference().clone() }),
    }
}

fn curve(certificate: &CvCertificate, parameters: &EcParameters) -> Result<PrimeWeierstrassCurve, Error> {
    PrimeWeierstrassCurve::from_explicit(parameters)
        .map_err(|error| Error::InvalidSignature { holder: certificate.holder_reference().clone(), error })
}

fn verify_issued_by(certificate: &CvCertificate, issuer: &CvCertificate, issuer_curve: &PrimeWeierstrassCurve) -> Result<(), Error> {
    let (_, issuer_point) = ec_public_key(issuer)?;
    let hash = issuer.public_key().hash_algorithm()
        .ok_or_else(|| Error::UnsupportedPublicKey { holder: issuer.holder_reference().clone() })?;
    certificate.verify_signature(issuer_curve, issuer_point, hash)
        .map_err(|error| Error::InvalidSignature { holder: certificate.holder_reference().clone(), error })
}
