//! Classification of failures across the protocol stack.


use std::fmt;


/// The broad category of a failure.
///
/// Every error type in this crate can be mapped onto exactly one kind, which determines how a caller
/// should react to it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Malformed TLV/ASN.1 data, an unexpected tag or a missing mandatory field.
    Decode,

    /// The card rejected or restricted the password (wrong, suspended, blocked, deactivated).
    Password,

    /// A cryptographic check failed: identical ephemeral keys, a wrong authentication token or a
    /// wrong Secure Messaging MAC.
    SecurityViolation,

    /// The certificate chain could not be built or verified, or the terminal's rights are
    /// insufficient.
    Chain,

    /// The card or reader failed to transport an APDU, or answered with an error status.
    Transport,

    /// The user aborted the authentication.
    Cancelled,
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => write!(f, "decode error"),
            Self::Password => write!(f, "password error"),
            Self::SecurityViolation => write!(f, "security violation"),
            Self::Chain => write!(f, "certificate chain error"),
            Self::Transport => write!(f, "transport error"),
            Self::Cancelled => write!(f, "cancelled by user"),
        }
    }
}
