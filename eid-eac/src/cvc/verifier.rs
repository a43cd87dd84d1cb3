//! Checks binding the terminal certificate to what the user is shown and asked to consent to.


use subtle::ConstantTimeEq;

use crate::cvc::certificate::CvCertificate;
use crate::cvc::chain::Error;
use crate::cvc::chat::Chat;
use crate::cvc::description::CertificateDescription;


/// Checks that the terminal certificate attests exactly this certificate description.
///
/// The hash is computed with the hash function of the terminal's signature algorithm.
pub fn verify_description(terminal_certificate: &CvCertificate, description: &CertificateDescription) -> Result<(), Error> {
    let attested = terminal_certificate.description_hash()
        .ok_or(Error::MissingDescriptionHash)?;
    let hash_algorithm = terminal_certificate.public_key().hash_algorithm()
        .ok_or_else(|| Error::UnsupportedPublicKey { holder: terminal_certificate.holder_reference().clone() })?;
    let actual = description.hash(hash_algorithm);
    if bool::from(actual.as_slice().ct_eq(attested)) {
        Ok(())
    } else {
        Err(Error::DescriptionHashMismatch)
    }
}


/// Checks that the terminal requests no right beyond those its certificate grants.
pub fn verify_chat(authorized: &Chat, required: &Chat) -> Result<(), Error> {
    if authorized.terminal_type() != required.terminal_type() {
        return Err(Error::TerminalTypeMismatch {
            authorized: authorized.terminal_type(),
            required: required.terminal_type(),
        });
    }
    if !authorized.covers(required) {
        return Err(Error::RightsExceeded);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::verify_chat;
    use crate::cvc::chain::Error;
    use crate::cvc::chat::{AccessRight, Chat, Role, TerminalType};

    #[test]
    fn chat_within_authorization() {
        let mut authorized = Chat::empty(TerminalType::AuthenticationTerminal, Role::Terminal);
        authorized.set_right(AccessRight::ReadDataGroup(1), true);
        authorized.set_right(AccessRight::ReadDataGroup(2), true);
        authorized.set_right(AccessRight::RestrictedIdentification, true);

        let mut required = Chat::empty(TerminalType::AuthenticationTerminal, Role::Terminal);
        assert_eq!(verify_chat(&authorized, &required), Ok(()));
        required.set_right(AccessRight::ReadDataGroup(2), true);
        assert_eq!(verify_chat(&authorized, &required), Ok(()));
        required.set_right(AccessRight::RestrictedIdentification, true);
        assert_eq!(verify_chat(&authorized, &required), Ok(()));

        required.set_right(AccessRight::AgeVerification, true);
        assert_eq!(verify_chat(&authorized, &required), Err(Error::RightsExceeded));
    }

    #[test]
    fn chat_of_other_terminal_type() {
        let authorized = Chat::empty(TerminalType::AuthenticationTerminal, Role::Terminal);
        let required = Chat::empty(TerminalType::InspectionSystem, Role::Terminal);
        assert_eq!(
            verify_chat(&authorized, &required),
            Err(Error::TerminalTypeMismatch {
                authorized: TerminalType::AuthenticationTerminal,
                required: TerminalType::InspectionSystem,
            }),
        );
    }
}
