use std::fmt;

use tracing::trace;

use crate::error::ErrorKind;
use crate::iso7816::apdu;
use crate::secure_messaging;


#[derive(Debug)]
pub enum CommunicationError {
    Write(apdu::WriteError),
    #[cfg(feature = "pcsc")]
    Pcsc(pcsc::Error),
    ShortResponse,
    SecureMessaging(secure_messaging::Error),
    /// The transport failed in a way specific to its implementation.
    Transport(String),
    /// The user withdrew consent before the command was sent.
    Cancelled,
}
impl CommunicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SecureMessaging(e) => e.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Transport,
        }
    }
}
impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(e) => write!(f, "APDU write error: {}", e),
            #[cfg(feature = "pcsc")]
            Self::Pcsc(e) => write!(f, "PCSC error: {}", e),
            Self::ShortResponse => write!(f, "response too short"),
            Self::SecureMessaging(e) => write!(f, "Secure Messaging error: {}", e),
            Self::Transport(message) => write!(f, "transport error: {}", message),
            Self::Cancelled => write!(f, "cancelled before transmission"),
        }
    }
}
impl std::error::Error for CommunicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write(e) => Some(e),
            #[cfg(feature = "pcsc")]
            Self::Pcsc(e) => Some(e),
            Self::ShortResponse => None,
            Self::SecureMessaging(e) => Some(e),
            Self::Transport(_) => None,
            Self::Cancelled => None,
        }
    }
}
impl From<apdu::WriteError> for CommunicationError {
    fn from(value: apdu::WriteError) -> Self { Self::Write(value) }
}
#[cfg(feature = "pcsc")]
impl From<pcsc::Error> for CommunicationError {
    fn from(value: pcsc::Error) -> Self { Self::Pcsc(value) }
}
impl From<secure_messaging::Error> for CommunicationError {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}


/// A smart card compatible with ISO/IEC 7816.
pub trait SmartCard {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError>;

    /// Tears down a secure channel the transport itself maintains, such as one set up by a reader
    /// with a PIN pad. Transports without one have nothing to do.
    fn destroy_secure_channel(&mut self) -> Result<(), CommunicationError> {
        Ok(())
    }
}
impl<SC: SmartCard + ?Sized> SmartCard for &mut SC {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }

    fn destroy_secure_channel(&mut self) -> Result<(), CommunicationError> {
        (**self).destroy_secure_channel()
    }
}
impl<SC: SmartCard + ?Sized> SmartCard for Box<SC> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }

    fn destroy_secure_channel(&mut self) -> Result<(), CommunicationError> {
        (**self).destroy_secure_channel()
    }
}

#[cfg(feature = "pcsc")]
impl SmartCard for pcsc::Card {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        let out_buf = request.to_bytes()?;
        trace!("sending to card:\n{}", crate::hexdump(&out_buf));
        // secured responses carry more than the plain expected length
        let mut in_buf = vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let in_slice = self.transmit(&out_buf, &mut in_buf)?;
        trace!("received from card:\n{}", crate::hexdump(in_slice));
        apdu::Response::from_slice(in_slice)
            .ok_or(CommunicationError::ShortResponse)
    }
}


/// Sends `request` and logs both directions at trace level.
pub(crate) fn transmit<SC: SmartCard + ?Sized>(card: &mut SC, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
    trace!("command: {:?}", request.header);
    let response = card.communicate(request)?;
    trace!("response: {:?} with {} bytes of data", response.trailer, response.data.len());
    Ok(response)
}
