//! The hand-over between the user interface and the protocol.
//!
//! The orchestrator asks for the password and the access rights the user agrees to grant, then
//! blocks until the user interface either delivers them or gives up. The channel carries exactly
//! one value. Cancelling remains possible after delivery; the orchestrator checks for it before
//! every command it sends to the card.


use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::cvc::certificate::CvCertificate;
use crate::cvc::chat::Chat;
use crate::cvc::description::CertificateDescription;
use crate::iso7816::apdu::{Apdu, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::pace::PasswordType;


/// What the user is asked to agree to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsentRequest {
    pub terminal_certificate: CvCertificate,
    pub description: CertificateDescription,

    /// Rights the service cannot do without.
    pub required_chat: Chat,

    /// Rights the user may additionally grant, already restricted to those of the terminal
    /// certificate.
    pub optional_chat: Chat,
}


/// The user's answer: the password to run PACE with and the rights to request.
#[derive(Clone, Debug)]
pub struct Consent {
    pub password_type: PasswordType,
    pub password: Zeroizing<Vec<u8>>,
    pub selected_chat: Chat,
}
impl Consent {
    pub fn new(password_type: PasswordType, password: &[u8], selected_chat: Chat) -> Self {
        Self {
            password_type,
            password: Zeroizing::new(password.to_vec()),
            selected_chat,
        }
    }
}


/// Where the exchange stands, as seen by either end.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ConsentState {
    Pending,
    Delivered,
    Cancelled,
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ReceiveError {
    /// The user gave up, or the sending end went away without delivering.
    Cancelled,
    TimedOut,
    /// The value was already taken by an earlier call.
    AlreadyReceived,
}
impl fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "consent was cancelled"),
            Self::TimedOut => write!(f, "timed out waiting for consent"),
            Self::AlreadyReceived => write!(f, "consent was already received"),
        }
    }
}
impl std::error::Error for ReceiveError {
}


struct Slot<T> {
    value: Option<T>,
    delivered: bool,
    cancelled: bool,
}
impl<T> Slot<T> {
    fn state(&self) -> ConsentState {
        if self.cancelled {
            ConsentState::Cancelled
        } else if self.delivered {
            ConsentState::Delivered
        } else {
            ConsentState::Pending
        }
    }
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    signal: Condvar,
}
impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // the slot holds no invariant a panicking holder could break
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        let mut slot = self.lock();
        slot.cancelled = true;
        slot.value = None;
        self.signal.notify_all();
    }
}


/// Creates a one-shot channel.
pub fn channel<T>() -> (ConsentSender<T>, ConsentReceiver<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot { value: None, delivered: false, cancelled: false }),
        signal: Condvar::new(),
    });
    (
        ConsentSender { shared: Arc::clone(&shared) },
        ConsentReceiver { shared },
    )
}


/// The user interface's end. Dropping it without delivering cancels.
pub struct ConsentSender<T> {
    shared: Arc<Shared<T>>,
}
impl<T> ConsentSender<T> {
    /// Hands the value over. Fails, returning the value, if the exchange was cancelled already.
    pub fn deliver(self, value: T) -> Result<(), T> {
        let mut slot = self.shared.lock();
        if slot.cancelled {
            return Err(value);
        }
        slot.value = Some(value);
        slot.delivered = true;
        self.shared.signal.notify_all();
        Ok(())
    }

    pub fn cancel(self) {
        self.shared.cancel();
    }

    /// A handle that can still cancel once the value has been delivered.
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn state(&self) -> ConsentState {
        self.shared.lock().state()
    }
}
impl<T> Drop for ConsentSender<T> {
    fn drop(&mut self) {
        let undelivered = !self.shared.lock().delivered;
        if undelivered {
            self.shared.cancel();
        }
    }
}
impl<T> fmt::Debug for ConsentSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsentSender")
            .field("state", &self.state())
            .finish()
    }
}


/// Cancels an exchange from any thread, before or after delivery.
pub struct CancelHandle<T> {
    shared: Arc<Shared<T>>,
}
impl<T> CancelHandle<T> {
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }
}
impl<T> Clone for CancelHandle<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}
impl<T> fmt::Debug for CancelHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}


/// The protocol's end.
pub struct ConsentReceiver<T> {
    shared: Arc<Shared<T>>,
}
impl<T> ConsentReceiver<T> {
    pub fn state(&self) -> ConsentState {
        self.shared.lock().state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// Takes the value if it has arrived, without waiting.
    pub fn try_receive(&self) -> Result<Option<T>, ReceiveError> {
        let mut slot = self.shared.lock();
        take(&mut slot).map(Some).or_else(|e| match e {
            ReceiveError::TimedOut => Ok(None),
            other => Err(other),
        })
    }

    /// Blocks until the value arrives or the exchange is cancelled.
    pub fn receive(&self) -> Result<T, ReceiveError> {
        let mut slot = self.shared.lock();
        while slot.state() == ConsentState::Pending {
            slot = self.shared.signal.wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        take(&mut slot)
    }

    /// Like [`receive`](Self::receive), giving up after `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<T, ReceiveError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.lock();
        while slot.state() == ConsentState::Pending {
            let now = Instant::now();
            if now >= deadline {
                return Err(ReceiveError::TimedOut);
            }
            let (next, _) = self.shared.signal.wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = next;
        }
        take(&mut slot)
    }

    /// Wraps `card` so that every command is refused once the exchange is cancelled.
    pub fn gate<'g, SC: SmartCard + ?Sized>(&'g self, card: &'g mut SC) -> Gated<'g, T, SC> {
        Gated { receiver: self, card }
    }
}
impl<T> fmt::Debug for ConsentReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsentReceiver")
            .field("state", &self.state())
            .finish()
    }
}

fn take<T>(slot: &mut Slot<T>) -> Result<T, ReceiveError> {
    match slot.state() {
        ConsentState::Cancelled => Err(ReceiveError::Cancelled),
        ConsentState::Pending => Err(ReceiveError::TimedOut),
        ConsentState::Delivered => slot.value.take().ok_or(ReceiveError::AlreadyReceived),
    }
}


/// A card that refuses to transmit after the user cancelled.
pub struct Gated<'g, T, SC: SmartCard + ?Sized> {
    receiver: &'g ConsentReceiver<T>,
    card: &'g mut SC,
}
impl<'g, T, SC: SmartCard + ?Sized> SmartCard for Gated<'g, T, SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        if self.receiver.is_cancelled() {
            return Err(CommunicationError::Cancelled);
        }
        self.card.communicate(request)
    }

    fn destroy_secure_channel(&mut self) -> Result<(), CommunicationError> {
        self.card.destroy_secure_channel()
    }
}


#[cfg(test)]
mod tests {
    use super::{channel, ConsentState, ReceiveError};
    use crate::iso7816::apdu::{Apdu, Response};
    use crate::iso7816::card::{CommunicationError, SmartCard};
    use std::thread;
    use std::time::Duration;

    struct EchoCard {
        commands: usize,
    }
    impl SmartCard for EchoCard {
        fn communicate(&mut self, _request: &Apdu) -> Result<Response, CommunicationError> {
            self.commands += 1;
            Ok(Response::new(Vec::new(), 0x9000))
        }
    }

    #[test]
    fn deliver_then_receive() {
        let (sender, receiver) = channel::<u32>();
        assert_eq!(receiver.state(), ConsentState::Pending);
        assert_eq!(receiver.try_receive(), Ok(None));

        sender.deliver(42).unwrap();
        assert_eq!(receiver.state(), ConsentState::Delivered);
        assert_eq!(receiver.receive(), Ok(42));
        assert_eq!(receiver.receive(), Err(ReceiveError::AlreadyReceived));
    }

    #[test]
    fn receive_across_threads() {
        let (sender, receiver) = channel::<String>();
        let user_interface = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.deliver("123456".to_owned()).unwrap();
        });
        assert_eq!(receiver.receive().as_deref(), Ok("123456"));
        user_interface.join().unwrap();
    }

    #[test]
    fn dropping_the_sender_cancels() {
        let (sender, receiver) = channel::<u32>();
        let user_interface = thread::spawn(move || drop(sender));
        assert_eq!(receiver.receive(), Err(ReceiveError::Cancelled));
        user_interface.join().unwrap();
        assert_eq!(receiver.state(), ConsentState::Cancelled);
    }

    #[test]
    fn no_delivery_after_cancel() {
        let (sender, receiver) = channel::<u32>();
        let handle = sender.cancel_handle();
        handle.cancel();
        assert_eq!(sender.deliver(7), Err(7));
        assert!(receiver.is_cancelled());
        assert_eq!(receiver.try_receive(), Err(ReceiveError::Cancelled));
    }

    #[test]
    fn timeout() {
        let (_sender, receiver) = channel::<u32>();
        assert_eq!(receiver.receive_timeout(Duration::from_millis(10)), Err(ReceiveError::TimedOut));
    }

    #[test]
    fn gate_refuses_after_cancel() {
        let (sender, receiver) = channel::<u32>();
        let handle = sender.cancel_handle();
        sender.deliver(1).unwrap();
        assert_eq!(receiver.receive(), Ok(1));

        let mut card = EchoCard { commands: 0 };
        let request = Apdu::try_from_bytes(&[0x00, 0x84, 0x00, 0x00, 0x08]).unwrap();
        {
            let mut gated = receiver.gate(&mut card);
            assert!(gated.communicate(&request).is_ok());
            handle.cancel();
            assert!(matches!(gated.communicate(&request), Err(CommunicationError::Cancelled)));
        }
        assert_eq!(card.commands, 1);
    }
}
