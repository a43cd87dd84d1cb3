//! Card Verifiable Certificates, their chains and the authorization templates they carry.


pub mod certificate;
pub mod chain;
pub mod chat;
pub mod description;
pub mod verifier;


pub use certificate::{CvCertificate, PublicKeyReference};
pub use chain::CertificateChain;
pub use chat::{AccessRight, Chat, Role, TerminalType};
pub use description::CertificateDescription;
