//! Settings of the terminal side.


use rasn::types::Oid;

use crate::cvc::certificate::CvCertificate;
use crate::oids;


/// The Chip Authentication protocols with AES Secure Messaging.
pub const CA_AES_PROTOCOLS: [&'static Oid; 6] = [
    oids::CA_DH_AES_CBC_CMAC_128, oids::CA_DH_AES_CBC_CMAC_192, oids::CA_DH_AES_CBC_CMAC_256,
    oids::CA_ECDH_AES_CBC_CMAC_128, oids::CA_ECDH_AES_CBC_CMAC_192, oids::CA_ECDH_AES_CBC_CMAC_256,
];


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EacConfig {
    /// PACE protocols the terminal supports, in order of preference.
    pub accepted_pace_protocols: Vec<&'static Oid>,

    /// Chip Authentication protocols the terminal supports.
    pub accepted_ca_protocols: Vec<&'static Oid>,

    /// CVCA certificates to start a chain from when the service does not send them itself.
    pub trust_anchors: Vec<CvCertificate>,

    /// Whether READ BINARY may request more than 256 bytes at once.
    pub extended_length: bool,

    /// Whether the certificate chain is checked before it is sent to the card. The card checks
    /// it regardless.
    pub verify_chain_signatures: bool,
}
impl Default for EacConfig {
    fn default() -> Self {
        Self {
            accepted_pace_protocols: oids::PACE_GM_AES_PROTOCOLS.to_vec(),
            accepted_ca_protocols: CA_AES_PROTOCOLS.to_vec(),
            trust_anchors: Vec::new(),
            extended_length: false,
            verify_chain_signatures: true,
        }
    }
}
