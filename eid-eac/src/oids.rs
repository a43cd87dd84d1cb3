//! Object identifiers of BSI TR-03110 and the standards it builds upon.


use rasn::types::Oid;


macro_rules! bsi_oids {
    ($($name:ident => $($num:literal),+ $(,)?);+ $(;)?) => {
        $(
            pub const $name: &'static Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, $($num),+]);
        )+
    };
}

macro_rules! equals_any {
    ($template:expr, $option1:expr $(, $options:expr)* $(,)?) => {
        ($template == $option1 $(|| $template == $options)*)
    };
}
pub(crate) use equals_any;


bsi_oids! {
    // standardized domain parameters
    STANDARDIZED_DOMAIN_PARAMETERS => 1, 2;

    // public keys for Chip Authentication
    PK_DH => 2, 2, 1, 1;
    PK_ECDH => 2, 2, 1, 2;

    // Terminal Authentication
    TA => 2, 2, 2;
    TA_RSA => 2, 2, 2, 1;
    TA_ECDSA => 2, 2, 2, 2;
    TA_ECDSA_SHA_1 => 2, 2, 2, 2, 1;
    TA_ECDSA_SHA_224 => 2, 2, 2, 2, 2;
    TA_ECDSA_SHA_256 => 2, 2, 2, 2, 3;
    TA_ECDSA_SHA_384 => 2, 2, 2, 2, 4;
    TA_ECDSA_SHA_512 => 2, 2, 2, 2, 5;

    // Chip Authentication
    CA => 2, 2, 3;
    CA_DH => 2, 2, 3, 1;
    CA_DH_3DES_CBC_CBC => 2, 2, 3, 1, 1;
    CA_DH_AES_CBC_CMAC_128 => 2, 2, 3, 1, 2;
    CA_DH_AES_CBC_CMAC_192 => 2, 2, 3, 1, 3;
    CA_DH_AES_CBC_CMAC_256 => 2, 2, 3, 1, 4;
    CA_ECDH => 2, 2, 3, 2;
    CA_ECDH_3DES_CBC_CBC => 2, 2, 3, 2, 1;
    CA_ECDH_AES_CBC_CMAC_128 => 2, 2, 3, 2, 2;
    CA_ECDH_AES_CBC_CMAC_192 => 2, 2, 3, 2, 3;
    CA_ECDH_AES_CBC_CMAC_256 => 2, 2, 3, 2, 4;

    // PACE
    PACE => 2, 2, 4;
    PACE_DH_GM => 2, 2, 4, 1;
    PACE_DH_GM_3DES_CBC_CBC => 2, 2, 4, 1, 1;
    PACE_DH_GM_AES_CBC_CMAC_128 => 2, 2, 4, 1, 2;
    PACE_DH_GM_AES_CBC_CMAC_192 => 2, 2, 4, 1, 3;
    PACE_DH_GM_AES_CBC_CMAC_256 => 2, 2, 4, 1, 4;
    PACE_ECDH_GM => 2, 2, 4, 2;
    PACE_ECDH_GM_3DES_CBC_CBC => 2, 2, 4, 2, 1;
    PACE_ECDH_GM_AES_CBC_CMAC_128 => 2, 2, 4, 2, 2;
    PACE_ECDH_GM_AES_CBC_CMAC_192 => 2, 2, 4, 2, 3;
    PACE_ECDH_GM_AES_CBC_CMAC_256 => 2, 2, 4, 2, 4;
    PACE_DH_IM => 2, 2, 4, 3;
    PACE_ECDH_IM => 2, 2, 4, 4;
    PACE_ECDH_CAM => 2, 2, 4, 6;

    // certificate holder authorization templates
    INSPECTION_SYSTEM => 3, 1, 2, 1;
    AUTHENTICATION_TERMINAL => 3, 1, 2, 2;
    SIGNATURE_TERMINAL => 3, 1, 2, 3;

    // certificate extensions
    DESCRIPTION => 3, 1, 3, 1;
    DESCRIPTION_PLAIN_FORMAT => 3, 1, 3, 1, 1;
    DESCRIPTION_HTML_FORMAT => 3, 1, 3, 1, 2;
    DESCRIPTION_PDF_FORMAT => 3, 1, 3, 1, 3;
    SECTOR => 3, 1, 3, 2;

    // content type of EF.CardSecurity
    SECURITY_OBJECT => 3, 2, 1;
}

/// Alias used by certificate extensions.
pub const ID_DESCRIPTION: &'static Oid = DESCRIPTION;

/// `ecPublicKey` (ANSI X9.62).
pub const EC_PUBLIC_KEY: &'static Oid = Oid::const_new(&[1, 2, 840, 10045, 2, 1]);

/// `prime-field` (ANSI X9.62).
pub const PRIME_FIELD: &'static Oid = Oid::const_new(&[1, 2, 840, 10045, 1, 1]);

/// `dhpublicnumber` (ANSI X9.42).
pub const DH_PUBLIC_NUMBER: &'static Oid = Oid::const_new(&[1, 2, 840, 10046, 2, 1]);

/// `signedData` (PKCS #7 / CMS).
pub const CMS_SIGNED_DATA: &'static Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 7, 2]);


/// The PACE protocols that use Generic Mapping with AES, which is what this crate implements.
pub const PACE_GM_AES_PROTOCOLS: [&'static Oid; 6] = [
    PACE_DH_GM_AES_CBC_CMAC_128, PACE_DH_GM_AES_CBC_CMAC_192, PACE_DH_GM_AES_CBC_CMAC_256,
    PACE_ECDH_GM_AES_CBC_CMAC_128, PACE_ECDH_GM_AES_CBC_CMAC_192, PACE_ECDH_GM_AES_CBC_CMAC_256,
];


/// Whether `oid` lies strictly below `prefix` in the identifier tree.
pub fn is_below(oid: &Oid, prefix: &Oid) -> bool {
    oid.len() > prefix.len() && oid[..prefix.len()] == prefix[..]
}

/// Whether `oid` is `prefix` followed by exactly one more arc.
pub fn is_direct_child(oid: &Oid, prefix: &Oid) -> bool {
    oid.len() == prefix.len() + 1 && is_below(oid, prefix)
}

/// Whether `oid` names a Chip Authentication protocol on elliptic curves.
pub fn is_ca_ecdh(oid: &Oid) -> bool {
    is_direct_child(oid, CA_ECDH)
}

/// Whether `oid` names a Chip Authentication protocol in a prime field.
pub fn is_ca_dh(oid: &Oid) -> bool {
    is_direct_child(oid, CA_DH)
}
