//! Certificates of a test PKI: a CVCA, a DV below it and an authentication terminal below that,
//! plus an unrelated self-signed CVCA. All keys are on brainpoolP256r1 and sign with ECDSA-SHA-256.
#![allow(dead_code)]


use eid_eac::iso7816::apdu::{Apdu, Response};
use eid_eac::iso7816::card::{CommunicationError, SmartCard};
use hex_literal::hex;


/// DETESTCVCA00001, self-signed.
pub const CVCA: [u8; 445] = hex!("
    7F218201B87F4E8201705F290100420F4445544553544356434130303030317F
    4982011D060A04007F000702020202038120A9FB57DBA1EEA9BC3E660A909D83
    8D726E3BF623D52620282013481D1F6E537782207D5A0975FC2C3057EEF67530
    417AFFE7FB8055C126DC5C6CE94A4B44F330B5D9832026DC5C6CE94A4B44F330
    B5D9BBD77CBF958416295CF7E1CE6BCCDC18FF8C07B68441048BD2AEB9CB7E57
    CB2C4B482FFC81B7AFB9DE27E1E3BD23C23A4453BD9ACE3262547EF835C3DAC4
    FD97F8461A14611DC9C27745132DED8E545C1D54C72F0469978520A9FB57DBA1
    EEA9BC3E660A909D838D718C397AA3B561A6F7901E0E82974856A786410431E2
    74DFDD814F62DECFA1A797C3C244E14744A577D95704ADB91C47297268B10B05
    C0DACB2451B3819EF8BFB621521B436F70644BD6068CF6B9AA73B85B330E8701
    015F200F4445544553544356434130303030317F4C12060904007F0007030102
    025305FF3FFFFFF75F25060205000100015F24060208000100015F374072F361
    34BD3CA5971D6F2A2B6682FE3EF5DF4A6B7CE0941F4E077AFAB285F95E67CCB3
    9F00A3E11CFE4BDA99CE3FC7AF50F5CB03AEBC3BB50936FB6B4B992F8A
");

/// DETESTDV00001, issued by DETESTCVCA00001.
pub const DV: [u8; 233] = hex!("
    7F2181E57F4E819E5F290100420F4445544553544356434130303030317F494F
    060A04007F000702020202038641044D60CAD60D6FAEE1FA6261DF22E3858114
    512DE6A04AA70AFB58F5A5DB3B21105B6231BB8321DE48D6E9270CC694849FBA
    99D6E3E5B0E9ED70C4BFD76A40EAB05F200D444554455354445630303030317F
    4C12060904007F0007030102025305BF3FFFFFF75F25060205000100015F2406
    0208000100015F37400A996366C19BC40B46BAAA6BB25A9EDA9804312366FAA2
    1F6F041322F779C297886A8529523BB89238EECF9D90C7E85A184F3767168C7A
    BEACCD553C78F0254A
");

/// DETESTTERM00001, issued by DETESTDV00001, attesting [`DESCRIPTION`].
pub const TERMINAL: [u8; 283] = hex!("
    7F218201167F4E81CF5F290100420D444554455354445630303030317F494F06
    0A04007F000702020202038641044684709F48CDFD09C2333433352BE157155B
    1670B2E39AC453B4DC0D4F369A5D67114A7C320A4AD8A186780A90F243E994FB
    E2B99FF2921C0D235C82B62119CF5F200F4445544553545445524D3030303031
    7F4C12060904007F0007030102025305003F0FFF075F25060205000100015F24
    06020800010001652F732D060904007F000703010301802078D7E42B3B7E4F06
    8338B8AE6644A787C3D26A245D0C8A36B3FCFBFD6DAF2B905F374082FA29FCCA
    B4D8A1BE9F925092CD971C84379DCCB40C22A99C80E7BC3DBD8E89A4CE5B945C
    AD67E910E59207F7B24EA9D0184A6E1CAD2C52976E4B692B7204B9
");

/// XXSTRANGER00001, self-signed, issuing nothing.
pub const STRANGER: [u8; 445] = hex!("
    7F218201B87F4E8201705F290100420F5858535452414E47455230303030317F
    4982011D060A04007F000702020202038120A9FB57DBA1EEA9BC3E660A909D83
    8D726E3BF623D52620282013481D1F6E537782207D5A0975FC2C3057EEF67530
    417AFFE7FB8055C126DC5C6CE94A4B44F330B5D9832026DC5C6CE94A4B44F330
    B5D9BBD77CBF958416295CF7E1CE6BCCDC18FF8C07B68441048BD2AEB9CB7E57
    CB2C4B482FFC81B7AFB9DE27E1E3BD23C23A4453BD9ACE3262547EF835C3DAC4
    FD97F8461A14611DC9C27745132DED8E545C1D54C72F0469978520A9FB57DBA1
    EEA9BC3E660A909D838D718C397AA3B561A6F7901E0E82974856A78641046F09
    8707997A2A7DC1CAE0EB0E5AA2F6CC8EE222093DC9BAC4434D976FD0E6BB3086
    FC0257CD822D8EE84F91495394822C9DEB710B5415A48B954B36F3BD8EA18701
    015F200F5858535452414E47455230303030317F4C12060904007F0007030102
    025305FF3FFFFFFF5F25060205000100015F24060208000100015F37402347CF
    9EB5425B57BA89B0D22E818D583B0103E305CD57967788FC4862EBB3BF1CF424
    B7CF4C16D1E6C7F47E5ADF964BB63CA223D0C3DE14887135CB9A31343C
");

pub const DESCRIPTION: [u8; 74] = hex!("
    30 48
        06 0A 04007F00070301030101
        A1 06 0C 04 42534920
        A2 10 13 0E 68747470733A2F2F6273692E6465
        A3 06 0C 04 54455354
        A5 0C 0C 0A 6E6F207465726D732E2E
        A7 0A 31 08 04 06 010203040506
");

/// The public key of the terminal certificate, which doubles as an ephemeral key in tests.
pub const TERMINAL_PUBLIC_KEY: [u8; 65] = hex!("
    044684709F48CDFD09C2333433352BE157155B1670B2E39AC453B4DC0D4F369A
    5D67114A7C320A4AD8A186780A90F243E994FBE2B99FF2921C0D235C82B62119
    CF
");

/// id-PACE-ECDH-GM-AES-CBC-CMAC-128 v2 on brainpoolP256r1 and
/// id-CA-ECDH-AES-CBC-CMAC-128 v2 with key 41.
pub const CARD_ACCESS: [u8; 42] = hex!("
    31 28
        30 12 06 0A 04007F00070202040202 02 01 02 02 01 0D
        30 12 06 0A 04007F00070202030202 02 01 02 02 01 29
");


/// A card that serves transparent files, accepts every other command and records what it was
/// sent.
///
/// GET CHALLENGE is answered with [`FileCard::CHALLENGE`], GENERAL AUTHENTICATE with
/// `general_authenticate` if set. Unknown files are refused with 6A82.
pub struct FileCard {
    pub files: Vec<(u16, Vec<u8>)>,
    pub general_authenticate: Option<Vec<u8>>,
    pub requests: Vec<Vec<u8>>,
    selected: Option<usize>,
}
impl FileCard {
    pub const CHALLENGE: [u8; 8] = hex!("0102030405060708");

    pub fn new(files: Vec<(u16, Vec<u8>)>) -> Self {
        Self {
            files,
            general_authenticate: None,
            requests: Vec::new(),
            selected: None,
        }
    }
}
impl SmartCard for FileCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        self.requests.push(request.to_bytes().unwrap());
        match request.header.ins {
            0xA4 => {
                let Some(request_data) = request.data.request_data() else {
                    return Ok(Response::new(Vec::new(), 0x6988));
                };
                let fid = u16::from_be_bytes([request_data[0], request_data[1]]);
                self.selected = self.files.iter().position(|(f, _)| *f == fid);
                if self.selected.is_some() {
                    Ok(Response::new(Vec::new(), 0x9000))
                } else {
                    Ok(Response::new(Vec::new(), 0x6A82))
                }
            },
            0xB0 => {
                let Some(selected) = self.selected else {
                    return Ok(Response::new(Vec::new(), 0x6986));
                };
                let content = &self.files[selected].1;
                let offset = usize::from(u16::from_be_bytes([request.header.p1, request.header.p2]));
                let le = request.data.response_data_length().unwrap();
                if offset >= content.len() {
                    return Ok(Response::new(Vec::new(), 0x6B00));
                }
                let end = (offset + le).min(content.len());
                let sw = if offset + le > content.len() { 0x6282 } else { 0x9000 };
                Ok(Response::new(content[offset..end].to_vec(), sw))
            },
            0x84 => Ok(Response::new(Self::CHALLENGE.to_vec(), 0x9000)),
            0x86 => Ok(Response::new(self.general_authenticate.clone().unwrap_or_default(), 0x9000)),
            _ => Ok(Response::new(Vec::new(), 0x9000)),
        }
    }
}
