//! ISO/IEC 7816 command structures and card access.


pub mod apdu;
pub mod card;
pub mod file;
