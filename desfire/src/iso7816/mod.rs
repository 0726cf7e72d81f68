//! ISO/IEC 7816 structures and the card transport boundary.


pub mod apdu;
pub mod card;


/// Class byte wrapping native DESFire instructions in ISO 7816 APDUs.
pub const NATIVE_WRAP_CLA: u8 = 0x90;

/// ISO 7816-4 instruction bytes used by the ISO authentication flow.
pub const INS_SELECT_FILE: u8 = 0xA4;
pub const INS_GET_CHALLENGE: u8 = 0x84;
pub const INS_EXTERNAL_AUTHENTICATE: u8 = 0x82;
pub const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
