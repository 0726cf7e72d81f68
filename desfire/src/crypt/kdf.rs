//! AN10922 key diversification.


use zeroize::Zeroizing;

use crate::crypt::cipher_mac::{cipher_for, CipherAndMac};
use crate::crypt::KeyType;
use crate::error::{Error, Result};


/// Maximum length of the diversification input in bytes.
pub const MAX_INPUT_LEN: usize = 31;


/// Diversify a master key with the AN10922 construction.
///
/// The diversified key is the CMAC of a constant-prefixed diversification
/// input under the master key; DES-family keys concatenate one 8-byte CMAC
/// per key third, each with its own prefix:
///
/// ```plain
/// AES-128:  D = CMAC(K, 0x01 || M)
/// 2TDEA:    D = CMAC(K, 0x21 || M) || CMAC(K, 0x22 || M)
/// 3TDEA:    D = CMAC(K, 0x31 || M) || CMAC(K, 0x32 || M) || CMAC(K, 0x33 || M)
/// ```
///
/// Single DES carries no AN10922 construction of its own.
pub fn diversify_an10922(key_type: KeyType, key: &[u8], input: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if input.len() > MAX_INPUT_LEN {
        return Err(Error::InvalidArgument("AN10922 input exceeds 31 bytes"));
    }
    if key.len() != key_type.key_length() {
        return Err(Error::InvalidArgument("key length does not match key type"));
    }

    let prefixes: &[u8] = match key_type {
        KeyType::Aes => &[0x01],
        KeyType::TwoTdea => &[0x21, 0x22],
        KeyType::ThreeTdea => &[0x31, 0x32, 0x33],
        KeyType::Des => return Err(Error::InvalidArgument("AN10922 is not defined for single DES")),
    };

    let cam = cipher_for(key_type);
    let mut derived = Zeroizing::new(Vec::with_capacity(key_type.key_length()));
    let mut message = Zeroizing::new(Vec::with_capacity(1 + input.len()));
    for &prefix in prefixes {
        message.clear();
        message.push(prefix);
        message.extend_from_slice(input);
        let mac = cam.cmac(key, &message);
        derived.extend_from_slice(&mac[0..cam.block_size()]);
    }
    Ok(derived)
}
