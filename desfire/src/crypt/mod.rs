//! Cryptographic building blocks: key algorithms, rotation, CRCs.


pub mod cipher_mac;
pub mod kdf;


use crc::{Crc, CRC_16_ISO_IEC_14443_3_A, CRC_32_JAMCRC};


/// CRC-A as used on the ISO 14443-A link layer and by the d40 secure channel.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ISO_IEC_14443_3_A);

/// The DESFire CRC32 is the standard CRC-32 without the final complement.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);


/// The key algorithm of a DESFire key slot.
///
/// The algorithm determines the cipher block size, the challenge length used
/// during authentication and the length of the derived session key.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyType {
    Des,
    TwoTdea,
    ThreeTdea,
    Aes,
}
impl KeyType {
    /// Length of raw key material in bytes.
    pub const fn key_length(self) -> usize {
        match self {
            Self::Des => 8,
            Self::TwoTdea => 16,
            Self::ThreeTdea => 24,
            Self::Aes => 16,
        }
    }

    /// Cipher block size in bytes. All DES variants operate on 8-byte blocks.
    pub const fn block_size(self) -> usize {
        match self {
            Self::Des|Self::TwoTdea|Self::ThreeTdea => 8,
            Self::Aes => 16,
        }
    }

    /// Length of the random challenge exchanged during authentication.
    pub const fn challenge_length(self) -> usize {
        match self {
            Self::Des|Self::TwoTdea => 8,
            Self::ThreeTdea|Self::Aes => 16,
        }
    }

    /// Length of the session key derived by a successful authentication.
    pub const fn session_key_length(self) -> usize {
        match self {
            Self::Des => 8,
            Self::TwoTdea => 16,
            Self::ThreeTdea => 24,
            Self::Aes => 16,
        }
    }

    /// The two-bit algorithm tag carried in the key-number byte when the
    /// card master key switches algorithm (and in application key settings).
    pub const fn card_type_bits(self) -> u8 {
        match self {
            Self::Des|Self::TwoTdea => 0,
            Self::ThreeTdea => 1,
            Self::Aes => 2,
        }
    }
}


/// Rotate a buffer left by one byte in place.
pub fn rol8(data: &mut [u8]) {
    if data.is_empty() {
        return;
    }
    let first = data[0];
    data.copy_within(1.., 0);
    let last = data.len() - 1;
    data[last] = first;
}

/// XOR `other` into `data`.
pub(crate) fn xor_in_place(data: &mut [u8], other: &[u8]) {
    for (d, o) in data.iter_mut().zip(other.iter()) {
        *d ^= *o;
    }
}

/// Materialise a single-DES key as a 2TDEA key by duplicating its halves.
pub fn materialize_2tdea(des_key: &[u8]) -> [u8; 16] {
    let mut full = [0u8; 16];
    full[0..8].copy_from_slice(&des_key[0..8]);
    full[8..16].copy_from_slice(&des_key[0..8]);
    full
}

/// If a 3DES key's halves are equal, single DES is in force; a session key
/// derived from it must have equal halves too so downstream code picks the
/// same cipher.
pub fn collapse_des_session_key(auth_key: &[u8], session_key: &mut [u8]) {
    if auth_key.len() >= 16 && session_key.len() >= 16 && auth_key[0..8] == auth_key[8..16] {
        let (head, tail) = session_key.split_at_mut(8);
        tail[0..8].copy_from_slice(head);
    }
}

/// Encode a key version into the parity (LSB) bits of the first 8 bytes of a
/// DES-family key, most significant version bit first.
pub fn des_key_set_version(key: &mut [u8], version: u8) {
    for (i, byte) in key.iter_mut().take(8).enumerate() {
        *byte = (*byte & 0xFE) | ((version >> (7 - i)) & 0x01);
    }
}

/// Read the key version back out of the parity bits.
pub fn des_key_version(key: &[u8]) -> u8 {
    let mut version = 0u8;
    for (i, byte) in key.iter().take(8).enumerate() {
        version |= (byte & 0x01) << (7 - i);
    }
    version
}


/// ISO 14443-A CRC over `data`, little-endian.
pub fn crc16(data: &[u8]) -> [u8; 2] {
    CRC16.checksum(data).to_le_bytes()
}

/// DESFire CRC32 over `data`, little-endian.
pub fn crc32(data: &[u8]) -> [u8; 4] {
    CRC32.checksum(data).to_le_bytes()
}

/// DESFire CRC32 over several concatenated slices.
pub fn crc32_parts(parts: &[&[u8]]) -> [u8; 4] {
    let mut digest = CRC32.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize().to_le_bytes()
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_rol8() {
        let mut data = hex!("0102030405060708");
        rol8(&mut data);
        assert_eq!(data, hex!("0203040506070801"));
    }

    #[test]
    fn test_materialize_2tdea() {
        let key = hex!("0011223344556677");
        assert_eq!(materialize_2tdea(&key), hex!("00112233445566770011223344556677"));
    }

    #[test]
    fn test_collapse_des_session_key() {
        let auth_key = hex!("00112233445566770011223344556677");
        let mut session = hex!("a0a1a2a3a4a5a6a7b0b1b2b3b4b5b6b7");
        collapse_des_session_key(&auth_key, &mut session);
        assert_eq!(&session[8..16], &session[0..8]);

        let distinct_key = hex!("00112233445566778899aabbccddeeff");
        let mut session = hex!("a0a1a2a3a4a5a6a7b0b1b2b3b4b5b6b7");
        collapse_des_session_key(&distinct_key, &mut session);
        assert_eq!(&session[8..16], hex!("b0b1b2b3b4b5b6b7"));
    }

    #[test]
    fn test_des_key_version() {
        let mut key = hex!("00112233445566770011223344556677");
        des_key_set_version(&mut key, 0x55);
        assert_eq!(des_key_version(&key), 0x55);
        // upper bits of the key bytes stay put
        assert_eq!(key[0] & 0xFE, 0x00);
        assert_eq!(key[1] & 0xFE, 0x10);
    }

    #[test]
    fn test_crc16_crc_a() {
        // CRC-A check value from ISO/IEC 14443-3
        assert_eq!(crc16(b"123456789"), 0xBF05u16.to_le_bytes());
    }

    #[test]
    fn test_crc32_not_complemented() {
        // DESFire CRC32 is ~(standard CRC32)
        let standard = 0xCBF43926u32;
        assert_eq!(crc32(b"123456789"), (!standard).to_le_bytes());
        assert_eq!(crc32_parts(&[b"1234", b"56789"]), crc32(b"123456789"));
    }

    #[test]
    fn test_key_type_lengths() {
        assert_eq!(KeyType::Des.key_length(), 8);
        assert_eq!(KeyType::TwoTdea.key_length(), 16);
        assert_eq!(KeyType::ThreeTdea.key_length(), 24);
        assert_eq!(KeyType::Aes.key_length(), 16);
        assert_eq!(KeyType::ThreeTdea.block_size(), 8);
        assert_eq!(KeyType::Aes.block_size(), 16);
        assert_eq!(KeyType::ThreeTdea.challenge_length(), 16);
        assert_eq!(KeyType::TwoTdea.challenge_length(), 8);
    }
}
