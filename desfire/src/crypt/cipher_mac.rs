//! Cipher and MAC combinations for the four DESFire key algorithms.


use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use cmac::{Cmac, Mac};
use des::{Des, TdesEde2, TdesEde3};
use zeroize::Zeroizing;

use crate::crypt::{xor_in_place, KeyType};


/// Cipher, chaining and MAC capabilities of one key algorithm.
///
/// All chaining operations work in place and update the caller's IV so the
/// vector can be carried across commands, which is how every DESFire secure
/// channel behaves.
pub trait CipherAndMac {
    /// Size of the raw key in bytes.
    fn key_size(&self) -> usize;

    /// Block size of the cipher in bytes.
    fn block_size(&self) -> usize;

    /// Encrypt a single raw block in place (no chaining).
    fn encrypt_block(&self, key: &[u8], block: &mut [u8]);

    /// Decrypt a single raw block in place (no chaining).
    fn decrypt_block(&self, key: &[u8], block: &mut [u8]);

    /// CBC-encrypt pre-padded data in place. `iv` is updated to the last
    /// ciphertext block.
    fn encrypt_cbc(&self, key: &[u8], iv: &mut [u8], data: &mut [u8]);

    /// CBC-decrypt data in place. `iv` is updated to the last ciphertext
    /// block that went in. Does not strip padding.
    fn decrypt_cbc(&self, key: &[u8], iv: &mut [u8], data: &mut [u8]);

    /// Legacy transmit chaining as used by the d40 channel: each plaintext
    /// block is XORed with the running vector and then *deciphered*; the
    /// decipherment result is transmitted and becomes the next vector.
    fn encrypt_send(&self, key: &[u8], iv: &mut [u8], data: &mut [u8]);

    /// One-shot CMAC (NIST SP 800-38B) over `data`, full block length.
    fn cmac(&self, key: &[u8], data: &[u8]) -> Zeroizing<Vec<u8>>;

    /// The SP 800-38B subkeys `(K1, K2)` for this cipher under `key`.
    fn cmac_subkeys(&self, key: &[u8]) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>);
}


/// Pick the capability set for a key algorithm.
pub fn cipher_for(key_type: KeyType) -> &'static dyn CipherAndMac {
    match key_type {
        KeyType::Des => &CamDes,
        KeyType::TwoTdea => &Cam2Tdea,
        KeyType::ThreeTdea => &Cam3Tdea,
        KeyType::Aes => &CamAes128,
    }
}


fn cbc_encrypt<C: BlockEncrypt>(cipher: &C, iv: &mut [u8], data: &mut [u8]) {
    let block_size = iv.len();
    for block in data.chunks_exact_mut(block_size) {
        xor_in_place(block, iv);
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        iv.copy_from_slice(block);
    }
}

fn cbc_decrypt<C: BlockDecrypt>(cipher: &C, iv: &mut [u8], data: &mut [u8]) {
    let block_size = iv.len();
    let mut prev = Zeroizing::new(iv.to_vec());
    for block in data.chunks_exact_mut(block_size) {
        let ciphertext = Zeroizing::new(block.to_vec());
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        xor_in_place(block, &prev);
        prev.copy_from_slice(&ciphertext);
    }
    iv.copy_from_slice(&prev);
}

fn cbc_send<C: BlockDecrypt>(cipher: &C, iv: &mut [u8], data: &mut [u8]) {
    let block_size = iv.len();
    for block in data.chunks_exact_mut(block_size) {
        xor_in_place(block, iv);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        iv.copy_from_slice(block);
    }
}

/// Doubling in GF(2^64) / GF(2^128) per SP 800-38B.
fn dbl(input: &[u8], rb: u8) -> Vec<u8> {
    let mut output = vec![0u8; input.len()];
    let mut carry = 0u8;
    for i in (0..input.len()).rev() {
        output[i] = (input[i] << 1) | carry;
        carry = input[i] >> 7;
    }
    if carry != 0 {
        let last = output.len() - 1;
        output[last] ^= rb;
    }
    output
}

fn subkeys<C: BlockEncrypt>(cipher: &C, block_size: usize) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
    let rb: u8 = if block_size == 16 { 0x87 } else { 0x1B };
    let mut l = Zeroizing::new(vec![0u8; block_size]);
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut l));
    let k1 = Zeroizing::new(dbl(&l, rb));
    let k2 = Zeroizing::new(dbl(&k1, rb));
    (k1, k2)
}


macro_rules! impl_cipher_and_mac {
    ($name:ident, $cipher:ty, $key_size:expr, $block_size:expr) => {
        pub struct $name;
        impl CipherAndMac for $name {
            fn key_size(&self) -> usize { $key_size }
            fn block_size(&self) -> usize { $block_size }

            fn encrypt_block(&self, key: &[u8], block: &mut [u8]) {
                let cipher = <$cipher>::new_from_slice(key).unwrap();
                cipher.encrypt_block(GenericArray::from_mut_slice(block));
            }

            fn decrypt_block(&self, key: &[u8], block: &mut [u8]) {
                let cipher = <$cipher>::new_from_slice(key).unwrap();
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }

            fn encrypt_cbc(&self, key: &[u8], iv: &mut [u8], data: &mut [u8]) {
                let cipher = <$cipher>::new_from_slice(key).unwrap();
                cbc_encrypt(&cipher, iv, data);
            }

            fn decrypt_cbc(&self, key: &[u8], iv: &mut [u8], data: &mut [u8]) {
                let cipher = <$cipher>::new_from_slice(key).unwrap();
                cbc_decrypt(&cipher, iv, data);
            }

            fn encrypt_send(&self, key: &[u8], iv: &mut [u8], data: &mut [u8]) {
                let cipher = <$cipher>::new_from_slice(key).unwrap();
                cbc_send(&cipher, iv, data);
            }

            fn cmac(&self, key: &[u8], data: &[u8]) -> Zeroizing<Vec<u8>> {
                let mut mac = <Cmac<$cipher> as Mac>::new_from_slice(key).unwrap();
                Mac::update(&mut mac, data);
                Zeroizing::new(mac.finalize().into_bytes().to_vec())
            }

            fn cmac_subkeys(&self, key: &[u8]) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
                let cipher = <$cipher>::new_from_slice(key).unwrap();
                subkeys(&cipher, $block_size)
            }
        }
    };
}

impl_cipher_and_mac!(CamDes, Des, 8, 8);
impl_cipher_and_mac!(Cam2Tdea, TdesEde2, 16, 8);
impl_cipher_and_mac!(Cam3Tdea, TdesEde3, 24, 8);
impl_cipher_and_mac!(CamAes128, Aes128, 16, 16);
