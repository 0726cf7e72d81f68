//! Secure-channel codec: wraps outbound payloads and unwraps responses
//! according to the session's channel generation and the command's
//! communication mode.
//!
//! The wrap side sees the payload before TX chaining; the unwrap side sees
//! the response after RX reassembly.


use block_padding::{Iso7816, RawPadding};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::context::{CommMode, DesfireContext, SecureChannel};
use crate::crypt::cipher_mac::{cipher_for, CipherAndMac};
use crate::crypt::{crc16, crc32_parts, xor_in_place};
use crate::error::{Error, Result};
use crate::status::Status;


/// Truncated MAC lengths.
const D40_MAC_LEN: usize = 4;
const CMAC_LEN: usize = 8;


/// How a single command is to be protected on the wire.
///
/// `EncryptedRaw` pads and encrypts without appending the channel checksum;
/// it serves the commands that construct their own CRC (ChangeKey,
/// SetConfiguration), with `plain_header` leading bytes left unprotected.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum WrapMode {
    Plain,
    Mac,
    Encrypted,
    EncryptedRaw { plain_header: usize },
}
impl From<CommMode> for WrapMode {
    fn from(value: CommMode) -> Self {
        match value {
            CommMode::Plain => Self::Plain,
            CommMode::Mac => Self::Mac,
            CommMode::Encrypted => Self::Encrypted,
        }
    }
}


/// Wrap an outbound payload. `ins` takes part in MAC and CRC inputs but is
/// framed by the exchange engine, not here.
pub fn encode_request(ctx: &mut DesfireContext, ins: u8, payload: &[u8], mode: WrapMode) -> Result<Vec<u8>> {
    match ctx.secure_channel() {
        SecureChannel::None => Ok(payload.to_vec()),
        SecureChannel::D40 => d40_encode(ctx, payload, mode),
        SecureChannel::Ev1 => ev1_encode(ctx, ins, payload, mode),
        SecureChannel::Ev2 => ev2_encode(ctx, ins, payload, mode),
    }
}

/// Unwrap a reassembled response, verifying MAC/CRC where the channel calls
/// for it. A failed verification is an [`Error::Integrity`].
pub fn decode_response(ctx: &mut DesfireContext, status: Status, payload: Vec<u8>, mode: WrapMode) -> Result<Vec<u8>> {
    match ctx.secure_channel() {
        SecureChannel::None => Ok(payload),
        SecureChannel::D40 => d40_decode(ctx, payload, mode),
        SecureChannel::Ev1 => ev1_decode(ctx, status, payload, mode),
        SecureChannel::Ev2 => ev2_decode(ctx, status, payload, mode),
    }
}


/// Pad with `80 00 …` up to the next block boundary; data already aligned is
/// left alone.
fn pad_align(buf: &mut Vec<u8>, block_size: usize) {
    if buf.len() % block_size != 0 {
        let pos = buf.len();
        buf.resize(pos.next_multiple_of(block_size), 0x00);
        Iso7816::raw_pad(buf, pos);
    }
}

/// Pad with `80 00 …`, always adding at least one padding byte.
fn pad_always(buf: &mut Vec<u8>, block_size: usize) {
    let pos = buf.len();
    buf.resize((pos / block_size + 1) * block_size, 0x00);
    Iso7816::raw_pad(buf, pos);
}

/// Strip `80 00 …` padding appended by [`pad_always`].
fn strip_padding(buf: &mut Vec<u8>) -> Result<()> {
    while buf.last() == Some(&0x00) {
        buf.pop();
    }
    if buf.pop() != Some(0x80) {
        return Err(Error::Integrity);
    }
    Ok(())
}

fn is_valid_trailing_padding(tail: &[u8]) -> bool {
    match tail.iter().position(|&b| b != 0x00) {
        // zeros only (legacy zero padding)
        None => true,
        // `80 00 …` with optional leading zeros is not a thing; the 0x80
        // must come first
        Some(0) => tail[0] == 0x80 && tail[1..].iter().all(|&b| b == 0x00),
        Some(_) => false,
    }
}


// ---- d40 ----------------------------------------------------------------

/// Legacy 4-byte MAC: CBC-style decipher chaining over the zero-padded data,
/// first four bytes of the final block. The d40 channel starts every command
/// with a zero vector.
fn d40_mac(ctx: &mut DesfireContext, data: &[u8]) -> Zeroizing<Vec<u8>> {
    let cam = cipher_for(ctx.key_type);
    let block_size = cam.block_size();
    let key = Zeroizing::new(ctx.session_key_mac().to_vec());

    let mut buf = Zeroizing::new(data.to_vec());
    while buf.len() % block_size != 0 {
        buf.push(0x00);
    }
    let mut iv = Zeroizing::new(vec![0u8; block_size]);
    cam.encrypt_send(&key, &mut iv, &mut buf);
    Zeroizing::new(iv[..D40_MAC_LEN].to_vec())
}

fn d40_encrypt(ctx: &mut DesfireContext, mut buf: Vec<u8>) -> Result<Vec<u8>> {
    if buf.is_empty() {
        return Ok(buf);
    }
    let cam = cipher_for(ctx.key_type);
    let block_size = cam.block_size();
    let key = Zeroizing::new(ctx.session_key_enc().to_vec());

    while buf.len() % block_size != 0 {
        buf.push(0x00);
    }
    let mut iv = vec![0u8; block_size];
    cam.encrypt_send(&key, &mut iv, &mut buf);
    ctx.clear_iv();
    ctx.iv[..block_size].copy_from_slice(&iv);
    Ok(buf)
}

fn d40_encode(ctx: &mut DesfireContext, payload: &[u8], mode: WrapMode) -> Result<Vec<u8>> {
    match mode {
        WrapMode::Plain => Ok(payload.to_vec()),
        WrapMode::Mac => {
            if payload.is_empty() {
                return Ok(Vec::new());
            }
            let mac = d40_mac(ctx, payload);
            let mut out = payload.to_vec();
            out.extend_from_slice(&mac);
            Ok(out)
        },
        WrapMode::Encrypted => {
            if payload.is_empty() {
                return Ok(Vec::new());
            }
            let mut buf = payload.to_vec();
            buf.extend_from_slice(&crc16(payload));
            d40_encrypt(ctx, buf)
        },
        WrapMode::EncryptedRaw { plain_header } => {
            let (header, rest) = payload.split_at(plain_header.min(payload.len()));
            let mut out = header.to_vec();
            out.extend(d40_encrypt(ctx, rest.to_vec())?);
            Ok(out)
        },
    }
}

fn d40_decode(ctx: &mut DesfireContext, mut payload: Vec<u8>, mode: WrapMode) -> Result<Vec<u8>> {
    match mode {
        WrapMode::Plain => Ok(payload),
        WrapMode::Mac => {
            if payload.is_empty() {
                return Ok(payload);
            }
            if payload.len() < D40_MAC_LEN {
                return Err(Error::Integrity);
            }
            let data_len = payload.len() - D40_MAC_LEN;
            let expected = d40_mac(ctx, &payload[..data_len]);
            let matches: bool = payload[data_len..].ct_eq(&expected).into();
            if !matches {
                return Err(Error::Integrity);
            }
            payload.truncate(data_len);
            Ok(payload)
        },
        WrapMode::Encrypted|WrapMode::EncryptedRaw { .. } => {
            if payload.is_empty() {
                return Ok(payload);
            }
            let cam = cipher_for(ctx.key_type);
            let block_size = cam.block_size();
            if payload.len() % block_size != 0 {
                return Err(Error::Integrity);
            }
            let key = Zeroizing::new(ctx.session_key_enc().to_vec());
            let mut iv = vec![0u8; block_size];
            cam.decrypt_cbc(&key, &mut iv, &mut payload);

            // locate data || CRC16(data) || zero padding
            for data_len in (0..=payload.len() - 2).rev() {
                if payload[data_len..data_len + 2] == crc16(&payload[..data_len])
                        && is_valid_trailing_padding(&payload[data_len + 2..]) {
                    payload.truncate(data_len);
                    return Ok(payload);
                }
            }
            Err(Error::Integrity)
        },
    }
}


// ---- EV1 ----------------------------------------------------------------

/// The EV1 CMAC discipline: a CMAC chained through the session IV. The final
/// block doubles as the new IV, keeping host and card vectors in sync across
/// commands of any communication mode.
fn ev1_cmac(ctx: &mut DesfireContext, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
    let cam = cipher_for(ctx.key_type);
    let block_size = cam.block_size();
    let key = Zeroizing::new(ctx.session_key_mac().to_vec());
    let (k1, k2) = cam.cmac_subkeys(&key);

    let mut buf = Zeroizing::new(parts.concat());
    let aligned = !buf.is_empty() && buf.len() % block_size == 0;
    if aligned {
        let at = buf.len() - block_size;
        xor_in_place(&mut buf[at..], &k1);
    } else {
        pad_always(&mut buf, block_size);
        let at = buf.len() - block_size;
        xor_in_place(&mut buf[at..], &k2);
    }

    let mut iv = Zeroizing::new(ctx.iv[..block_size].to_vec());
    cam.encrypt_cbc(&key, &mut iv, &mut buf);
    ctx.iv[..block_size].copy_from_slice(&iv);
    Zeroizing::new(iv.to_vec())
}

fn ev1_encode(ctx: &mut DesfireContext, ins: u8, payload: &[u8], mode: WrapMode) -> Result<Vec<u8>> {
    match mode {
        WrapMode::Plain => {
            ev1_cmac(ctx, &[&[ins], payload]);
            Ok(payload.to_vec())
        },
        WrapMode::Mac => {
            let mac = ev1_cmac(ctx, &[&[ins], payload]);
            let mut out = payload.to_vec();
            out.extend_from_slice(&mac[..CMAC_LEN]);
            Ok(out)
        },
        WrapMode::Encrypted => {
            let mut buf = payload.to_vec();
            buf.extend_from_slice(&crc32_parts(&[&[ins], payload]));
            ev1_encrypt(ctx, buf)
        },
        WrapMode::EncryptedRaw { plain_header } => {
            let (header, rest) = payload.split_at(plain_header.min(payload.len()));
            let mut out = header.to_vec();
            out.extend(ev1_encrypt(ctx, rest.to_vec())?);
            Ok(out)
        },
    }
}

fn ev1_encrypt(ctx: &mut DesfireContext, mut buf: Vec<u8>) -> Result<Vec<u8>> {
    if buf.is_empty() {
        return Ok(buf);
    }
    let cam = cipher_for(ctx.key_type);
    let block_size = cam.block_size();
    let key = Zeroizing::new(ctx.session_key_enc().to_vec());

    pad_align(&mut buf, block_size);
    let mut iv = ctx.iv[..block_size].to_vec();
    cam.encrypt_cbc(&key, &mut iv, &mut buf);
    ctx.iv[..block_size].copy_from_slice(&iv);
    Ok(buf)
}

fn ev1_decode(ctx: &mut DesfireContext, status: Status, mut payload: Vec<u8>, mode: WrapMode) -> Result<Vec<u8>> {
    match mode {
        WrapMode::Plain => {
            // the card chains its vector over every response; stay in sync
            ev1_cmac(ctx, &[&payload, &[status.to_byte()]]);
            Ok(payload)
        },
        WrapMode::Mac => {
            if payload.len() < CMAC_LEN {
                return Err(Error::Integrity);
            }
            let data_len = payload.len() - CMAC_LEN;
            let expected = ev1_cmac(ctx, &[&payload[..data_len], &[status.to_byte()]]);
            let matches: bool = payload[data_len..].ct_eq(&expected[..CMAC_LEN]).into();
            if !matches {
                return Err(Error::Integrity);
            }
            payload.truncate(data_len);
            Ok(payload)
        },
        WrapMode::Encrypted|WrapMode::EncryptedRaw { .. } => {
            if payload.is_empty() {
                return Ok(payload);
            }
            let cam = cipher_for(ctx.key_type);
            let block_size = cam.block_size();
            if payload.len() % block_size != 0 {
                return Err(Error::Integrity);
            }
            let key = Zeroizing::new(ctx.session_key_enc().to_vec());
            let mut iv = ctx.iv[..block_size].to_vec();
            cam.decrypt_cbc(&key, &mut iv, &mut payload);
            ctx.iv[..block_size].copy_from_slice(&iv);

            // locate data || CRC32(data || status) || padding
            for data_len in (0..=payload.len() - 4).rev() {
                let crc = crc32_parts(&[&payload[..data_len], &[status.to_byte()]]);
                if payload[data_len..data_len + 4] == crc
                        && is_valid_trailing_padding(&payload[data_len + 4..]) {
                    payload.truncate(data_len);
                    return Ok(payload);
                }
            }
            Err(Error::Integrity)
        },
    }
}


// ---- EV2 ----------------------------------------------------------------

/// Truncated EV2 MAC: the odd-indexed bytes of the full AES-CMAC.
fn ev2_mac(ctx: &DesfireContext, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
    let cam = cipher_for(ctx.key_type);
    let key = Zeroizing::new(ctx.session_key_mac().to_vec());
    let data = Zeroizing::new(parts.concat());
    let full = cam.cmac(&key, &data);
    Zeroizing::new(full.iter().skip(1).step_by(2).copied().collect())
}

/// Session IV derivation: `E(K_enc, label || TI || LE16(cntr) || 00…)` with
/// label `A5 5A` for commands and `5A A5` for responses.
fn ev2_iv(ctx: &DesfireContext, label: [u8; 2], cntr: u16) -> Zeroizing<Vec<u8>> {
    let cam = cipher_for(ctx.key_type);
    let key = Zeroizing::new(ctx.session_key_enc().to_vec());
    let mut block = Zeroizing::new(vec![0u8; 16]);
    block[0..2].copy_from_slice(&label);
    block[2..6].copy_from_slice(&ctx.ti);
    block[6..8].copy_from_slice(&cntr.to_le_bytes());
    cam.encrypt_block(&key, &mut block);
    block
}

fn ev2_encode(ctx: &mut DesfireContext, ins: u8, payload: &[u8], mode: WrapMode) -> Result<Vec<u8>> {
    let cntr = ctx.cmd_cntr.to_le_bytes();
    let ti = ctx.ti;
    match mode {
        WrapMode::Plain => Ok(payload.to_vec()),
        WrapMode::Mac => {
            let mac = ev2_mac(ctx, &[&[ins], &cntr, &ti, payload]);
            let mut out = payload.to_vec();
            out.extend_from_slice(&mac);
            Ok(out)
        },
        WrapMode::Encrypted|WrapMode::EncryptedRaw { .. } => {
            let plain_header = match mode {
                WrapMode::EncryptedRaw { plain_header } => plain_header.min(payload.len()),
                _ => 0,
            };
            let (header, rest) = payload.split_at(plain_header);

            let mut buf = rest.to_vec();
            if !buf.is_empty() {
                let cam = cipher_for(ctx.key_type);
                let key = Zeroizing::new(ctx.session_key_enc().to_vec());
                pad_always(&mut buf, cam.block_size());
                let mut iv = ev2_iv(ctx, [0xA5, 0x5A], ctx.cmd_cntr);
                cam.encrypt_cbc(&key, &mut iv, &mut buf);
            }

            let mac = ev2_mac(ctx, &[&[ins], &cntr, &ti, header, &buf]);
            let mut out = header.to_vec();
            out.extend_from_slice(&buf);
            out.extend_from_slice(&mac);
            Ok(out)
        },
    }
}

fn ev2_decode(ctx: &mut DesfireContext, status: Status, mut payload: Vec<u8>, mode: WrapMode) -> Result<Vec<u8>> {
    // one authenticated command counts once, both directions included; the
    // response is bound to the incremented counter
    let resp_cntr = ctx.cmd_cntr.wrapping_add(1);
    let cntr = resp_cntr.to_le_bytes();
    let ti = ctx.ti;
    match mode {
        WrapMode::Plain => {
            ctx.cmd_cntr = resp_cntr;
            Ok(payload)
        },
        WrapMode::Mac => {
            if payload.len() < CMAC_LEN {
                return Err(Error::Integrity);
            }
            let data_len = payload.len() - CMAC_LEN;
            let expected = ev2_mac(ctx, &[&[status.to_byte()], &cntr, &ti, &payload[..data_len]]);
            let matches: bool = payload[data_len..].ct_eq(&expected).into();
            if !matches {
                return Err(Error::Integrity);
            }
            ctx.cmd_cntr = resp_cntr;
            payload.truncate(data_len);
            Ok(payload)
        },
        WrapMode::Encrypted|WrapMode::EncryptedRaw { .. } => {
            if payload.len() < CMAC_LEN {
                return Err(Error::Integrity);
            }
            let data_len = payload.len() - CMAC_LEN;
            let expected = ev2_mac(ctx, &[&[status.to_byte()], &cntr, &ti, &payload[..data_len]]);
            let matches: bool = payload[data_len..].ct_eq(&expected).into();
            if !matches {
                return Err(Error::Integrity);
            }
            payload.truncate(data_len);

            if !payload.is_empty() {
                let cam = cipher_for(ctx.key_type);
                if payload.len() % cam.block_size() != 0 {
                    return Err(Error::Integrity);
                }
                let key = Zeroizing::new(ctx.session_key_enc().to_vec());
                let mut iv = ev2_iv(ctx, [0x5A, 0xA5], resp_cntr);
                cam.decrypt_cbc(&key, &mut iv, &mut payload);
                strip_padding(&mut payload)?;
            }
            ctx.cmd_cntr = resp_cntr;
            Ok(payload)
        },
    }
}


#[cfg(test)]
pub(crate) mod testing {
    //! Card-side response building for tests: the mirror image of
    //! [`decode_response`], driven on a context that tracks the card's view
    //! of the session.

    use super::*;

    pub fn wrap_response(ctx: &mut DesfireContext, status: Status, data: &[u8], mode: WrapMode) -> Vec<u8> {
        match ctx.secure_channel() {
            SecureChannel::Ev1 => ev1_wrap_response(ctx, status, data, mode),
            SecureChannel::Ev2 => ev2_wrap_response(ctx, status, data, mode),
            _ => data.to_vec(),
        }
    }

    fn ev1_wrap_response(ctx: &mut DesfireContext, status: Status, data: &[u8], mode: WrapMode) -> Vec<u8> {
        match mode {
            WrapMode::Plain => {
                ev1_cmac(ctx, &[data, &[status.to_byte()]]);
                data.to_vec()
            },
            WrapMode::Mac => {
                let mac = ev1_cmac(ctx, &[data, &[status.to_byte()]]);
                let mut out = data.to_vec();
                out.extend_from_slice(&mac[..CMAC_LEN]);
                out
            },
            WrapMode::Encrypted|WrapMode::EncryptedRaw { .. } => {
                if data.is_empty() {
                    return Vec::new();
                }
                let cam = cipher_for(ctx.key_type);
                let block_size = cam.block_size();
                let key = ctx.session_key_enc().to_vec();
                let mut buf = data.to_vec();
                buf.extend_from_slice(&crc32_parts(&[data, &[status.to_byte()]]));
                pad_align(&mut buf, block_size);
                let mut iv = ctx.iv[..block_size].to_vec();
                cam.encrypt_cbc(&key, &mut iv, &mut buf);
                ctx.iv[..block_size].copy_from_slice(&iv);
                buf
            },
        }
    }

    fn ev2_wrap_response(ctx: &mut DesfireContext, status: Status, data: &[u8], mode: WrapMode) -> Vec<u8> {
        let resp_cntr = ctx.cmd_cntr.wrapping_add(1);
        let cntr = resp_cntr.to_le_bytes();
        let ti = ctx.ti;
        let out = match mode {
            WrapMode::Plain => data.to_vec(),
            WrapMode::Mac => {
                let mac = ev2_mac(ctx, &[&[status.to_byte()], &cntr, &ti, data]);
                let mut out = data.to_vec();
                out.extend_from_slice(&mac);
                out
            },
            WrapMode::Encrypted|WrapMode::EncryptedRaw { .. } => {
                let cam = cipher_for(ctx.key_type);
                let key = ctx.session_key_enc().to_vec();
                let mut buf = data.to_vec();
                if !buf.is_empty() {
                    pad_always(&mut buf, cam.block_size());
                    let mut iv = ev2_iv(ctx, [0x5A, 0xA5], resp_cntr);
                    cam.encrypt_cbc(&key, &mut iv, &mut buf);
                }
                let mac = ev2_mac(ctx, &[&[status.to_byte()], &cntr, &ti, &buf]);
                buf.extend_from_slice(&mac);
                buf
            },
        };
        ctx.cmd_cntr = resp_cntr;
        out
    }
}
