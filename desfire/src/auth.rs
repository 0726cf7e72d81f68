//! The three DESFire authentication protocols: legacy d40, EV1 ISO and EV2
//! first/non-first, plus the ISO 7816 external/internal authenticate flow.
//!
//! Every handshake runs over a cleared channel and installs the new session
//! only once the card's rotated nonce verifies; a failure at any step leaves
//! no partial session behind.


use rand::rngs::OsRng;
use rand::RngCore;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::commands::{self, ins};
use crate::context::{CommandSet, DesfireContext, KdfAlgo, SecureChannel};
use crate::crypt::cipher_mac::{cipher_for, CipherAndMac};
use crate::crypt::kdf::diversify_an10922;
use crate::crypt::{collapse_des_session_key, rol8, KeyType};
use crate::error::{Error, Result};
use crate::exchange::{exchange_ex, ExchangeOpts};
use crate::iso7816;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::iso7816::card::SmartCard;
use crate::status::Status;


/// Authenticate the context's key over the given secure-channel generation.
///
/// The protocol is selected by `(command_set, channel)`; EV2 performs a
/// first-auth when no session is active and a non-first re-authentication
/// otherwise.
#[instrument(skip(ctx))]
pub fn authenticate(ctx: &mut DesfireContext, channel: SecureChannel) -> Result<()> {
    let mut rnd_a = Zeroizing::new([0u8; 16]);
    let mut rnd_h2 = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut *rnd_a);
    OsRng.fill_bytes(&mut *rnd_h2);
    authenticate_with_nonces(ctx, channel, &rnd_a, &rnd_h2)
}

/// Select an application and authenticate against it.
pub fn select_and_authenticate(ctx: &mut DesfireContext, channel: SecureChannel, aid: u32) -> Result<()> {
    select_and_authenticate_ex(ctx, channel, aid, false)
}

pub fn select_and_authenticate_ex(ctx: &mut DesfireContext, channel: SecureChannel, aid: u32, no_auth: bool) -> Result<()> {
    // the plain ISO command set cannot carry the native select
    let iso_switch = ctx.command_set == CommandSet::Iso;
    if iso_switch {
        ctx.command_set = CommandSet::NativeIso;
    }
    let selected = commands::select_application(ctx, aid);
    if iso_switch {
        ctx.command_set = CommandSet::Iso;
    }
    if selected.is_err() {
        return Err(Error::Auth(200));
    }

    if !no_auth {
        authenticate(ctx, channel)?;
        if channel != SecureChannel::None && !ctx.is_authenticated() {
            return Err(Error::Auth(201));
        }
    }
    Ok(())
}

/// Deterministic-nonce variant of [`authenticate`]; the handshakes consume
/// `rnd_a` (truncated to the challenge length) and the ISO flow additionally
/// uses `rnd_h2` for INTERNAL AUTHENTICATE.
pub(crate) fn authenticate_with_nonces(
    ctx: &mut DesfireContext,
    channel: SecureChannel,
    rnd_a: &[u8; 16],
    rnd_h2: &[u8; 16],
) -> Result<()> {
    let result = if ctx.command_set == CommandSet::Iso && channel != SecureChannel::Ev2 {
        authenticate_iso(ctx, channel, rnd_a, rnd_h2)
    } else {
        match channel {
            SecureChannel::None => {
                ctx.clear_session();
                return Ok(());
            },
            SecureChannel::D40|SecureChannel::Ev1 => authenticate_legacy(ctx, channel, rnd_a),
            SecureChannel::Ev2 => {
                let first = !ctx.is_authenticated();
                authenticate_ev2(ctx, first, rnd_a)
            },
        }
    };
    if result.is_err() {
        ctx.clear_session();
    }
    result
}


/// The key the handshake actually runs with: the slot key, possibly
/// diversified first.
fn working_key(ctx: &DesfireContext) -> Result<Zeroizing<Vec<u8>>> {
    match ctx.kdf_algo {
        KdfAlgo::None => Ok(Zeroizing::new(ctx.key().to_vec())),
        KdfAlgo::An10922 => diversify_an10922(ctx.key_type, ctx.key(), ctx.kdf_input()),
        KdfAlgo::Gallagher => {
            // AN10922 over the Gallagher 11-byte input; deriving that input
            // from card data is up to the caller
            let input = ctx.kdf_input();
            let input = &input[..input.len().min(11)];
            diversify_an10922(ctx.key_type, ctx.key(), input)
        },
    }
}

/// Session-key layout shared by the d40, EV1 and ISO flows.
fn derive_session_key_legacy(rnd_a: &[u8], rnd_b: &[u8], key_type: KeyType, session_key: &mut [u8]) {
    session_key[0..4].copy_from_slice(&rnd_a[0..4]);
    session_key[4..8].copy_from_slice(&rnd_b[0..4]);
    match key_type {
        KeyType::Des => {},
        KeyType::TwoTdea => {
            session_key[8..12].copy_from_slice(&rnd_a[4..8]);
            session_key[12..16].copy_from_slice(&rnd_b[4..8]);
        },
        KeyType::ThreeTdea => {
            session_key[8..12].copy_from_slice(&rnd_a[6..10]);
            session_key[12..16].copy_from_slice(&rnd_b[6..10]);
            session_key[16..20].copy_from_slice(&rnd_a[12..16]);
            session_key[20..24].copy_from_slice(&rnd_b[12..16]);
        },
        KeyType::Aes => {
            session_key[8..12].copy_from_slice(&rnd_a[12..16]);
            session_key[12..16].copy_from_slice(&rnd_b[12..16]);
        },
    }
}

/// EV2 session-key derivation: AES-CMAC of the SV1/SV2 vectors under the
/// authentication key.
fn derive_session_keys_ev2(key: &[u8], rnd_a: &[u8], rnd_b: &[u8], enc_out: &mut [u8], mac_out: &mut [u8]) {
    let cam = cipher_for(KeyType::Aes);
    let mut sv = Zeroizing::new([0u8; 32]);
    sv[2..6].copy_from_slice(&[0x00, 0x01, 0x00, 0x80]);
    sv[6..8].copy_from_slice(&rnd_a[0..2]);
    for i in 0..6 {
        sv[8 + i] = rnd_a[2 + i] ^ rnd_b[i];
    }
    sv[14..24].copy_from_slice(&rnd_b[6..16]);
    sv[24..32].copy_from_slice(&rnd_a[8..16]);

    sv[0..2].copy_from_slice(&[0xA5, 0x5A]);
    enc_out.copy_from_slice(&cam.cmac(key, sv.as_ref())[..16]);

    sv[0..2].copy_from_slice(&[0x5A, 0xA5]);
    mac_out.copy_from_slice(&cam.cmac(key, sv.as_ref())[..16]);
}


fn authenticate_legacy(ctx: &mut DesfireContext, channel: SecureChannel, rnd_a_full: &[u8; 16]) -> Result<()> {
    ctx.clear_session();

    let key = working_key(ctx)?;
    let key_type = ctx.key_type;
    let cam = cipher_for(key_type);
    let rnd_len = key_type.challenge_length();
    let block_size = cam.block_size();

    let subcommand = match (channel, key_type) {
        (SecureChannel::Ev1, KeyType::Aes) => ins::AUTHENTICATE_AES,
        (SecureChannel::Ev1, _) => ins::AUTHENTICATE_ISO,
        _ => ins::AUTHENTICATE,
    };

    let opts = ExchangeOpts { enable_chaining: false, ..Default::default() };
    let key_num = ctx.key_num;
    let (status, enc_rnd_b) = exchange_ex(ctx, subcommand, &[key_num], opts)
        .map_err(|_| Error::Auth(1))?;
    if enc_rnd_b.is_empty() {
        return Err(Error::Auth(2));
    }
    if status != Status::AdditionalFrame {
        return Err(Error::Auth(3));
    }
    if enc_rnd_b.len() != rnd_len {
        return Err(Error::Auth(4));
    }

    // decrypt the card's challenge; the chaining vector carries through the
    // whole handshake
    let mut iv = Zeroizing::new(vec![0u8; block_size]);
    let mut rnd_b = Zeroizing::new(enc_rnd_b);
    if channel == SecureChannel::D40 && key_type == KeyType::Des {
        cam.decrypt_block(&key, &mut rnd_b);
    } else {
        cam.decrypt_cbc(&key, &mut iv, &mut rnd_b);
    }

    let mut rot_rnd_b = Zeroizing::new(rnd_b.to_vec());
    rol8(&mut rot_rnd_b);

    let rnd_a = &rnd_a_full[..rnd_len];
    let mut both = Zeroizing::new(Vec::with_capacity(rnd_len * 2));
    match channel {
        SecureChannel::D40 => {
            // legacy direction: two separate decipher steps, chained by hand
            let mut enc_rnd_a = Zeroizing::new(rnd_a.to_vec());
            cam.decrypt_block(&key, &mut enc_rnd_a);
            both.extend_from_slice(&enc_rnd_a);

            for (rot, enc) in rot_rnd_b.iter_mut().zip(enc_rnd_a.iter()) {
                *rot ^= *enc;
            }
            let mut enc_rnd_b2 = Zeroizing::new(rot_rnd_b.to_vec());
            cam.decrypt_block(&key, &mut enc_rnd_b2);
            both.extend_from_slice(&enc_rnd_b2);
        },
        _ => {
            both.extend_from_slice(rnd_a);
            both.extend_from_slice(&rot_rnd_b);
            cam.encrypt_cbc(&key, &mut iv, &mut both);
        },
    }

    let (status, enc_rnd_a_card) = exchange_ex(ctx, ins::ADDITIONAL_FRAME, &both, opts)
        .map_err(|_| Error::Auth(7))?;
    if enc_rnd_a_card.is_empty() {
        return Err(Error::Auth(8));
    }
    if status != Status::OperationOk {
        return Err(Error::Auth(9));
    }
    if enc_rnd_a_card.len() != rnd_len {
        return Err(Error::Auth(4));
    }

    let mut verify = Zeroizing::new(enc_rnd_a_card);
    if channel == SecureChannel::D40 {
        // legacy fall-through: a bare block decipherment, no vector applied
        cam.decrypt_block(&key, &mut verify);
    } else {
        cam.decrypt_cbc(&key, &mut iv, &mut verify);
    }

    let mut expected = Zeroizing::new(rnd_a.to_vec());
    rol8(&mut expected);
    if verify[..] != expected[..] {
        return Err(Error::Auth(11));
    }

    let sk_len = key_type.session_key_length();
    let mut session_key = Zeroizing::new(vec![0u8; sk_len]);
    derive_session_key_legacy(rnd_a, &rnd_b, key_type, &mut session_key);
    if key_type == KeyType::TwoTdea {
        collapse_des_session_key(&key, &mut session_key);
    }

    ctx.session_key_enc[..sk_len].copy_from_slice(&session_key);
    ctx.session_key_mac[..sk_len].copy_from_slice(&session_key);
    ctx.clear_iv();
    ctx.secure_channel = channel;
    Ok(())
}


fn authenticate_ev2(ctx: &mut DesfireContext, first: bool, rnd_a: &[u8; 16]) -> Result<()> {
    if ctx.key_type != KeyType::Aes {
        return Err(Error::InvalidArgument("EV2 authentication requires an AES key"));
    }

    let key = working_key(ctx)?;
    let cam = cipher_for(KeyType::Aes);

    // the handshake itself travels plain; a non-first re-authentication
    // keeps TI and the command counter alive
    ctx.secure_channel = SecureChannel::None;

    let subcommand = if first { ins::AUTHENTICATE_EV2_FIRST } else { ins::AUTHENTICATE_EV2_NON_FIRST };
    let key_num = ctx.key_num;
    let payload: &[u8] = if first { &[key_num, 0x00] } else { &[key_num] };

    let opts = ExchangeOpts { enable_chaining: false, ..Default::default() };
    let (status, enc_rnd_b) = exchange_ex(ctx, subcommand, payload, opts)
        .map_err(|_| Error::Auth(1))?;
    if enc_rnd_b.is_empty() {
        return Err(Error::Auth(2));
    }
    if status != Status::AdditionalFrame {
        return Err(Error::Auth(3));
    }
    if enc_rnd_b.len() != 16 {
        return Err(Error::Auth(4));
    }

    let mut rnd_b = Zeroizing::new(enc_rnd_b);
    let mut iv = Zeroizing::new(vec![0u8; 16]);
    cam.decrypt_cbc(&key, &mut iv, &mut rnd_b);

    let mut rot_rnd_b = Zeroizing::new(rnd_b.to_vec());
    rol8(&mut rot_rnd_b);

    let mut both = Zeroizing::new(Vec::with_capacity(32));
    both.extend_from_slice(rnd_a);
    both.extend_from_slice(&rot_rnd_b);
    let mut iv = Zeroizing::new(vec![0u8; 16]);
    cam.encrypt_cbc(&key, &mut iv, &mut both);

    let (status, enc_card) = exchange_ex(ctx, ins::ADDITIONAL_FRAME, &both, opts)
        .map_err(|_| Error::Auth(7))?;
    if enc_card.is_empty() {
        return Err(Error::Auth(8));
    }
    if status != Status::OperationOk {
        return Err(Error::Auth(9));
    }
    let expected_len = if first { 32 } else { 16 };
    if enc_card.len() != expected_len {
        return Err(Error::Auth(4));
    }

    let mut data = Zeroizing::new(enc_card);
    let mut iv = Zeroizing::new(vec![0u8; 16]);
    cam.decrypt_cbc(&key, &mut iv, &mut data);

    let mut expected = Zeroizing::new(rnd_a.to_vec());
    rol8(&mut expected);
    let card_rnd_a = if first { &data[4..20] } else { &data[0..16] };
    if card_rnd_a != &expected[..] {
        return Err(Error::Auth(11));
    }

    if first {
        // data = TI(4) || RndA'(16) || PDcap(6) || PCDcap(6)
        ctx.cmd_cntr = 0;
        ctx.ti.copy_from_slice(&data[0..4]);
    }
    derive_session_keys_ev2(&key, rnd_a, &rnd_b, &mut ctx.session_key_enc[..16], &mut ctx.session_key_mac[..16]);
    ctx.clear_iv();
    ctx.secure_channel = SecureChannel::Ev2;
    Ok(())
}


/// Algorithm tag carried in P1 of the ISO authenticate commands.
fn iso_key_algo(key_type: KeyType) -> u8 {
    match key_type {
        KeyType::Des|KeyType::TwoTdea => 0x02,
        KeyType::ThreeTdea => 0x04,
        KeyType::Aes => 0x09,
    }
}

fn authenticate_iso(ctx: &mut DesfireContext, channel: SecureChannel, rnd_a_full: &[u8; 16], rnd_h2_full: &[u8; 16]) -> Result<()> {
    ctx.clear_session();

    let key = working_key(ctx)?;
    let key_type = ctx.key_type;
    let cam = cipher_for(key_type);
    let rnd_len = key_type.challenge_length();

    // GET CHALLENGE
    let get_challenge = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: iso7816::INS_GET_CHALLENGE,
            p1: 0x00,
            p2: 0x00,
        },
        data: Data::ResponseData { response_data_length: rnd_len as u8 },
    };
    let response = ctx.card_mut().exchange_apdu(&get_challenge, false)
        .map_err(|_| Error::Auth(301))?;
    if response.trailer.to_word() != 0x9000 {
        return Err(Error::Auth(301));
    }
    if response.data.len() != rnd_len {
        return Err(Error::Auth(302));
    }
    let picc_rnd = Zeroizing::new(response.data);

    // encrypt host nonce || card nonce; the vector chains into the
    // internal-authenticate decryption below
    let mut both = Zeroizing::new(Vec::with_capacity(rnd_len * 2));
    both.extend_from_slice(&rnd_a_full[..rnd_len]);
    both.extend_from_slice(&picc_rnd);
    let mut iv = Zeroizing::new(vec![0u8; cam.block_size()]);
    cam.encrypt_cbc(&key, &mut iv, &mut both);

    let p1 = iso_key_algo(key_type);
    let p2 = (if ctx.app_selected { 0x80 } else { 0x00 }) | ctx.key_num;

    // EXTERNAL AUTHENTICATE
    let external_auth = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: iso7816::INS_EXTERNAL_AUTHENTICATE,
            p1,
            p2,
        },
        data: Data::RequestData { request_data: both.to_vec() },
    };
    let response = ctx.card_mut().exchange_apdu(&external_auth, false)
        .map_err(|_| Error::Auth(304))?;
    if response.trailer.to_word() != 0x9000 {
        return Err(Error::Auth(304));
    }

    // INTERNAL AUTHENTICATE with the second host nonce
    let internal_auth = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: iso7816::INS_INTERNAL_AUTHENTICATE,
            p1,
            p2,
        },
        data: Data::BothData {
            request_data: rnd_h2_full[..rnd_len].to_vec(),
            response_data_length: (rnd_len * 2) as u8,
        },
    };
    let response = ctx.card_mut().exchange_apdu(&internal_auth, false)
        .map_err(|_| Error::Auth(305))?;
    if response.trailer.to_word() != 0x9000 {
        return Err(Error::Auth(305));
    }
    if response.data.len() != rnd_len * 2 {
        return Err(Error::Auth(306));
    }

    let mut picc_rnd2 = Zeroizing::new(response.data);
    cam.decrypt_cbc(&key, &mut iv, &mut picc_rnd2);

    if picc_rnd2[rnd_len..] != rnd_h2_full[..rnd_len] {
        return Err(Error::Auth(308));
    }

    let sk_len = key_type.session_key_length();
    let mut session_key = Zeroizing::new(vec![0u8; sk_len]);
    derive_session_key_legacy(&rnd_a_full[..rnd_len], &picc_rnd2, key_type, &mut session_key);
    if key_type == KeyType::TwoTdea {
        collapse_des_session_key(&key, &mut session_key);
    }

    ctx.session_key_enc[..sk_len].copy_from_slice(&session_key);
    ctx.session_key_mac[..sk_len].copy_from_slice(&session_key);
    ctx.clear_iv();
    ctx.secure_channel = channel;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::cipher_mac::{CamAes128, CamDes, CipherAndMac};
    use crate::iso7816::card::testing::{Exchange, ScriptedCard};
    use hex_literal::hex;

    /// The fixed host nonce used throughout the scenario tests.
    const RND_A: [u8; 16] = hex!("01020304050607080910111213141516");

    fn context(script: Vec<Exchange>, key_type: KeyType, key: &[u8]) -> DesfireContext {
        let card = Box::new(ScriptedCard::new(script));
        DesfireContext::new(card, 0, key_type, key).unwrap()
    }

    /// EV1 AES against a zero key and an all-zero card challenge.
    #[test]
    fn test_authenticate_ev1_aes_zero_key() {
        let key = [0u8; 16];
        let rnd_b = [0u8; 16];

        // card sends E(RndB) under a zero vector
        let mut enc_rnd_b = rnd_b;
        let mut iv = [0u8; 16];
        CamAes128.encrypt_cbc(&key, &mut iv, &mut enc_rnd_b);

        // host answers E(RndA || RndB') chained off that ciphertext
        let mut rot_rnd_b = rnd_b;
        crate::crypt::rol8(&mut rot_rnd_b);
        let mut both = [0u8; 32];
        both[..16].copy_from_slice(&RND_A);
        both[16..].copy_from_slice(&rot_rnd_b);
        CamAes128.encrypt_cbc(&key, &mut iv, &mut both);

        // card closes with E(RndA') chained off the host's last block
        let mut enc_rnd_a = RND_A;
        crate::crypt::rol8(&mut enc_rnd_a);
        CamAes128.encrypt_cbc(&key, &mut iv, &mut enc_rnd_a);

        let mut expected_frame2 = vec![0xAF];
        expected_frame2.extend_from_slice(&both);

        let mut ctx = context(vec![
            ScriptedCard::native(vec![0xAA, 0x00], 0xAF, enc_rnd_b.to_vec()),
            ScriptedCard::native(expected_frame2, 0x00, enc_rnd_a.to_vec()),
        ], KeyType::Aes, &key);

        authenticate_with_nonces(&mut ctx, SecureChannel::Ev1, &RND_A, &RND_A).unwrap();

        assert_eq!(ctx.secure_channel(), SecureChannel::Ev1);
        assert_eq!(
            ctx.session_key_enc(),
            hex!("01020304000000001314151600000000"),
        );
        assert_eq!(ctx.session_key_mac(), ctx.session_key_enc[..16].to_vec());
        assert_eq!(ctx.iv, [0u8; 16]);
    }

    /// Legacy d40 with a single-DES zero key.
    #[test]
    fn test_authenticate_d40_des_zero_key() {
        let key = [0u8; 8];
        let rnd_b = [0u8; 8];

        // card sends E(RndB)
        let mut enc_rnd_b = rnd_b;
        CamDes.encrypt_block(&key, &mut enc_rnd_b);

        // host answers D(RndA) || D(RndB' xor D(RndA))
        let mut enc_rnd_a = [0u8; 8];
        enc_rnd_a.copy_from_slice(&RND_A[..8]);
        CamDes.decrypt_block(&key, &mut enc_rnd_a);
        let mut rot_rnd_b = rnd_b;
        crate::crypt::rol8(&mut rot_rnd_b);
        for (rot, enc) in rot_rnd_b.iter_mut().zip(enc_rnd_a.iter()) {
            *rot ^= *enc;
        }
        let mut second = rot_rnd_b;
        CamDes.decrypt_block(&key, &mut second);

        let mut expected_frame2 = vec![0xAF];
        expected_frame2.extend_from_slice(&enc_rnd_a);
        expected_frame2.extend_from_slice(&second);

        // card closes with E(RndA'), which the host deciphers raw
        let mut card_rnd_a = [0u8; 8];
        card_rnd_a.copy_from_slice(&RND_A[..8]);
        crate::crypt::rol8(&mut card_rnd_a);
        CamDes.encrypt_block(&key, &mut card_rnd_a);

        let mut ctx = context(vec![
            ScriptedCard::native(vec![0x0A, 0x00], 0xAF, enc_rnd_b.to_vec()),
            ScriptedCard::native(expected_frame2, 0x00, card_rnd_a.to_vec()),
        ], KeyType::Des, &key);

        authenticate_with_nonces(&mut ctx, SecureChannel::D40, &RND_A, &RND_A).unwrap();

        assert_eq!(ctx.secure_channel(), SecureChannel::D40);
        assert_eq!(ctx.session_key_enc(), hex!("0102030400000000"));
    }

    /// EV2 first-auth against a zero key: TI is captured and the counter
    /// starts at zero.
    #[test]
    fn test_authenticate_ev2_first_zero_key() {
        let key = [0u8; 16];
        let rnd_b = [0u8; 16];
        let ti = hex!("11223344");

        let mut enc_rnd_b = rnd_b;
        let mut iv = [0u8; 16];
        CamAes128.encrypt_cbc(&key, &mut iv, &mut enc_rnd_b);

        // host part: E(RndA || RndB') under a zero vector
        let mut rot_rnd_b = rnd_b;
        crate::crypt::rol8(&mut rot_rnd_b);
        let mut both = [0u8; 32];
        both[..16].copy_from_slice(&RND_A);
        both[16..].copy_from_slice(&rot_rnd_b);
        let mut iv = [0u8; 16];
        CamAes128.encrypt_cbc(&key, &mut iv, &mut both);

        // card part: E(TI || RndA' || PDcap || PCDcap) under a zero vector
        let mut blob = [0u8; 32];
        blob[0..4].copy_from_slice(&ti);
        let mut rot_rnd_a = RND_A;
        crate::crypt::rol8(&mut rot_rnd_a);
        blob[4..20].copy_from_slice(&rot_rnd_a);
        let mut iv = [0u8; 16];
        CamAes128.encrypt_cbc(&key, &mut iv, &mut blob);

        let mut expected_frame2 = vec![0xAF];
        expected_frame2.extend_from_slice(&both);

        let mut ctx = context(vec![
            ScriptedCard::native(vec![0x71, 0x00, 0x00], 0xAF, enc_rnd_b.to_vec()),
            ScriptedCard::native(expected_frame2, 0x00, blob.to_vec()),
        ], KeyType::Aes, &key);

        authenticate_with_nonces(&mut ctx, SecureChannel::Ev2, &RND_A, &RND_A).unwrap();

        assert_eq!(ctx.secure_channel(), SecureChannel::Ev2);
        assert_eq!(ctx.transaction_id(), ti);
        assert_eq!(ctx.command_counter(), 0);

        // cross-check the session keys against a hand-built SV1/SV2
        let mut sv1 = [0u8; 32];
        sv1[0..6].copy_from_slice(&hex!("a55a00010080"));
        sv1[6..8].copy_from_slice(&RND_A[0..2]);
        for i in 0..6 {
            sv1[8 + i] = RND_A[2 + i] ^ rnd_b[i];
        }
        sv1[14..24].copy_from_slice(&rnd_b[6..16]);
        sv1[24..32].copy_from_slice(&RND_A[8..16]);
        let expected_enc = CamAes128.cmac(&key, &sv1);
        assert_eq!(ctx.session_key_enc(), &expected_enc[..16]);

        let mut sv2 = sv1;
        sv2[0..2].copy_from_slice(&hex!("5aa5"));
        let expected_mac = CamAes128.cmac(&key, &sv2);
        assert_eq!(ctx.session_key_mac(), &expected_mac[..16]);
        assert_ne!(ctx.session_key_enc(), ctx.session_key_mac());
    }

    /// A tampered card nonce fails step 11 and leaves no session behind.
    #[test]
    fn test_authenticate_ev1_failure_clears_session() {
        let key = [0u8; 16];
        let rnd_b = [0u8; 16];

        let mut enc_rnd_b = rnd_b;
        let mut iv = [0u8; 16];
        CamAes128.encrypt_cbc(&key, &mut iv, &mut enc_rnd_b);

        let mut ctx = context(vec![
            ScriptedCard::native(vec![0xAA, 0x00], 0xAF, enc_rnd_b.to_vec()),
            ScriptedCard::any(0x00, vec![0x55; 16]),
        ], KeyType::Aes, &key);

        let result = authenticate_with_nonces(&mut ctx, SecureChannel::Ev1, &RND_A, &RND_A);
        assert!(matches!(result, Err(Error::Auth(11))));
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.session_key_enc, [0u8; crate::context::MAX_KEY_SIZE]);
    }

    /// Card refusing the auth command maps to step 1.
    #[test]
    fn test_authenticate_refused_is_step_1() {
        let mut ctx = context(vec![
            ScriptedCard::native(vec![0xAA, 0x00], 0xAE, vec![]),
        ], KeyType::Aes, &[0u8; 16]);

        let result = authenticate_with_nonces(&mut ctx, SecureChannel::Ev1, &RND_A, &RND_A);
        assert!(matches!(result, Err(Error::Auth(1))));
    }

    /// ISO 7816 flow: GET CHALLENGE, EXTERNAL and INTERNAL AUTHENTICATE.
    #[test]
    fn test_authenticate_iso_2tdea() {
        let key = [0u8; 16];
        let key_type = KeyType::TwoTdea;
        let cam = cipher_for(key_type);
        let picc_rnd = hex!("a0a1a2a3a4a5a6a7");
        let rnd_h2 = {
            let mut tmp = [0u8; 16];
            tmp[..8].copy_from_slice(&hex!("1615141312111009"));
            tmp
        };

        // what the host will send as EXTERNAL AUTHENTICATE data
        let mut both = [0u8; 16];
        both[..8].copy_from_slice(&RND_A[..8]);
        both[8..].copy_from_slice(&picc_rnd);
        let mut iv = [0u8; 8];
        cam.encrypt_cbc(&key, &mut iv, &mut both);

        // what the card answers to INTERNAL AUTHENTICATE: E(RndB2 || RndH2),
        // chained off the external-authenticate ciphertext
        let rnd_b2 = hex!("b0b1b2b3b4b5b6b7");
        let mut internal = [0u8; 16];
        internal[..8].copy_from_slice(&rnd_b2);
        internal[8..].copy_from_slice(&rnd_h2[..8]);
        cam.encrypt_cbc(&key, &mut iv, &mut internal);

        let mut external_apdu = vec![0x00, 0x82, 0x02, 0x00, 0x10];
        external_apdu.extend_from_slice(&both);
        let mut internal_apdu = vec![0x00, 0x88, 0x02, 0x00, 0x08];
        internal_apdu.extend_from_slice(&rnd_h2[..8]);
        internal_apdu.push(0x10);

        let mut ctx = context(vec![
            ScriptedCard::iso(vec![0x00, 0x84, 0x00, 0x00, 0x08], picc_rnd.to_vec(), 0x9000),
            ScriptedCard::iso(external_apdu, vec![], 0x9000),
            ScriptedCard::iso(internal_apdu, internal.to_vec(), 0x9000),
        ], key_type, &key);
        ctx.command_set = CommandSet::Iso;

        authenticate_with_nonces(&mut ctx, SecureChannel::Ev1, &RND_A, &rnd_h2).unwrap();

        assert_eq!(ctx.secure_channel(), SecureChannel::Ev1);
        // session key from RndA and the card's RndB2
        let mut expected = [0u8; 16];
        derive_session_key_legacy(&RND_A[..8], &rnd_b2, key_type, &mut expected);
        crate::crypt::collapse_des_session_key(&key, &mut expected);
        assert_eq!(ctx.session_key_enc(), expected);
    }
}
