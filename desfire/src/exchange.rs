//! The command exchange engine: framing, TX/RX chaining and response
//! assembly on top of the secure-channel codec.


use tracing::warn;

use crate::channel::{self, WrapMode};
use crate::commands::ins;
use crate::context::{CommandSet, DesfireContext};
use crate::error::{Error, Result};
use crate::iso7816::apdu::Apdu;
use crate::iso7816::card::SmartCard;
use crate::status::Status;


/// Largest PCD→PICC payload carried in one frame.
pub const TX_FRAME_MAX: usize = 54;


#[derive(Clone, Copy, Debug)]
pub(crate) struct ExchangeOpts {
    /// Drop and re-power the RF field before the first frame.
    pub activate_field: bool,
    /// Keep requesting frames while the card answers `ADDITIONAL_FRAME`.
    /// When off, the first fragment is returned verbatim and the caller
    /// drives further exchanges.
    pub enable_chaining: bool,
    /// Override the context's communication mode for this command.
    pub wrap: Option<WrapMode>,
}
impl Default for ExchangeOpts {
    fn default() -> Self {
        Self {
            activate_field: false,
            enable_chaining: true,
            wrap: None,
        }
    }
}


/// Exchange one command with RX chaining enabled, under the context's
/// communication mode.
pub fn exchange(ctx: &mut DesfireContext, cmd: u8, data: &[u8]) -> Result<(Status, Vec<u8>)> {
    exchange_ex(ctx, cmd, data, ExchangeOpts::default())
}

pub(crate) fn exchange_ex(ctx: &mut DesfireContext, cmd: u8, data: &[u8], opts: ExchangeOpts) -> Result<(Status, Vec<u8>)> {
    let result = exchange_inner(ctx, cmd, data, opts);
    if matches!(result, Err(Error::Transport(_))|Err(Error::Integrity)) {
        // the card's session state is indeterminate now
        ctx.clear_session();
    }
    result
}

/// Exchange a command whose response is a sequence of variable-length
/// records, one per frame, each at most `stride - 1` bytes. The records are
/// joined for secure-channel decoding and re-blocked afterwards.
pub(crate) fn exchange_split(ctx: &mut DesfireContext, cmd: u8, data: &[u8], stride: usize, opts: ExchangeOpts) -> Result<(Status, Vec<Vec<u8>>)> {
    if stride < 2 {
        return Err(Error::InvalidArgument("record stride must be at least 2"));
    }
    let result = exchange_split_inner(ctx, cmd, data, stride, opts);
    if matches!(result, Err(Error::Transport(_))|Err(Error::Integrity)) {
        ctx.clear_session();
    }
    result
}

fn exchange_inner(ctx: &mut DesfireContext, cmd: u8, data: &[u8], opts: ExchangeOpts) -> Result<(Status, Vec<u8>)> {
    let mode = wrap_mode(ctx, opts);
    let wrapped = channel::encode_request(ctx, cmd, data, mode)?;
    let (status, frames) = exchange_frames(ctx, cmd, &wrapped, opts)?;
    let decoded = channel::decode_response(ctx, status, join_blocks(&frames), mode)?;
    Ok((status, decoded))
}

fn exchange_split_inner(ctx: &mut DesfireContext, cmd: u8, data: &[u8], stride: usize, opts: ExchangeOpts) -> Result<(Status, Vec<Vec<u8>>)> {
    let mode = wrap_mode(ctx, opts);
    let wrapped = channel::encode_request(ctx, cmd, data, mode)?;
    let (status, frames) = exchange_frames(ctx, cmd, &wrapped, opts)?;
    if frames.iter().any(|frame| frame.len() > stride - 1) {
        return Err(Error::CardExchange);
    }
    let decoded = channel::decode_response(ctx, status, join_blocks(&frames), mode)?;
    Ok((status, reblock(&frames, &decoded)))
}

fn wrap_mode(ctx: &DesfireContext, opts: ExchangeOpts) -> WrapMode {
    opts.wrap.unwrap_or_else(|| ctx.comm_mode.into())
}


/// Concatenate response records into the flat stream the secure-channel
/// codec operates on.
pub fn join_blocks(blocks: &[Vec<u8>]) -> Vec<u8> {
    blocks.concat()
}

/// Split a flat stream into records of at most `stride - 1` bytes, the
/// inverse of [`join_blocks`] for any stride of at least 2.
pub fn split_blocks(data: &[u8], stride: usize) -> Vec<Vec<u8>> {
    data.chunks(stride - 1).map(<[u8]>::to_vec).collect()
}

/// Re-block a decoded stream along the boundaries of the original records,
/// truncating records once the stream runs dry.
fn reblock(frames: &[Vec<u8>], decoded: &[u8]) -> Vec<Vec<u8>> {
    let mut blocks = Vec::with_capacity(frames.len());
    let mut pos = 0;
    for frame in frames {
        if pos >= decoded.len() {
            break;
        }
        let take = frame.len().min(decoded.len() - pos);
        blocks.push(decoded[pos..pos + take].to_vec());
        pos += take;
    }
    blocks
}


/// Send the (already wrapped) command, chunking payloads beyond
/// [`TX_FRAME_MAX`], then pull response frames while the card keeps
/// answering `ADDITIONAL_FRAME`.
fn exchange_frames(ctx: &mut DesfireContext, cmd: u8, wrapped: &[u8], opts: ExchangeOpts) -> Result<(Status, Vec<Vec<u8>>)> {
    let (mut status, first) = match ctx.command_set {
        CommandSet::Native => transmit_native(ctx, cmd, wrapped, opts.activate_field)?,
        CommandSet::NativeIso => transmit_native_iso(ctx, cmd, wrapped, opts.activate_field)?,
        CommandSet::Iso => return Err(Error::NotImplemented("ISO command set in DesfireExchange")),
    };

    let mut frames = vec![first];
    if !opts.enable_chaining {
        return Ok((status, frames));
    }

    while status == Status::AdditionalFrame {
        let (next_status, data) = match ctx.command_set {
            CommandSet::Native => send_native(ctx, &[ins::ADDITIONAL_FRAME], false)?,
            CommandSet::NativeIso => send_native_iso(ctx, ins::ADDITIONAL_FRAME, &[], false)?,
            CommandSet::Iso => unreachable!(),
        };
        status = next_status;
        frames.push(data);
    }

    Ok((status, frames))
}

/// TX chaining over raw native frames: the instruction byte counts towards
/// the frame limit; continuation chunks are prefixed with `0xAF`.
fn transmit_native(ctx: &mut DesfireContext, cmd: u8, wrapped: &[u8], activate_field: bool) -> Result<(Status, Vec<u8>)> {
    let mut cdata = Vec::with_capacity(1 + wrapped.len());
    cdata.push(cmd);
    cdata.extend_from_slice(wrapped);

    let mut sent = 0;
    loop {
        let chunk = (cdata.len() - sent).min(TX_FRAME_MAX);
        let frame = if sent == 0 {
            cdata[..chunk].to_vec()
        } else {
            let mut continuation = Vec::with_capacity(1 + chunk);
            continuation.push(ins::ADDITIONAL_FRAME);
            continuation.extend_from_slice(&cdata[sent..sent + chunk]);
            continuation
        };

        let (status, data) = send_native(ctx, &frame, activate_field && sent == 0)?;
        sent += chunk;

        if status != Status::AdditionalFrame || !data.is_empty() {
            if sent != cdata.len() {
                warn!("tx chaining mismatch: sent {} of {} bytes", sent, cdata.len());
            }
            return Ok((status, data));
        }
        if sent >= cdata.len() {
            return Ok((status, data));
        }
    }
}

/// TX chaining over ISO-wrapped frames: the chunk limit applies to the APDU
/// data field; continuation chunks use INS `0xAF`.
fn transmit_native_iso(ctx: &mut DesfireContext, cmd: u8, wrapped: &[u8], activate_field: bool) -> Result<(Status, Vec<u8>)> {
    let mut sent = 0;
    loop {
        let chunk = (wrapped.len() - sent).min(TX_FRAME_MAX);
        let ins_byte = if sent == 0 { cmd } else { ins::ADDITIONAL_FRAME };

        let (status, data) = send_native_iso(ctx, ins_byte, &wrapped[sent..sent + chunk], activate_field && sent == 0)?;
        sent += chunk;

        if status != Status::AdditionalFrame || !data.is_empty() {
            if sent != wrapped.len() {
                warn!("tx chaining mismatch: sent {} of {} bytes", sent, wrapped.len());
            }
            return Ok((status, data));
        }
        if sent >= wrapped.len() {
            return Ok((status, data));
        }
    }
}

fn send_native(ctx: &mut DesfireContext, frame: &[u8], activate_field: bool) -> Result<(Status, Vec<u8>)> {
    let reply = ctx.card_mut().exchange_raw(frame, activate_field)?;
    if reply.is_empty() {
        return Err(Error::CardExchange);
    }
    let status = Status::from_byte(reply[0]);
    if !status.is_success() {
        return Err(Error::ApduFail(status));
    }
    Ok((status, reply[1..].to_vec()))
}

fn send_native_iso(ctx: &mut DesfireContext, ins_byte: u8, data: &[u8], activate_field: bool) -> Result<(Status, Vec<u8>)> {
    let apdu = Apdu::wrap_native(ins_byte, data);
    let response = ctx.card_mut().exchange_apdu(&apdu, activate_field)?;
    let status = Status::from_sw(response.trailer.to_word())
        .ok_or(Error::CardExchange)?;
    if !status.is_success() {
        return Err(Error::ApduFail(status));
    }
    Ok((status, response.data))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CommandSet, DesfireContext};
    use crate::crypt::KeyType;
    use crate::iso7816::card::testing::{Exchange, ScriptedCard};

    fn context(script: Vec<Exchange>) -> DesfireContext {
        let card = Box::new(ScriptedCard::new(script));
        DesfireContext::new(card, 0, KeyType::Aes, &[0u8; 16]).unwrap()
    }

    #[test]
    fn test_rx_chaining_assembles_aid_list() {
        // 30 AIDs of 3 bytes each, delivered over three frames
        let aids: Vec<u8> = (0..90u8).collect();
        let mut ctx = context(vec![
            ScriptedCard::native(vec![0x6A], 0xAF, aids[..57].to_vec()),
            ScriptedCard::native(vec![0xAF], 0xAF, aids[57..87].to_vec()),
            ScriptedCard::native(vec![0xAF], 0x00, aids[87..].to_vec()),
        ]);

        let (status, data) = exchange(&mut ctx, 0x6A, &[]).unwrap();
        assert_eq!(status, Status::OperationOk);
        assert_eq!(data.len(), 90);
        assert_eq!(data, aids);
    }

    #[test]
    fn test_rx_chaining_disabled_returns_first_fragment() {
        let mut ctx = context(vec![
            ScriptedCard::native(vec![0x6A], 0xAF, vec![1, 2, 3]),
        ]);

        let opts = ExchangeOpts { enable_chaining: false, ..Default::default() };
        let (status, data) = exchange_ex(&mut ctx, 0x6A, &[], opts).unwrap();
        assert_eq!(status, Status::AdditionalFrame);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_tx_chaining_native_splits_at_54_bytes() {
        // 100 payload bytes plus the instruction: 54 + 47
        let payload: Vec<u8> = (0..100u8).collect();
        let mut first = vec![0x3D];
        first.extend_from_slice(&payload[..53]);
        let mut second = vec![0xAF];
        second.extend_from_slice(&payload[53..]);

        let mut ctx = context(vec![
            ScriptedCard::native(first, 0xAF, vec![]),
            ScriptedCard::native(second, 0x00, vec![]),
        ]);

        let (status, data) = exchange(&mut ctx, 0x3D, &payload).unwrap();
        assert_eq!(status, Status::OperationOk);
        assert!(data.is_empty());
    }

    #[test]
    fn test_error_status_is_apdu_fail() {
        let mut ctx = context(vec![
            ScriptedCard::native(vec![0x6E], 0xAE, vec![]),
        ]);

        let result = exchange(&mut ctx, 0x6E, &[]);
        assert!(matches!(result, Err(Error::ApduFail(Status::AuthenticationError))));
    }

    #[test]
    fn test_native_iso_wrapping() {
        let mut ctx = context(vec![
            ScriptedCard::iso(vec![0x90, 0x6A, 0x00, 0x00, 0x00], vec![0x01, 0x02, 0x03], 0x91AF),
            ScriptedCard::iso(vec![0x90, 0xAF, 0x00, 0x00, 0x00], vec![0x04, 0x05, 0x06], 0x9100),
        ]);
        ctx.command_set = CommandSet::NativeIso;

        let (status, data) = exchange(&mut ctx, 0x6A, &[]).unwrap();
        assert_eq!(status, Status::OperationOk);
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_iso_command_set_not_implemented() {
        let mut ctx = context(Vec::new());
        ctx.command_set = CommandSet::Iso;
        assert!(matches!(
            exchange(&mut ctx, 0x6A, &[]),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn test_split_exchange_keeps_record_boundaries() {
        let mut ctx = context(vec![
            ScriptedCard::native(vec![0x6D], 0xAF, vec![0x01; 21]),
            ScriptedCard::native(vec![0xAF], 0x00, vec![0x02; 10]),
        ]);

        let (status, blocks) = exchange_split(&mut ctx, 0x6D, &[], 24, ExchangeOpts::default()).unwrap();
        assert_eq!(status, Status::OperationOk);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], vec![0x01; 21]);
        assert_eq!(blocks[1], vec![0x02; 10]);
    }

    #[test]
    fn test_integrity_failure_clears_session() {
        use crate::context::{CommMode, SecureChannel};

        // a MACed response whose trailing MAC is garbage
        let mut ctx = context(vec![
            ScriptedCard::any(0x00, vec![0x00; 11]),
            ScriptedCard::native(vec![0x6E], 0x00, vec![0x20, 0x12, 0x00]),
        ]);
        ctx.secure_channel = SecureChannel::Ev1;
        ctx.comm_mode = CommMode::Mac;

        let result = exchange(&mut ctx, 0x6E, &[]);
        assert!(matches!(result, Err(Error::Integrity)));
        assert!(!ctx.is_authenticated());

        // the context stays usable for plain traffic
        ctx.comm_mode = CommMode::Plain;
        let (status, data) = exchange(&mut ctx, 0x6E, &[]).unwrap();
        assert_eq!(status, Status::OperationOk);
        assert_eq!(data, vec![0x20, 0x12, 0x00]);
    }

    #[test]
    fn test_join_split_blocks_inverse() {
        let data: Vec<u8> = (0..100u8).collect();
        for stride in [2usize, 3, 24, 64, 200] {
            assert_eq!(join_blocks(&split_blocks(&data, stride)), data);
        }
        assert_eq!(join_blocks(&split_blocks(&[], 24)), Vec::<u8>::new());
    }
}
