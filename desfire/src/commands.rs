//! The DESFire command surface: application, file, key and data operations
//! layered over the exchange engine.


use byteorder::{LittleEndian, WriteBytesExt};
use zeroize::Zeroizing;

use crate::channel::WrapMode;
use crate::context::{CommMode, DesfireContext, SecureChannel};
use crate::crypt::{crc16, crc32_parts, des_key_set_version, materialize_2tdea, KeyType};
use crate::error::{Error, Result};
use crate::exchange::{exchange_ex, exchange_split, ExchangeOpts};
use crate::status::Status;


/// Native instruction bytes.
pub mod ins {
    pub const AUTHENTICATE: u8 = 0x0A;
    pub const AUTHENTICATE_ISO: u8 = 0x1A;
    pub const AUTHENTICATE_AES: u8 = 0xAA;
    pub const AUTHENTICATE_EV2_FIRST: u8 = 0x71;
    pub const AUTHENTICATE_EV2_NON_FIRST: u8 = 0x77;
    pub const ADDITIONAL_FRAME: u8 = 0xAF;

    pub const FORMAT_PICC: u8 = 0xFC;
    pub const GET_VERSION: u8 = 0x60;
    pub const GET_FREE_MEMORY: u8 = 0x6E;
    pub const GET_UID: u8 = 0x51;
    pub const SET_CONFIGURATION: u8 = 0x5C;

    pub const GET_APPLICATION_IDS: u8 = 0x6A;
    pub const GET_DF_NAMES: u8 = 0x6D;
    pub const SELECT_APPLICATION: u8 = 0x5A;
    pub const CREATE_APPLICATION: u8 = 0xCA;
    pub const DELETE_APPLICATION: u8 = 0xDA;

    pub const GET_KEY_SETTINGS: u8 = 0x45;
    pub const GET_KEY_VERSION: u8 = 0x64;
    pub const CHANGE_KEY_SETTINGS: u8 = 0x54;
    pub const CHANGE_KEY: u8 = 0xC4;

    pub const GET_FILE_IDS: u8 = 0x6F;
    pub const GET_ISO_FILE_IDS: u8 = 0x61;
    pub const GET_FILE_SETTINGS: u8 = 0xF5;
    pub const CHANGE_FILE_SETTINGS: u8 = 0x5F;
    pub const CREATE_STD_DATA_FILE: u8 = 0xCD;
    pub const CREATE_BACKUP_DATA_FILE: u8 = 0xCB;
    pub const CREATE_VALUE_FILE: u8 = 0xCC;
    pub const CREATE_LINEAR_RECORD_FILE: u8 = 0xC1;
    pub const CREATE_CYCLIC_RECORD_FILE: u8 = 0xC0;
    pub const CREATE_TRANS_MAC_FILE: u8 = 0xCE;
    pub const DELETE_FILE: u8 = 0xDF;

    pub const READ_DATA: u8 = 0xBD;
    pub const WRITE_DATA: u8 = 0x3D;
    pub const READ_RECORDS: u8 = 0xBB;
    pub const WRITE_RECORD: u8 = 0x3B;
    pub const UPDATE_RECORD: u8 = 0xDB;
    pub const CLEAR_RECORD_FILE: u8 = 0xEB;

    pub const GET_VALUE: u8 = 0x6C;
    pub const CREDIT: u8 = 0x0C;
    pub const LIMITED_CREDIT: u8 = 0x1C;
    pub const DEBIT: u8 = 0xDC;
    pub const COMMIT_TRANSACTION: u8 = 0xC7;
    pub const ABORT_TRANSACTION: u8 = 0xA7;
}


/// Stride of the GetDFNames response records: 3-byte AID, 2-byte ISO file
/// id and up to a 16-byte DF name, plus the length marker.
const DF_NAMES_STRIDE: usize = 24;


// ---- integer encodings --------------------------------------------------

/// Parse a 3-byte little-endian application identifier.
pub fn aid_from_bytes(data: &[u8]) -> Result<u32> {
    if data.len() != 3 {
        return Err(Error::InvalidArgument("AID must be 3 bytes"));
    }
    Ok(u32::from(data[0]) | (u32::from(data[1]) << 8) | (u32::from(data[2]) << 16))
}

/// Serialise an application identifier as 3 bytes little-endian.
pub fn aid_to_bytes(aid: u32) -> Result<[u8; 3]> {
    if aid > 0x00FF_FFFF {
        return Err(Error::InvalidArgument("AID exceeds 24 bits"));
    }
    Ok([aid as u8, (aid >> 8) as u8, (aid >> 16) as u8])
}

fn write_u24(buf: &mut Vec<u8>, value: u32) -> Result<()> {
    if value > 0x00FF_FFFF {
        return Err(Error::InvalidArgument("value exceeds 24 bits"));
    }
    buf.write_u24::<LittleEndian>(value).expect("vec write");
    Ok(())
}

fn read_u24(data: &[u8]) -> u32 {
    u32::from(data[0]) | (u32::from(data[1]) << 8) | (u32::from(data[2]) << 16)
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}


// ---- descriptive records ------------------------------------------------

/// Key number granting free access in an access-rights nibble.
pub const ACCESS_FREE: u8 = 0x0E;
/// Access-rights nibble denying the operation altogether.
pub const ACCESS_DENY: u8 = 0x0F;

/// The four access-right nibbles of a file, each a key number 0–13,
/// [`ACCESS_FREE`] or [`ACCESS_DENY`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AccessRights {
    pub read: u8,
    pub write: u8,
    pub read_write: u8,
    pub change: u8,
}
impl AccessRights {
    pub const fn free() -> Self {
        Self {
            read: ACCESS_FREE,
            write: ACCESS_FREE,
            read_write: ACCESS_FREE,
            change: ACCESS_FREE,
        }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [
            (self.change & 0x0F) | ((self.read_write << 4) & 0xF0),
            (self.write & 0x0F) | ((self.read << 4) & 0xF0),
        ]
    }

    pub fn from_bytes(data: [u8; 2]) -> Self {
        Self {
            read: (data[1] >> 4) & 0x0F,
            write: data[1] & 0x0F,
            read_write: (data[0] >> 4) & 0x0F,
            change: data[0] & 0x0F,
        }
    }

    pub fn to_word(self) -> u16 {
        u16::from_le_bytes(self.to_bytes())
    }
}

/// The key-settings byte and key-count byte of a PICC or application.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeySettings {
    pub settings: u8,
    pub num_keys_raw: u8,
}
impl KeySettings {
    pub const fn num_keys(self) -> u8 {
        self.num_keys_raw & 0x0F
    }

    /// Application key algorithm from the upper two bits of the key-count
    /// byte.
    pub const fn key_type(self) -> Option<KeyType> {
        match self.num_keys_raw >> 6 {
            0 => Some(KeyType::TwoTdea),
            1 => Some(KeyType::ThreeTdea),
            2 => Some(KeyType::Aes),
            _ => None,
        }
    }

    pub const fn iso_fid_enabled(self) -> bool {
        self.num_keys_raw & 0x20 != 0
    }
}

/// File geometry by file type.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FileSettingsKind {
    Data { size: u32 },
    Value { lower_limit: u32, upper_limit: u32, value: u32, limited_credit: u8 },
    Record { record_size: u32, max_record_count: u32, cur_record_count: u32 },
    TransactionMac { key_type: u8, key_version: u8 },
    Unknown,
}

/// Parsed GetFileSettings response.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileSettings {
    pub file_type: u8,
    pub file_option: u8,
    pub comm_mode: CommMode,
    pub access: AccessRights,
    pub kind: FileSettingsKind,
    pub additional_access_rights: Vec<u16>,
}
impl FileSettings {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::CardExchange);
        }

        let file_type = data[0];
        let file_option = data[1];
        let comm_mode = comm_mode_from_file_bits(file_option & 0x03);
        let access = AccessRights::from_bytes([data[2], data[3]]);

        let (kind, fixed_len) = match file_type {
            0x00|0x01 => {
                if data.len() < 7 {
                    return Err(Error::CardExchange);
                }
                (FileSettingsKind::Data { size: read_u24(&data[4..]) }, 7)
            },
            0x02 => {
                if data.len() < 17 {
                    return Err(Error::CardExchange);
                }
                (
                    FileSettingsKind::Value {
                        lower_limit: read_u32(&data[4..]),
                        upper_limit: read_u32(&data[8..]),
                        value: read_u32(&data[12..]),
                        limited_credit: data[16],
                    },
                    17,
                )
            },
            0x03|0x04 => {
                if data.len() < 13 {
                    return Err(Error::CardExchange);
                }
                (
                    FileSettingsKind::Record {
                        record_size: read_u24(&data[4..]),
                        max_record_count: read_u24(&data[7..]),
                        cur_record_count: read_u24(&data[10..]),
                    },
                    13,
                )
            },
            0x05 => {
                if data.len() < 6 {
                    return Err(Error::CardExchange);
                }
                (FileSettingsKind::TransactionMac { key_type: data[4], key_version: data[5] }, 6)
            },
            _ => (FileSettingsKind::Unknown, data.len()),
        };

        let mut additional_access_rights = Vec::new();
        // TransactionMac files carry no additional access rights even when
        // the enable bit is set
        let additional_enabled = file_option & 0x80 != 0 && file_type != 0x05;
        if additional_enabled && data.len() > fixed_len {
            let count = usize::from(data[fixed_len]);
            if data.len() == fixed_len + 1 + count * 2 {
                for i in 0..count {
                    additional_access_rights.push(read_u16(&data[fixed_len + 1 + i * 2..]));
                }
            }
        }

        Ok(Self {
            file_type,
            file_option,
            comm_mode,
            access,
            kind,
            additional_access_rights,
        })
    }
}

const fn comm_mode_from_file_bits(bits: u8) -> CommMode {
    match bits {
        0x01 => CommMode::Mac,
        0x03 => CommMode::Encrypted,
        _ => CommMode::Plain,
    }
}

/// One 7-byte hardware/software descriptor inside the GetVersion blob.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VersionInfo {
    pub vendor_id: u8,
    pub card_type: u8,
    pub card_subtype: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub storage_size: u8,
    pub protocol: u8,
}
impl VersionInfo {
    fn parse(data: &[u8]) -> Self {
        Self {
            vendor_id: data[0],
            card_type: data[1],
            card_subtype: data[2],
            version_major: data[3],
            version_minor: data[4],
            storage_size: data[5],
            protocol: data[6],
        }
    }
}

/// Parsed GetVersion response.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PiccVersion {
    pub hardware: VersionInfo,
    pub software: VersionInfo,
    pub uid: [u8; 7],
    pub batch: [u8; 5],
    pub production_week: u8,
    pub production_year: u8,
}
impl PiccVersion {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 28 {
            return Err(Error::CardExchange);
        }
        let mut uid = [0u8; 7];
        uid.copy_from_slice(&data[14..21]);
        let mut batch = [0u8; 5];
        batch.copy_from_slice(&data[21..26]);
        Ok(Self {
            hardware: VersionInfo::parse(&data[0..7]),
            software: VersionInfo::parse(&data[7..14]),
            uid,
            batch,
            production_week: data[26],
            production_year: data[27],
        })
    }
}

/// Card-level descriptive data, gathered best-effort.
#[derive(Clone, Debug, Default)]
pub struct PiccInfo {
    pub version: Option<PiccVersion>,
    pub free_mem: Option<u32>,
    pub key_settings: Option<KeySettings>,
}

/// One GetDFNames record.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DfName {
    pub aid: u32,
    pub iso_fid: u16,
    pub name: Vec<u8>,
}

/// Application-level descriptive data.
#[derive(Clone, Debug, Default)]
pub struct AppInfo {
    pub aid: u32,
    pub key_settings: Option<KeySettings>,
    pub file_ids: Vec<u8>,
}


// ---- create-file command table ------------------------------------------

/// File type byte ↔ create instruction and expected payload geometry.
#[derive(Clone, Copy, Debug)]
pub struct CreateFileCommand {
    pub file_type: u8,
    pub name: &'static str,
    pub ins: u8,
    pub create_len: usize,
    pub may_have_iso_fid: bool,
}

pub const CREATE_FILE_COMMANDS: &[CreateFileCommand] = &[
    CreateFileCommand { file_type: 0x00, name: "Standard data",   ins: ins::CREATE_STD_DATA_FILE,      create_len: 6,  may_have_iso_fid: true },
    CreateFileCommand { file_type: 0x01, name: "Backup data",     ins: ins::CREATE_BACKUP_DATA_FILE,   create_len: 6,  may_have_iso_fid: true },
    CreateFileCommand { file_type: 0x02, name: "Value",           ins: ins::CREATE_VALUE_FILE,         create_len: 16, may_have_iso_fid: false },
    CreateFileCommand { file_type: 0x03, name: "Linear record",   ins: ins::CREATE_LINEAR_RECORD_FILE, create_len: 12, may_have_iso_fid: true },
    CreateFileCommand { file_type: 0x04, name: "Cyclic record",   ins: ins::CREATE_CYCLIC_RECORD_FILE, create_len: 12, may_have_iso_fid: true },
    CreateFileCommand { file_type: 0x05, name: "Transaction MAC", ins: ins::CREATE_TRANS_MAC_FILE,     create_len: 5,  may_have_iso_fid: false },
];

pub fn create_file_command(file_type: u8) -> Option<&'static CreateFileCommand> {
    CREATE_FILE_COMMANDS.iter().find(|rec| rec.file_type == file_type)
}


// ---- command plumbing ---------------------------------------------------

/// Issue one command, requiring `OPERATION_OK`, optionally checking the
/// response length.
fn command_ex(ctx: &mut DesfireContext, cmd: u8, data: &[u8], check_length: Option<usize>, wrap: Option<WrapMode>) -> Result<Vec<u8>> {
    let opts = ExchangeOpts { wrap, ..Default::default() };
    let (status, response) = exchange_ex(ctx, cmd, data, opts)?;
    if status != Status::OperationOk {
        return Err(Error::ApduFail(status));
    }
    if let Some(expected) = check_length {
        if response.len() != expected {
            return Err(Error::CardExchange);
        }
    }
    Ok(response)
}

fn command(ctx: &mut DesfireContext, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
    command_ex(ctx, cmd, data, None, None)
}

fn command_no_response(ctx: &mut DesfireContext, cmd: u8, data: &[u8]) -> Result<()> {
    command_ex(ctx, cmd, data, Some(0), None)?;
    Ok(())
}


// ---- PICC level ----------------------------------------------------------

/// Select an application by AID; `0x000000` returns to card level. Always
/// drops the secure channel and session.
pub fn select_application(ctx: &mut DesfireContext, aid: u32) -> Result<()> {
    select_application_ex(ctx, aid, true)
}

/// Select without re-activating the RF field (for in-session selects).
pub fn select_application_in_field(ctx: &mut DesfireContext, aid: u32) -> Result<()> {
    select_application_ex(ctx, aid, false)
}

fn select_application_ex(ctx: &mut DesfireContext, aid: u32, activate_field: bool) -> Result<()> {
    let data = aid_to_bytes(aid)?;

    ctx.clear_session();
    let opts = ExchangeOpts { activate_field, ..Default::default() };
    let (status, response) = exchange_ex(ctx, ins::SELECT_APPLICATION, &data, opts)?;
    if !response.is_empty() {
        return Err(Error::CardExchange);
    }
    if status != Status::OperationOk {
        return Err(Error::ApduFail(status));
    }

    ctx.clear_session();
    ctx.app_selected = aid != 0x000000;
    Ok(())
}

pub fn format_picc(ctx: &mut DesfireContext) -> Result<()> {
    command_no_response(ctx, ins::FORMAT_PICC, &[])
}

pub fn get_free_mem(ctx: &mut DesfireContext) -> Result<u32> {
    let response = command_ex(ctx, ins::GET_FREE_MEMORY, &[], Some(3), None)?;
    Ok(read_u24(&response))
}

/// The card's real UID. Under random-ID configurations the response is
/// enciphered, so an encrypted session is required.
pub fn get_uid(ctx: &mut DesfireContext) -> Result<Vec<u8>> {
    command(ctx, ins::GET_UID, &[])
}

pub fn get_version(ctx: &mut DesfireContext) -> Result<PiccVersion> {
    let response = command(ctx, ins::GET_VERSION, &[])?;
    PiccVersion::parse(&response)
}

pub fn get_aid_list(ctx: &mut DesfireContext) -> Result<Vec<u32>> {
    let response = command(ctx, ins::GET_APPLICATION_IDS, &[])?;
    if response.len() % 3 != 0 {
        return Err(Error::CardExchange);
    }
    response.chunks_exact(3).map(aid_from_bytes).collect()
}

pub fn get_df_names(ctx: &mut DesfireContext) -> Result<Vec<DfName>> {
    let opts = ExchangeOpts::default();
    let (status, blocks) = exchange_split(ctx, ins::GET_DF_NAMES, &[], DF_NAMES_STRIDE, opts)?;
    if status != Status::OperationOk {
        return Err(Error::ApduFail(status));
    }

    let mut names = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.is_empty() {
            continue;
        }
        if block.len() < 5 {
            return Err(Error::CardExchange);
        }
        names.push(DfName {
            aid: aid_from_bytes(&block[0..3])?,
            // ISO file ids are big-endian on the wire
            iso_fid: u16::from_be_bytes([block[3], block[4]]),
            name: block[5..].to_vec(),
        });
    }
    Ok(names)
}

pub fn create_application(
    ctx: &mut DesfireContext,
    aid: u32,
    key_settings: u8,
    num_keys: u8,
    app_key_type: KeyType,
    iso_fid: Option<u16>,
    df_name: Option<&[u8]>,
) -> Result<()> {
    if num_keys > 14 {
        return Err(Error::InvalidArgument("applications hold at most 14 keys"));
    }
    if df_name.map_or(false, |name| name.len() > 16) {
        return Err(Error::InvalidArgument("DF name exceeds 16 bytes"));
    }

    let mut data = Vec::with_capacity(5 + 2 + 16);
    data.extend_from_slice(&aid_to_bytes(aid)?);
    data.push(key_settings);
    let mut num_keys_byte = num_keys | (app_key_type.card_type_bits() << 6);
    if iso_fid.is_some() {
        num_keys_byte |= 0x20;
    }
    data.push(num_keys_byte);
    if let Some(fid) = iso_fid {
        data.extend_from_slice(&fid.to_be_bytes());
    }
    if let Some(name) = df_name {
        data.extend_from_slice(name);
    }

    command_no_response(ctx, ins::CREATE_APPLICATION, &data)
}

pub fn delete_application(ctx: &mut DesfireContext, aid: u32) -> Result<()> {
    let data = aid_to_bytes(aid)?;
    command_no_response(ctx, ins::DELETE_APPLICATION, &data)
}

/// Gather card-level information, tolerating partial failures the way an
/// unauthenticated browse does.
pub fn fill_picc_info(ctx: &mut DesfireContext) -> Result<PiccInfo> {
    let mut info = PiccInfo::default();
    info.version = get_version(ctx).ok();
    info.free_mem = get_free_mem(ctx).ok();
    info.key_settings = get_key_settings(ctx).ok();
    Ok(info)
}

/// Gather per-application information for every AID on the card.
pub fn fill_app_list(ctx: &mut DesfireContext) -> Result<Vec<AppInfo>> {
    let aids = get_aid_list(ctx)?;
    let mut apps = Vec::with_capacity(aids.len());
    for aid in aids {
        select_application_in_field(ctx, aid)?;
        apps.push(AppInfo {
            aid,
            key_settings: get_key_settings(ctx).ok(),
            file_ids: get_file_ids(ctx).unwrap_or_default(),
        });
    }
    apps.sort_by_key(|app| app.aid);
    Ok(apps)
}


// ---- key management ------------------------------------------------------

pub fn get_key_settings(ctx: &mut DesfireContext) -> Result<KeySettings> {
    let response = command_ex(ctx, ins::GET_KEY_SETTINGS, &[], Some(2), None)?;
    Ok(KeySettings { settings: response[0], num_keys_raw: response[1] })
}

pub fn get_key_version(ctx: &mut DesfireContext, key_num: u8) -> Result<u8> {
    let response = command_ex(ctx, ins::GET_KEY_VERSION, &[key_num], Some(1), None)?;
    Ok(response[0])
}

pub fn change_key_settings(ctx: &mut DesfireContext, settings: u8) -> Result<()> {
    command_ex(ctx, ins::CHANGE_KEY_SETTINGS, &[settings], Some(0), Some(WrapMode::Encrypted))?;
    Ok(())
}

/// Change a key. The payload carries the new key material (XORed with the
/// old key when changing a slot other than the authenticated one), an AES
/// version byte, and per-channel CRCs; the cryptogram leaves the key-number
/// byte in clear.
///
/// `new_key_version` above `0xFF` disables version encoding for DES-family
/// keys. Changing the authenticated key clears the session.
#[allow(clippy::too_many_arguments)]
pub fn change_key(
    ctx: &mut DesfireContext,
    change_master_key: bool,
    new_key_num: u8,
    new_key_type: KeyType,
    new_key_version: u32,
    new_key: &[u8],
    old_key_type: KeyType,
    old_key: &[u8],
) -> Result<()> {
    if new_key.len() != new_key_type.key_length() {
        return Err(Error::InvalidArgument("new key length does not match key type"));
    }
    if old_key.len() != old_key_type.key_length() {
        return Err(Error::InvalidArgument("old key length does not match key type"));
    }

    let mut key_no_byte = new_key_num & 0x3F;
    // new crypto methods exist only at application creation; switching the
    // card master key's algorithm rides on the upper key-number bits
    if change_master_key {
        key_no_byte |= (new_key_type.card_type_bits() & 0x03) << 6;
    }

    // materialise DES keys as 2TDEA
    let mut old_key_buf = Zeroizing::new(old_key.to_vec());
    if old_key_type == KeyType::Des {
        old_key_buf = Zeroizing::new(materialize_2tdea(old_key).to_vec());
    }
    let mut new_key_buf = Zeroizing::new(new_key.to_vec());
    if new_key_type == KeyType::Des {
        new_key_buf = Zeroizing::new(materialize_2tdea(new_key).to_vec());
    }

    if new_key_type != KeyType::Aes && new_key_version < 0x100 {
        des_key_set_version(&mut new_key_buf, new_key_version as u8);
    }

    // xor against the old key when changing a different slot
    let mut cryptogram = Zeroizing::new(new_key_buf.to_vec());
    if new_key_num != ctx.key_num {
        for (byte, old) in cryptogram.iter_mut().zip(old_key_buf.iter()) {
            *byte ^= *old;
        }
    }

    if new_key_type == KeyType::Aes {
        cryptogram.push(new_key_version as u8);
    }

    match ctx.secure_channel() {
        SecureChannel::D40 => {
            let crc = crc16(&cryptogram);
            cryptogram.extend_from_slice(&crc);
            if new_key_num != ctx.key_num {
                cryptogram.extend_from_slice(&crc16(&new_key_buf));
            }
        },
        _ => {
            // checksum covers INS, key-number byte and the cryptogram so far
            let crc = crc32_parts(&[&[ins::CHANGE_KEY], &[key_no_byte], &cryptogram]);
            cryptogram.extend_from_slice(&crc);
            if new_key_num != ctx.key_num {
                cryptogram.extend_from_slice(&crc32_parts(&[&new_key_buf]));
            }
        },
    }

    let mut data = Zeroizing::new(Vec::with_capacity(1 + cryptogram.len()));
    data.push(key_no_byte);
    data.extend_from_slice(&cryptogram);

    let result = command_ex(
        ctx,
        ins::CHANGE_KEY,
        &data,
        None,
        Some(WrapMode::EncryptedRaw { plain_header: 1 }),
    );

    // changing the key we are authenticated with invalidates the session
    // regardless of the outcome
    if new_key_num == ctx.key_num {
        ctx.clear_session();
    }

    let response = result?;
    if !response.is_empty() {
        return Err(Error::CardExchange);
    }
    Ok(())
}

/// SetConfiguration: per-channel CRC over the parameter data, plus the
/// trailing `0x80` marker for the default-key record (parameter id 2).
pub fn set_configuration(ctx: &mut DesfireContext, param_id: u8, param: &[u8]) -> Result<()> {
    let mut data = Zeroizing::new(Vec::with_capacity(1 + param.len() + 6));
    data.push(param_id);
    data.extend_from_slice(param);

    match ctx.secure_channel() {
        SecureChannel::D40 => {
            let crc = crc16(param);
            data.extend_from_slice(&crc);
        },
        _ => {
            let crc = crc32_parts(&[&[ins::SET_CONFIGURATION], &data]);
            data.extend_from_slice(&crc);
        },
    }
    if param_id == 0x02 {
        data.push(0x80);
    }

    let response = command_ex(
        ctx,
        ins::SET_CONFIGURATION,
        &data,
        None,
        Some(WrapMode::EncryptedRaw { plain_header: 1 }),
    )?;
    if !response.is_empty() {
        return Err(Error::CardExchange);
    }
    Ok(())
}


// ---- file management -----------------------------------------------------

pub fn get_file_ids(ctx: &mut DesfireContext) -> Result<Vec<u8>> {
    command(ctx, ins::GET_FILE_IDS, &[])
}

/// ISO file identifiers are serialised big-endian on the wire.
pub fn get_iso_file_ids(ctx: &mut DesfireContext) -> Result<Vec<u16>> {
    let response = command(ctx, ins::GET_ISO_FILE_IDS, &[])?;
    if response.len() % 2 != 0 {
        return Err(Error::CardExchange);
    }
    Ok(response
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn get_file_settings(ctx: &mut DesfireContext, file_num: u8) -> Result<FileSettings> {
    let response = command(ctx, ins::GET_FILE_SETTINGS, &[file_num])?;
    FileSettings::parse(&response)
}

pub fn change_file_settings(ctx: &mut DesfireContext, file_num: u8, settings: &[u8]) -> Result<()> {
    let mut data = Vec::with_capacity(1 + settings.len());
    data.push(file_num);
    data.extend_from_slice(settings);
    command_no_response(ctx, ins::CHANGE_FILE_SETTINGS, &data)
}

/// Create a file from a raw type byte and settings payload, checked against
/// the create-file command table.
pub fn create_file(ctx: &mut DesfireContext, file_type: u8, data: &[u8], check_length: bool) -> Result<()> {
    let rec = create_file_command(file_type)
        .ok_or(Error::InvalidArgument("unknown file type"))?;
    if check_length {
        let base = rec.create_len + 1;
        let with_iso = base + if rec.may_have_iso_fid { 2 } else { 0 };
        if data.len() != base && data.len() != with_iso {
            return Err(Error::InvalidArgument("create-file payload length mismatch"));
        }
    }
    command_no_response(ctx, rec.ins, data)
}

pub fn create_std_data_file(
    ctx: &mut DesfireContext,
    file_num: u8,
    comm_mode: CommMode,
    access: AccessRights,
    file_size: u32,
) -> Result<()> {
    let mut data = Vec::with_capacity(8);
    data.push(file_num);
    data.push(comm_mode_to_file_bits(comm_mode));
    data.extend_from_slice(&access.to_bytes());
    write_u24(&mut data, file_size)?;
    create_file(ctx, 0x00, &data, true)
}

#[allow(clippy::too_many_arguments)]
pub fn create_value_file(
    ctx: &mut DesfireContext,
    file_num: u8,
    comm_mode: CommMode,
    access: AccessRights,
    lower_limit: u32,
    upper_limit: u32,
    value: u32,
    limited_credit_enabled: bool,
) -> Result<()> {
    let mut data = Vec::with_capacity(18);
    data.push(file_num);
    data.push(comm_mode_to_file_bits(comm_mode));
    data.extend_from_slice(&access.to_bytes());
    data.write_u32::<LittleEndian>(lower_limit).expect("vec write");
    data.write_u32::<LittleEndian>(upper_limit).expect("vec write");
    data.write_u32::<LittleEndian>(value).expect("vec write");
    data.push(u8::from(limited_credit_enabled));
    create_file(ctx, 0x02, &data, true)
}

pub fn create_linear_record_file(
    ctx: &mut DesfireContext,
    file_num: u8,
    comm_mode: CommMode,
    access: AccessRights,
    record_size: u32,
    max_records: u32,
) -> Result<()> {
    let mut data = Vec::with_capacity(11);
    data.push(file_num);
    data.push(comm_mode_to_file_bits(comm_mode));
    data.extend_from_slice(&access.to_bytes());
    write_u24(&mut data, record_size)?;
    write_u24(&mut data, max_records)?;
    create_file(ctx, 0x03, &data, true)
}

const fn comm_mode_to_file_bits(mode: CommMode) -> u8 {
    match mode {
        CommMode::Plain => 0x00,
        CommMode::Mac => 0x01,
        CommMode::Encrypted => 0x03,
    }
}

pub fn delete_file(ctx: &mut DesfireContext, file_num: u8) -> Result<()> {
    command_no_response(ctx, ins::DELETE_FILE, &[file_num])
}


// ---- data and record I/O -------------------------------------------------

pub fn read_data(ctx: &mut DesfireContext, file_num: u8, offset: u32, length: u32) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(7);
    data.push(file_num);
    write_u24(&mut data, offset)?;
    write_u24(&mut data, length)?;
    command(ctx, ins::READ_DATA, &data)
}

pub fn write_data(ctx: &mut DesfireContext, file_num: u8, offset: u32, payload: &[u8]) -> Result<()> {
    let mut data = Vec::with_capacity(7 + payload.len());
    data.push(file_num);
    write_u24(&mut data, offset)?;
    write_u24(&mut data, payload.len() as u32)?;
    data.extend_from_slice(payload);
    command_no_response(ctx, ins::WRITE_DATA, &data)
}

pub fn read_records(ctx: &mut DesfireContext, file_num: u8, record_num: u32, record_count: u32) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(7);
    data.push(file_num);
    write_u24(&mut data, record_num)?;
    write_u24(&mut data, record_count)?;
    command(ctx, ins::READ_RECORDS, &data)
}

pub fn write_record(ctx: &mut DesfireContext, file_num: u8, offset: u32, payload: &[u8]) -> Result<()> {
    let mut data = Vec::with_capacity(7 + payload.len());
    data.push(file_num);
    write_u24(&mut data, offset)?;
    write_u24(&mut data, payload.len() as u32)?;
    data.extend_from_slice(payload);
    command_no_response(ctx, ins::WRITE_RECORD, &data)
}

pub fn update_record(ctx: &mut DesfireContext, file_num: u8, record_num: u32, offset: u32, payload: &[u8]) -> Result<()> {
    let mut data = Vec::with_capacity(10 + payload.len());
    data.push(file_num);
    write_u24(&mut data, record_num)?;
    write_u24(&mut data, offset)?;
    write_u24(&mut data, payload.len() as u32)?;
    data.extend_from_slice(payload);
    command_no_response(ctx, ins::UPDATE_RECORD, &data)
}

pub fn clear_record_file(ctx: &mut DesfireContext, file_num: u8) -> Result<()> {
    command_no_response(ctx, ins::CLEAR_RECORD_FILE, &[file_num])
}


// ---- value files and transactions ----------------------------------------

/// The four value-file operations.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ValueOp {
    Get,
    Credit,
    LimitedCredit,
    Debit,
}
impl ValueOp {
    const fn ins(self) -> u8 {
        match self {
            Self::Get => ins::GET_VALUE,
            Self::Credit => ins::CREDIT,
            Self::LimitedCredit => ins::LIMITED_CREDIT,
            Self::Debit => ins::DEBIT,
        }
    }
}

/// Run one value-file operation; `Get` returns the current value, the
/// mutating operations take `value` and return nothing.
pub fn value_file_operation(ctx: &mut DesfireContext, file_num: u8, op: ValueOp, value: Option<u32>) -> Result<Option<u32>> {
    let mut data = Vec::with_capacity(5);
    data.push(file_num);
    if op != ValueOp::Get {
        let amount = value.ok_or(Error::InvalidArgument("value operation requires an amount"))?;
        data.write_u32::<LittleEndian>(amount).expect("vec write");
    }

    let response = command(ctx, op.ins(), &data)?;
    if response.len() == 4 {
        Ok(Some(read_u32(&response)))
    } else {
        Ok(None)
    }
}

pub fn get_value(ctx: &mut DesfireContext, file_num: u8) -> Result<u32> {
    value_file_operation(ctx, file_num, ValueOp::Get, None)?
        .ok_or(Error::CardExchange)
}

pub fn credit(ctx: &mut DesfireContext, file_num: u8, value: u32) -> Result<()> {
    value_file_operation(ctx, file_num, ValueOp::Credit, Some(value))?;
    Ok(())
}

pub fn limited_credit(ctx: &mut DesfireContext, file_num: u8, value: u32) -> Result<()> {
    value_file_operation(ctx, file_num, ValueOp::LimitedCredit, Some(value))?;
    Ok(())
}

pub fn debit(ctx: &mut DesfireContext, file_num: u8, value: u32) -> Result<()> {
    value_file_operation(ctx, file_num, ValueOp::Debit, Some(value))?;
    Ok(())
}

/// Commit the transaction; `options` requests the EV2 transaction MAC
/// counter/value in the response.
pub fn commit_transaction(ctx: &mut DesfireContext, options: Option<u8>) -> Result<Vec<u8>> {
    match options {
        Some(options) => command(ctx, ins::COMMIT_TRANSACTION, &[options]),
        None => command(ctx, ins::COMMIT_TRANSACTION, &[]),
    }
}

pub fn abort_transaction(ctx: &mut DesfireContext) -> Result<()> {
    command_no_response(ctx, ins::ABORT_TRANSACTION, &[])
}
