//! Per-card protocol state.


use zeroize::Zeroize;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt::KeyType;
use crate::error::{Error, Result};
use crate::iso7816::card::SmartCard;


/// Largest key across the supported algorithms (3TDEA).
pub const MAX_KEY_SIZE: usize = 24;

/// Largest cipher block across the supported algorithms (AES).
pub const MAX_BLOCK_SIZE: usize = 16;

/// Maximum AN10922 diversification input.
pub const MAX_KDF_INPUT: usize = 31;


/// Which wire framing commands travel in.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CommandSet {
    /// Raw native frames: `[INS || payload]`.
    Native,
    /// Native instructions wrapped in ISO 7816 APDUs under CLA `0x90`.
    NativeIso,
    /// Plain ISO 7816-4 commands (only the ISO authentication flow).
    Iso,
}

/// Per-command protection level.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CommMode {
    Plain,
    Mac,
    Encrypted,
}

/// Secure-channel generation of the current session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SecureChannel {
    None,
    D40,
    Ev1,
    Ev2,
}

/// Pre-authentication key diversification.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KdfAlgo {
    None,
    An10922,
    /// AN10922 over a Gallagher-specific 11-byte input.
    Gallagher,
}


/// The process-visible handle to one card behind one reader.
///
/// At most one authenticated session exists per context; selecting an
/// application or failing an authentication clears it. The context is not
/// safe for concurrent use — the RF field carries one card and commands are
/// strictly serialised.
#[derive(ZeroizeOnDrop)]
pub struct DesfireContext {
    #[zeroize(skip)]
    card: Box<dyn SmartCard>,

    pub key_num: u8,
    #[zeroize(skip)]
    pub key_type: KeyType,
    key: [u8; MAX_KEY_SIZE],

    #[zeroize(skip)]
    pub kdf_algo: KdfAlgo,
    kdf_input: [u8; MAX_KDF_INPUT],
    kdf_input_len: u8,

    #[zeroize(skip)]
    pub command_set: CommandSet,
    #[zeroize(skip)]
    pub comm_mode: CommMode,
    #[zeroize(skip)]
    pub(crate) secure_channel: SecureChannel,

    pub(crate) session_key_enc: [u8; MAX_KEY_SIZE],
    pub(crate) session_key_mac: [u8; MAX_KEY_SIZE],
    pub(crate) iv: [u8; MAX_BLOCK_SIZE],
    pub(crate) ti: [u8; 4],
    pub(crate) cmd_cntr: u16,

    #[zeroize(skip)]
    pub(crate) app_selected: bool,
}

impl DesfireContext {
    pub fn new(card: Box<dyn SmartCard>, key_num: u8, key_type: KeyType, key: &[u8]) -> Result<Self> {
        if key.len() != key_type.key_length() {
            return Err(Error::InvalidArgument("key length does not match key type"));
        }
        if key_num > 0x0D {
            return Err(Error::InvalidArgument("key number out of range 0..=13"));
        }

        let mut key_buf = [0u8; MAX_KEY_SIZE];
        key_buf[..key.len()].copy_from_slice(key);

        Ok(Self {
            card,
            key_num,
            key_type,
            key: key_buf,
            kdf_algo: KdfAlgo::None,
            kdf_input: [0u8; MAX_KDF_INPUT],
            kdf_input_len: 0,
            command_set: CommandSet::Native,
            comm_mode: CommMode::Plain,
            secure_channel: SecureChannel::None,
            session_key_enc: [0u8; MAX_KEY_SIZE],
            session_key_mac: [0u8; MAX_KEY_SIZE],
            iv: [0u8; MAX_BLOCK_SIZE],
            ti: [0u8; 4],
            cmd_cntr: 0,
            app_selected: false,
        })
    }

    /// Replace the key material used for the next authentication.
    pub fn set_key(&mut self, key_num: u8, key_type: KeyType, key: &[u8]) -> Result<()> {
        if key.len() != key_type.key_length() {
            return Err(Error::InvalidArgument("key length does not match key type"));
        }
        if key_num > 0x0D {
            return Err(Error::InvalidArgument("key number out of range 0..=13"));
        }
        self.clear_session();
        self.key.zeroize();
        self.key[..key.len()].copy_from_slice(key);
        self.key_num = key_num;
        self.key_type = key_type;
        Ok(())
    }

    /// Configure pre-authentication key diversification.
    pub fn set_kdf(&mut self, algo: KdfAlgo, input: &[u8]) -> Result<()> {
        if input.len() > MAX_KDF_INPUT {
            return Err(Error::InvalidArgument("KDF input exceeds 31 bytes"));
        }
        self.kdf_algo = algo;
        self.kdf_input.zeroize();
        self.kdf_input[..input.len()].copy_from_slice(input);
        self.kdf_input_len = input.len() as u8;
        Ok(())
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key[..self.key_type.key_length()]
    }

    pub(crate) fn kdf_input(&self) -> &[u8] {
        &self.kdf_input[..usize::from(self.kdf_input_len)]
    }

    pub(crate) fn card_mut(&mut self) -> &mut dyn SmartCard {
        self.card.as_mut()
    }

    pub fn secure_channel(&self) -> SecureChannel {
        self.secure_channel
    }

    pub fn app_selected(&self) -> bool {
        self.app_selected
    }

    pub fn is_authenticated(&self) -> bool {
        self.secure_channel != SecureChannel::None
    }

    /// The EV2 transaction identifier of the current session.
    pub fn transaction_id(&self) -> [u8; 4] {
        self.ti
    }

    /// The EV2 per-session command counter.
    pub fn command_counter(&self) -> u16 {
        self.cmd_cntr
    }

    pub(crate) fn session_key_enc(&self) -> &[u8] {
        &self.session_key_enc[..self.key_type.session_key_length()]
    }

    pub(crate) fn session_key_mac(&self) -> &[u8] {
        &self.session_key_mac[..self.key_type.session_key_length()]
    }

    pub(crate) fn block_size(&self) -> usize {
        self.key_type.block_size()
    }

    pub(crate) fn clear_iv(&mut self) {
        self.iv.zeroize();
    }

    /// Drop the authenticated session: zeroise session keys, IV, transaction
    /// identifier and command counter.
    pub fn clear_session(&mut self) {
        self.secure_channel = SecureChannel::None;
        self.session_key_enc.zeroize();
        self.session_key_mac.zeroize();
        self.iv.zeroize();
        self.ti.zeroize();
        self.cmd_cntr = 0;
    }
}
