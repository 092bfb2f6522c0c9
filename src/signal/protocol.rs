/// Contracts over the external Signal Protocol implementation

use async_trait::async_trait;
use std::fmt;

use crate::{
    error::{Error, Result},
    signal::{store::SignalStore, PREKEY_MESSAGE_TYPE},
    types::JID,
};

/// Signal addressing of a single device, serialized as `user.device` when
/// used as a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    pub name: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    /// Address of a JID: its user part and device number. The server is
    /// intentionally dropped; PN and LID users never collide.
    pub fn from_jid(jid: &JID) -> Self {
        Self {
            name: jid.user.clone(),
            device_id: jid.device as u32,
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// Key of a group sender key: the group plus the authoring device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderKeyName {
    pub group_id: String,
    pub sender: ProtocolAddress,
}

impl SenderKeyName {
    pub fn new(group_id: impl Into<String>, sender: ProtocolAddress) -> Self {
        Self {
            group_id: group_id.into(),
            sender,
        }
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}",
            self.group_id, self.sender.name, self.sender.device_id
        )
    }
}

/// Wire tag of an encrypted 1:1 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextType {
    /// Pre-key message establishing a fresh session (`pkmsg`).
    PreKey,
    /// Ordinary ratchet message (`msg`).
    Whisper,
}

impl CiphertextType {
    /// Map a raw Signal type tag; 3 is a pre-key message, everything else an
    /// ordinary message.
    pub fn from_signal_type(signal_type: u8) -> Self {
        if signal_type == PREKEY_MESSAGE_TYPE {
            Self::PreKey
        } else {
            Self::Whisper
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreKey => "pkmsg",
            Self::Whisper => "msg",
        }
    }
}

impl fmt::Display for CiphertextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CiphertextType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pkmsg" => Ok(Self::PreKey),
            "msg" => Ok(Self::Whisper),
            other => Err(Error::UnknownCiphertextType(other.to_string())),
        }
    }
}

/// Ciphertext produced by the session cipher, carrying its raw Signal type
/// tag.
#[derive(Debug, Clone)]
pub struct CiphertextMessage {
    pub signal_type: u8,
    pub serialized: Vec<u8>,
}

/// A peer's published pre-key bundle, used to install an outgoing session.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub pre_key_id: Option<u32>,
    pub pre_key_public: Option<Vec<u8>>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub identity_key: Vec<u8>,
}

/// Deserialized view of a stored session record. Only the operations the
/// session lifecycle needs are exposed; everything else stays inside the
/// Signal implementation.
pub trait SessionRecord: Send + Sync {
    fn serialize(&self) -> Result<Vec<u8>>;
    /// True iff the record holds an open ratchet.
    fn has_open_session(&self) -> bool;
}

/// The Signal Protocol cipher suite, supplied by the host.
///
/// Covers the session cipher, the session builder, the group cipher and the
/// group session builder of a Signal implementation. Every operation runs
/// against a [`SignalStore`] and an address; record bytes are opaque outside
/// of [`SessionRecord`]. Cipher failures surface as [`Error::Cipher`] and
/// propagate to callers unchanged.
#[async_trait]
pub trait SignalProtocol: Send + Sync {
    /// Parse stored session record bytes.
    fn deserialize_session(&self, bytes: &[u8]) -> Result<Box<dyn SessionRecord>>;

    /// Serialized form of a fresh, empty sender-key record.
    fn new_sender_key_record(&self) -> Vec<u8>;

    /// Encrypt a 1:1 message for the session at `remote`.
    async fn encrypt(
        &self,
        store: &dyn SignalStore,
        remote: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage>;

    /// Decrypt a pre-key message, installing the incoming session.
    async fn decrypt_prekey_message(
        &self,
        store: &dyn SignalStore,
        remote: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Decrypt an ordinary ratchet message.
    async fn decrypt_whisper_message(
        &self,
        store: &dyn SignalStore,
        remote: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Install an outgoing session at `remote` from a pre-key bundle.
    async fn init_outgoing_session(
        &self,
        store: &dyn SignalStore,
        remote: &ProtocolAddress,
        bundle: &PreKeyBundle,
    ) -> Result<()>;

    /// Encrypt a group message under the sender key of `name`.
    async fn group_encrypt(
        &self,
        store: &dyn SignalStore,
        name: &SenderKeyName,
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Decrypt a group message under the sender key of `name`.
    async fn group_decrypt(
        &self,
        store: &dyn SignalStore,
        name: &SenderKeyName,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Build a serialized sender-key distribution message for `name`.
    async fn create_distribution_message(
        &self,
        store: &dyn SignalStore,
        name: &SenderKeyName,
    ) -> Result<Vec<u8>>;

    /// Process a received sender-key distribution message into the record of
    /// `name`.
    async fn process_distribution_message(
        &self,
        store: &dyn SignalStore,
        name: &SenderKeyName,
        message: &[u8],
    ) -> Result<()>;
}
