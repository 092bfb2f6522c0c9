/// Signal session repository
///
/// Public façade over the Signal storage adapter and the LID mapping store:
/// 1:1 and group encryption, session validation and injection, sender-key
/// distribution, and bulk PN-to-LID session migration.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    cache::TtlCache,
    error::{Error, Result},
    lid::LidMappingStore,
    signal::{
        protocol::{
            CiphertextType, PreKeyBundle, ProtocolAddress, SenderKeyName, SignalProtocol,
        },
        store::{AccountCredentials, KvSignalStore, SignalStore},
    },
    store::{namespace, KeyValueStore, WriteBatch},
    types::JID,
};

/// Outcome counts of a bulk session migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
    pub total: usize,
}

impl MigrationReport {
    fn empty() -> Self {
        Self::default()
    }

    /// Marker report for a source that is not a usable PN JID.
    fn malformed_source() -> Self {
        Self {
            migrated: 0,
            skipped: 0,
            total: 1,
        }
    }
}

/// Why a session failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    InvalidJid,
    NoSession,
    NoOpenSession,
    ValidationError,
}

impl ValidationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJid => "invalid-jid",
            Self::NoSession => "no-session",
            Self::NoOpenSession => "no-open-session",
            Self::ValidationError => "validation-error",
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a session validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionValidation {
    pub exists: bool,
    pub reason: Option<ValidationFailure>,
}

impl SessionValidation {
    fn open() -> Self {
        Self {
            exists: true,
            reason: None,
        }
    }

    fn failed(reason: ValidationFailure) -> Self {
        Self {
            exists: false,
            reason: Some(reason),
        }
    }
}

/// An encrypted 1:1 message.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    pub msg_type: CiphertextType,
    pub ciphertext: Vec<u8>,
}

/// An encrypted 1:1 message together with the JID to address on the wire.
#[derive(Debug, Clone)]
pub struct WireEncryptedMessage {
    pub message: EncryptedMessage,
    pub wire_jid: String,
}

/// An encrypted group message plus the serialized sender-key distribution
/// the recipients may need.
#[derive(Debug, Clone)]
pub struct GroupEncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub sender_key_distribution: Vec<u8>,
}

fn validation_key(jid: &JID) -> String {
    format!("validation:{}", jid)
}

fn migration_key(pn_user: &str, device: u16) -> String {
    format!("{}.{}", pn_user, device)
}

/// Signal session repository.
///
/// Encryption routes through the preferred identity: a PN peer whose LID is
/// known encrypts under the LID address, migrating any PN sessions there
/// first. Validation results and per-device migrations are memoized with a
/// one-hour lifetime; both caches are recomputable and instance-scoped.
pub struct SignalRepository {
    kv: Arc<dyn KeyValueStore>,
    mappings: Arc<LidMappingStore>,
    store: Arc<dyn SignalStore>,
    protocol: Arc<dyn SignalProtocol>,
    validation_cache: TtlCache<SessionValidation>,
    migration_cache: TtlCache<()>,
}

impl SignalRepository {
    /// Create a repository over the default KV-backed Signal store.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        mappings: Arc<LidMappingStore>,
        protocol: Arc<dyn SignalProtocol>,
        credentials: AccountCredentials,
    ) -> Self {
        let store = Arc::new(KvSignalStore::new(kv.clone(), mappings.clone(), credentials));
        Self::with_store(kv, mappings, store, protocol)
    }

    /// Create a repository over a custom Signal store implementation.
    pub fn with_store(
        kv: Arc<dyn KeyValueStore>,
        mappings: Arc<LidMappingStore>,
        store: Arc<dyn SignalStore>,
        protocol: Arc<dyn SignalProtocol>,
    ) -> Self {
        Self {
            kv,
            mappings,
            store,
            protocol,
            validation_cache: TtlCache::default(),
            migration_cache: TtlCache::default(),
        }
    }

    /// Encrypt a 1:1 message for a peer, routing through its preferred
    /// identity and migrating PN sessions to a freshly learned LID first.
    pub async fn encrypt_message(&self, jid: &str, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let jid = JID::parse(jid)?;
        let target = self.optimal_encryption_jid(&jid).await?;

        let validation = self.validate_session_at(&target).await?;
        if !validation.exists {
            return Err(Error::NoSession(target.to_string()));
        }

        let address = ProtocolAddress::from_jid(&target);
        let ciphertext = self
            .protocol
            .encrypt(self.store.as_ref(), &address, plaintext)
            .await?;
        Ok(EncryptedMessage {
            msg_type: CiphertextType::from_signal_type(ciphertext.signal_type),
            ciphertext: ciphertext.serialized,
        })
    }

    /// Encrypt against `encryption_jid` while the caller keeps addressing
    /// the network with `wire_jid`, which passes through unchanged.
    pub async fn encrypt_with_wire(
        &self,
        encryption_jid: &str,
        wire_jid: &str,
        plaintext: &[u8],
    ) -> Result<WireEncryptedMessage> {
        let message = self.encrypt_message(encryption_jid, plaintext).await?;
        Ok(WireEncryptedMessage {
            message,
            wire_jid: wire_jid.to_string(),
        })
    }

    /// Decrypt a 1:1 message of the given wire type (`pkmsg` or `msg`).
    pub async fn decrypt_message(
        &self,
        jid: &str,
        message_type: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let jid = JID::parse(jid)?;
        let address = ProtocolAddress::from_jid(&jid);
        match message_type.parse::<CiphertextType>()? {
            CiphertextType::PreKey => {
                self.protocol
                    .decrypt_prekey_message(self.store.as_ref(), &address, ciphertext)
                    .await
            }
            CiphertextType::Whisper => {
                self.protocol
                    .decrypt_whisper_message(self.store.as_ref(), &address, ciphertext)
                    .await
            }
        }
    }

    /// Encrypt a group message as `me`, returning the ciphertext and the
    /// serialized sender-key distribution message for it.
    pub async fn encrypt_group_message(
        &self,
        group_id: &str,
        me: &str,
        plaintext: &[u8],
    ) -> Result<GroupEncryptedMessage> {
        if group_id.trim().is_empty() {
            return Err(Error::MissingGroupId);
        }
        let me = JID::parse(me)?;
        let name = SenderKeyName::new(group_id, ProtocolAddress::from_jid(&me));

        self.ensure_sender_key(&name).await?;
        let distribution = self
            .protocol
            .create_distribution_message(self.store.as_ref(), &name)
            .await?;
        let ciphertext = self
            .protocol
            .group_encrypt(self.store.as_ref(), &name, plaintext)
            .await?;
        Ok(GroupEncryptedMessage {
            ciphertext,
            sender_key_distribution: distribution,
        })
    }

    /// Decrypt a group message authored by `author`.
    pub async fn decrypt_group_message(
        &self,
        group_id: &str,
        author: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if group_id.trim().is_empty() {
            return Err(Error::MissingGroupId);
        }
        let author = JID::parse(author)?;
        let name = SenderKeyName::new(group_id, ProtocolAddress::from_jid(&author));
        self.protocol
            .group_decrypt(self.store.as_ref(), &name, ciphertext)
            .await
    }

    /// Process a received sender-key distribution message from `author`.
    pub async fn process_sender_key_distribution(
        &self,
        group_id: &str,
        author: &str,
        distribution: &[u8],
    ) -> Result<()> {
        if group_id.trim().is_empty() {
            return Err(Error::MissingGroupId);
        }
        let author = JID::parse(author)?;
        let name = SenderKeyName::new(group_id, ProtocolAddress::from_jid(&author));

        self.ensure_sender_key(&name).await?;
        self.protocol
            .process_distribution_message(self.store.as_ref(), &name, distribution)
            .await
    }

    /// Install an outgoing session at `jid` from a peer's pre-key bundle.
    pub async fn inject_session(&self, jid: &str, bundle: &PreKeyBundle) -> Result<()> {
        let jid = JID::parse(jid)?;
        let address = ProtocolAddress::from_jid(&jid);
        self.protocol
            .init_outgoing_session(self.store.as_ref(), &address, bundle)
            .await?;
        debug!("Injected outgoing session at {}", address);
        Ok(())
    }

    /// Check whether an open Signal session exists at `jid`. Results are
    /// memoized per JID; [`delete_session`](Self::delete_session) and
    /// session migration evict affected entries.
    pub async fn validate_session(&self, jid: &str) -> Result<SessionValidation> {
        match JID::parse(jid) {
            Ok(jid) => self.validate_session_at(&jid).await,
            Err(_) => Ok(SessionValidation::failed(ValidationFailure::InvalidJid)),
        }
    }

    async fn validate_session_at(&self, jid: &JID) -> Result<SessionValidation> {
        let key = validation_key(jid);
        if let Some(cached) = self.validation_cache.get(&key) {
            return Ok(*cached);
        }

        let address = ProtocolAddress::from_jid(jid);
        let result = match self.store.load_session(&address).await {
            Ok(Some(record)) => match self.protocol.deserialize_session(&record) {
                Ok(session) if session.has_open_session() => SessionValidation::open(),
                Ok(_) => SessionValidation::failed(ValidationFailure::NoOpenSession),
                Err(e) => {
                    warn!("Session record at {} failed to deserialize: {}", address, e);
                    SessionValidation::failed(ValidationFailure::ValidationError)
                }
            },
            Ok(None) => SessionValidation::failed(ValidationFailure::NoSession),
            Err(e) => {
                warn!("Session load at {} failed: {}", address, e);
                SessionValidation::failed(ValidationFailure::ValidationError)
            }
        };

        self.validation_cache.insert(key, result);
        Ok(result)
    }

    /// Remove the session record at `jid` and evict its validation entry.
    /// Invalid JIDs are a no-op.
    pub async fn delete_session(&self, jid: &str) -> Result<()> {
        let jid = match JID::parse(jid) {
            Ok(jid) => jid,
            Err(e) => {
                warn!("Ignoring session delete for invalid JID: {}", e);
                return Ok(());
            }
        };

        let address = ProtocolAddress::from_jid(&jid);
        let mut batch = WriteBatch::new();
        batch.delete(namespace::SESSION, address.to_string());
        self.kv.commit(batch).await?;

        self.validation_cache.remove(&validation_key(&jid));
        debug!("Deleted session at {}", address);
        Ok(())
    }

    /// Relocate every open PN session of `source`'s user to the equivalent
    /// LID addresses of `target`, across all known devices, in one atomic
    /// batch. Devices migrated recently (per the migration cache) are left
    /// alone. On failure nothing moves and no cache is touched.
    pub async fn migrate_session(&self, source: &str, target: &str) -> Result<MigrationReport> {
        let source = match JID::parse(source) {
            Ok(source) if source.is_any_pn() => source,
            _ => return Ok(MigrationReport::malformed_source()),
        };
        let target = match JID::parse(target) {
            Ok(target) if target.is_any_lid() => target,
            _ => return Ok(MigrationReport::empty()),
        };

        let Some(raw) = self.kv.get_one(namespace::DEVICE_LIST, &source.user).await? else {
            return Ok(MigrationReport::empty());
        };
        let mut devices = parse_device_list(&source.user, &raw);
        if !devices.contains(&source.device) {
            devices.push(source.device);
        }
        let total = devices.len();

        let work: Vec<u16> = devices
            .into_iter()
            .filter(|device| {
                self.migration_cache
                    .get(&migration_key(&source.user, *device))
                    .is_none()
            })
            .collect();

        let pn_keys: Vec<String> = work
            .iter()
            .map(|device| ProtocolAddress::new(source.user.clone(), *device as u32).to_string())
            .collect();
        let key_refs: Vec<&str> = pn_keys.iter().map(String::as_str).collect();
        let records = self.kv.get(namespace::SESSION, &key_refs).await?;

        let mut batch = WriteBatch::new();
        let mut migrated_devices = Vec::new();
        for (device, pn_key) in work.iter().zip(&pn_keys) {
            let Some(record) = records.get(pn_key) else {
                continue;
            };
            match self.protocol.deserialize_session(record) {
                Ok(session) if session.has_open_session() => {
                    let lid_jid = JID::lid(target.user.as_str(), *device);
                    batch.set(
                        namespace::SESSION,
                        ProtocolAddress::from_jid(&lid_jid).to_string(),
                        record.clone(),
                    );
                    batch.delete(namespace::SESSION, pn_key.clone());
                    migrated_devices.push(*device);
                }
                Ok(_) => debug!("Not migrating closed session at {}", pn_key),
                Err(e) => warn!("Not migrating undecodable session at {}: {}", pn_key, e),
            }
        }

        if !batch.is_empty() {
            self.kv.commit(batch).await?;
        }

        for device in &migrated_devices {
            self.migration_cache
                .insert(migration_key(&source.user, *device), ());
            self.validation_cache
                .remove(&validation_key(&JID::pn(source.user.as_str(), *device)));
            self.validation_cache
                .remove(&validation_key(&JID::lid(target.user.as_str(), *device)));
        }

        let migrated = migrated_devices.len();
        if migrated > 0 {
            info!(
                "Migrated {}/{} sessions of {} to LID {}",
                migrated, total, source.user, target.user
            );
        }
        Ok(MigrationReport {
            migrated,
            skipped: total - migrated,
            total,
        })
    }

    /// Flush every in-memory cache. Persistent state is untouched.
    pub fn destroy(&self) {
        self.validation_cache.clear();
        self.migration_cache.clear();
        self.mappings.clear_cache();
        debug!("Flushed signal repository caches");
    }

    /// Pick the address to encrypt under: the peer's LID when one is known
    /// and carries (or can receive) a session, the original JID otherwise.
    async fn optimal_encryption_jid(&self, jid: &JID) -> Result<JID> {
        if !jid.is_any_pn() {
            return Ok(jid.clone());
        }
        let Some(lid) = self.mappings.get_lid_for_pn(&jid.to_string()).await? else {
            return Ok(jid.clone());
        };

        if self.validate_session_at(&lid).await?.exists {
            return Ok(lid);
        }

        // LID known but no LID session yet: pull any PN sessions over.
        let report = self.migrate_session(&jid.to_string(), &lid.to_string()).await?;
        if report.migrated > 0 {
            debug!("Encrypting to {} under freshly migrated LID {}", jid, lid);
            return Ok(lid);
        }
        Ok(jid.clone())
    }

    /// Create an empty sender-key record for `name` unless one exists.
    async fn ensure_sender_key(&self, name: &SenderKeyName) -> Result<()> {
        if self.store.load_sender_key(name).await?.is_none() {
            let record = self.protocol.new_sender_key_record();
            self.store.store_sender_key(name, &record).await?;
        }
        Ok(())
    }
}

/// Device lists persist as a JSON array of device-number strings.
fn parse_device_list(pn_user: &str, raw: &[u8]) -> Vec<u16> {
    let entries: Vec<String> = match serde_json::from_slice(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Unusable device list for {}: {}", pn_user, e);
            return Vec::new();
        }
    };
    entries
        .iter()
        .filter_map(|entry| match entry.parse::<u16>() {
            Ok(device) => Some(device),
            Err(_) => {
                warn!("Ignoring bad device number {:?} for {}", entry, pn_user);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signal::{protocol::CiphertextMessage, SessionRecord, WHISPER_MESSAGE_TYPE},
        store::MemoryKeyValueStore,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const OPEN_SESSION: &[u8] = br#"{"open":true}"#;
    const CLOSED_SESSION: &[u8] = br#"{"open":false}"#;

    struct FakeRecord {
        raw: Vec<u8>,
        open: bool,
    }

    impl SessionRecord for FakeRecord {
        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(self.raw.clone())
        }

        fn has_open_session(&self) -> bool {
            self.open
        }
    }

    /// Cipher suite double: records are JSON flags, ciphertexts reversed
    /// plaintexts, and every encrypt address is logged.
    #[derive(Default)]
    struct FakeProtocol {
        encrypted_at: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SignalProtocol for FakeProtocol {
        fn deserialize_session(&self, bytes: &[u8]) -> Result<Box<dyn SessionRecord>> {
            let value: serde_json::Value = serde_json::from_slice(bytes)
                .map_err(|e| Error::Cipher(format!("bad session record: {}", e)))?;
            let open = value.get("open").and_then(|v| v.as_bool()).unwrap_or(false);
            Ok(Box::new(FakeRecord {
                raw: bytes.to_vec(),
                open,
            }))
        }

        fn new_sender_key_record(&self) -> Vec<u8> {
            b"{}".to_vec()
        }

        async fn encrypt(
            &self,
            store: &dyn SignalStore,
            remote: &ProtocolAddress,
            plaintext: &[u8],
        ) -> Result<CiphertextMessage> {
            let record = store
                .load_session(remote)
                .await?
                .ok_or_else(|| Error::Cipher(format!("no session at {}", remote)))?;
            self.deserialize_session(&record)?;
            self.encrypted_at.lock().unwrap().push(remote.to_string());

            let mut out = plaintext.to_vec();
            out.reverse();
            Ok(CiphertextMessage {
                signal_type: WHISPER_MESSAGE_TYPE,
                serialized: out,
            })
        }

        async fn decrypt_prekey_message(
            &self,
            store: &dyn SignalStore,
            remote: &ProtocolAddress,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>> {
            store.store_session(remote, OPEN_SESSION).await?;
            let mut out = ciphertext.to_vec();
            out.reverse();
            Ok(out)
        }

        async fn decrypt_whisper_message(
            &self,
            store: &dyn SignalStore,
            remote: &ProtocolAddress,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>> {
            store
                .load_session(remote)
                .await?
                .ok_or_else(|| Error::Cipher(format!("no session at {}", remote)))?;
            let mut out = ciphertext.to_vec();
            out.reverse();
            Ok(out)
        }

        async fn init_outgoing_session(
            &self,
            store: &dyn SignalStore,
            remote: &ProtocolAddress,
            _bundle: &PreKeyBundle,
        ) -> Result<()> {
            store.store_session(remote, OPEN_SESSION).await
        }

        async fn group_encrypt(
            &self,
            store: &dyn SignalStore,
            name: &SenderKeyName,
            plaintext: &[u8],
        ) -> Result<Vec<u8>> {
            store
                .load_sender_key(name)
                .await?
                .ok_or_else(|| Error::Cipher(format!("no sender key for {}", name)))?;
            let mut out = plaintext.to_vec();
            out.reverse();
            Ok(out)
        }

        async fn group_decrypt(
            &self,
            store: &dyn SignalStore,
            name: &SenderKeyName,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>> {
            store
                .load_sender_key(name)
                .await?
                .ok_or_else(|| Error::Cipher(format!("no sender key for {}", name)))?;
            let mut out = ciphertext.to_vec();
            out.reverse();
            Ok(out)
        }

        async fn create_distribution_message(
            &self,
            store: &dyn SignalStore,
            name: &SenderKeyName,
        ) -> Result<Vec<u8>> {
            store
                .load_sender_key(name)
                .await?
                .ok_or_else(|| Error::Cipher(format!("no sender key for {}", name)))?;
            Ok(format!("skdm:{}", name).into_bytes())
        }

        async fn process_distribution_message(
            &self,
            store: &dyn SignalStore,
            name: &SenderKeyName,
            message: &[u8],
        ) -> Result<()> {
            store.store_sender_key(name, message).await
        }
    }

    /// Memory KV with switchable commit failures.
    #[derive(Default)]
    struct FlakyKv {
        inner: MemoryKeyValueStore,
        fail_commits: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyKv {
        async fn get(
            &self,
            namespace: &str,
            keys: &[&str],
        ) -> Result<std::collections::HashMap<String, bytes::Bytes>> {
            self.inner.get(namespace, keys).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<()> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(Error::Storage("injected commit failure".to_string()));
            }
            self.inner.commit(batch).await
        }

        async fn entries(&self, namespace: &str) -> Result<Vec<(String, bytes::Bytes)>> {
            self.inner.entries(namespace).await
        }
    }

    fn credentials() -> AccountCredentials {
        AccountCredentials {
            registration_id: 12345,
            identity_public: vec![7u8; 32],
            identity_private: vec![9u8; 32],
        }
    }

    struct Fixture {
        kv: Arc<dyn KeyValueStore>,
        protocol: Arc<FakeProtocol>,
        repo: SignalRepository,
    }

    fn fixture_with_kv(kv: Arc<dyn KeyValueStore>) -> Fixture {
        let mappings = Arc::new(LidMappingStore::new(kv.clone()));
        let protocol = Arc::new(FakeProtocol::default());
        let repo = SignalRepository::new(kv.clone(), mappings.clone(), protocol.clone(), credentials());
        Fixture { kv, protocol, repo }
    }

    fn fixture() -> Fixture {
        fixture_with_kv(Arc::new(MemoryKeyValueStore::new()))
    }

    async fn seed_session(kv: &dyn KeyValueStore, address: &str, record: &'static [u8]) {
        let mut batch = WriteBatch::new();
        batch.set(namespace::SESSION, address, record);
        kv.commit(batch).await.unwrap();
    }

    async fn seed_device_list(kv: &dyn KeyValueStore, user: &str, devices: &[&str]) {
        let mut batch = WriteBatch::new();
        batch.set(
            namespace::DEVICE_LIST,
            user,
            serde_json::to_vec(devices).unwrap(),
        );
        kv.commit(batch).await.unwrap();
    }

    async fn store_mapping(fx: &Fixture) {
        let mappings = LidMappingStore::new(fx.kv.clone());
        mappings
            .store("abcd@lid", "15551234567@s.whatsapp.net")
            .await
            .unwrap();
    }

    async fn session_exists(kv: &dyn KeyValueStore, address: &str) -> bool {
        kv.get_one(namespace::SESSION, address).await.unwrap().is_some()
    }

    #[tokio::test]
    async fn test_migration_moves_open_sessions() {
        let fx = fixture();
        seed_device_list(fx.kv.as_ref(), "15551234567", &["0", "3", "99"]).await;
        seed_session(fx.kv.as_ref(), "15551234567.0", OPEN_SESSION).await;
        seed_session(fx.kv.as_ref(), "15551234567.3", OPEN_SESSION).await;

        let report = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "abcd@lid")
            .await
            .unwrap();
        assert_eq!(
            report,
            MigrationReport {
                migrated: 2,
                skipped: 1,
                total: 3
            }
        );

        assert!(session_exists(fx.kv.as_ref(), "abcd.0").await);
        assert!(session_exists(fx.kv.as_ref(), "abcd.3").await);
        assert!(!session_exists(fx.kv.as_ref(), "15551234567.0").await);
        assert!(!session_exists(fx.kv.as_ref(), "15551234567.3").await);
    }

    #[tokio::test]
    async fn test_migration_guards() {
        let fx = fixture();

        // Malformed or non-PN sources flag total = 1.
        let report = fx.repo.migrate_session("abcd@lid", "efgh@lid").await.unwrap();
        assert_eq!(report, MigrationReport::malformed_source());
        let report = fx.repo.migrate_session("garbage", "abcd@lid").await.unwrap();
        assert_eq!(report, MigrationReport::malformed_source());

        // Non-LID targets are a quiet no-op.
        let report = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "15559999999@s.whatsapp.net")
            .await
            .unwrap();
        assert_eq!(report, MigrationReport::empty());

        // Unknown device list too.
        let report = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "abcd@lid")
            .await
            .unwrap();
        assert_eq!(report, MigrationReport::empty());
    }

    #[tokio::test]
    async fn test_migration_skips_closed_sessions() {
        let fx = fixture();
        seed_device_list(fx.kv.as_ref(), "15551234567", &["0"]).await;
        seed_session(fx.kv.as_ref(), "15551234567.0", CLOSED_SESSION).await;

        let report = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "abcd@lid")
            .await
            .unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.total, 1);
        assert!(session_exists(fx.kv.as_ref(), "15551234567.0").await);
    }

    #[tokio::test]
    async fn test_migration_remembers_migrated_devices() {
        let fx = fixture();
        seed_device_list(fx.kv.as_ref(), "15551234567", &["0", "3"]).await;
        seed_session(fx.kv.as_ref(), "15551234567.0", OPEN_SESSION).await;
        seed_session(fx.kv.as_ref(), "15551234567.3", OPEN_SESSION).await;

        let first = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "abcd@lid")
            .await
            .unwrap();
        assert_eq!(first.migrated, 2);

        // Even if a PN record reappears, recently migrated devices are not
        // touched again.
        seed_session(fx.kv.as_ref(), "15551234567.0", OPEN_SESSION).await;
        let second = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "abcd@lid")
            .await
            .unwrap();
        assert_eq!(second.migrated, 0);
        assert_eq!(second.total, 2);
        assert!(session_exists(fx.kv.as_ref(), "15551234567.0").await);
    }

    #[tokio::test]
    async fn test_migration_failure_changes_nothing() {
        let flaky = Arc::new(FlakyKv::default());
        let fx = fixture_with_kv(flaky.clone());
        seed_device_list(fx.kv.as_ref(), "15551234567", &["0", "3", "99"]).await;
        seed_session(fx.kv.as_ref(), "15551234567.0", OPEN_SESSION).await;
        seed_session(fx.kv.as_ref(), "15551234567.3", OPEN_SESSION).await;

        flaky.fail_commits.store(true, Ordering::SeqCst);
        let result = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "abcd@lid")
            .await;
        assert!(result.is_err());
        flaky.fail_commits.store(false, Ordering::SeqCst);

        assert!(session_exists(fx.kv.as_ref(), "15551234567.0").await);
        assert!(session_exists(fx.kv.as_ref(), "15551234567.3").await);
        assert!(!session_exists(fx.kv.as_ref(), "abcd.0").await);

        // The migration cache was not marked, so a retry succeeds fully.
        let report = fx
            .repo
            .migrate_session("15551234567@s.whatsapp.net", "abcd@lid")
            .await
            .unwrap();
        assert_eq!(
            report,
            MigrationReport {
                migrated: 2,
                skipped: 1,
                total: 3
            }
        );
    }

    #[tokio::test]
    async fn test_encrypt_migrates_and_prefers_lid() {
        let fx = fixture();
        store_mapping(&fx).await;
        seed_device_list(fx.kv.as_ref(), "15551234567", &["0"]).await;
        seed_session(fx.kv.as_ref(), "15551234567.0", OPEN_SESSION).await;

        let message = fx
            .repo
            .encrypt_message("15551234567@s.whatsapp.net", b"hello")
            .await
            .unwrap();
        assert_eq!(message.msg_type, CiphertextType::Whisper);
        assert_eq!(message.ciphertext, b"olleh".to_vec());

        assert_eq!(
            *fx.protocol.encrypted_at.lock().unwrap(),
            vec!["abcd.0".to_string()]
        );
        assert!(session_exists(fx.kv.as_ref(), "abcd.0").await);
        assert!(!session_exists(fx.kv.as_ref(), "15551234567.0").await);
    }

    #[tokio::test]
    async fn test_encrypt_uses_existing_lid_session() {
        let fx = fixture();
        store_mapping(&fx).await;
        seed_session(fx.kv.as_ref(), "abcd.0", OPEN_SESSION).await;

        fx.repo
            .encrypt_message("15551234567@s.whatsapp.net", b"hello")
            .await
            .unwrap();
        assert_eq!(
            *fx.protocol.encrypted_at.lock().unwrap(),
            vec!["abcd.0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_encrypt_falls_back_to_pn_without_mapping() {
        let fx = fixture();
        seed_session(fx.kv.as_ref(), "15551234567.0", OPEN_SESSION).await;

        fx.repo
            .encrypt_message("15551234567@s.whatsapp.net", b"hello")
            .await
            .unwrap();
        assert_eq!(
            *fx.protocol.encrypted_at.lock().unwrap(),
            vec!["15551234567.0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_encrypt_without_session_fails() {
        let fx = fixture();
        let result = fx
            .repo
            .encrypt_message("15551234567@s.whatsapp.net", b"hello")
            .await;
        assert!(matches!(result, Err(Error::NoSession(_))));
    }

    #[tokio::test]
    async fn test_encrypt_with_wire_passes_wire_jid_through() {
        let fx = fixture();
        seed_session(fx.kv.as_ref(), "abcd.0", OPEN_SESSION).await;

        let message = fx
            .repo
            .encrypt_with_wire("abcd@lid", "15551234567@s.whatsapp.net", b"hello")
            .await
            .unwrap();
        assert_eq!(message.wire_jid, "15551234567@s.whatsapp.net");
        assert_eq!(message.message.ciphertext, b"olleh".to_vec());
    }

    #[tokio::test]
    async fn test_decrypt_dispatch() {
        let fx = fixture();

        // A pre-key message installs the incoming session.
        let plaintext = fx
            .repo
            .decrypt_message("abcd@lid", "pkmsg", b"olleh")
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello".to_vec());
        assert!(session_exists(fx.kv.as_ref(), "abcd.0").await);

        let plaintext = fx
            .repo
            .decrypt_message("abcd@lid", "msg", b"olleh")
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello".to_vec());

        let result = fx.repo.decrypt_message("abcd@lid", "sticker", b"x").await;
        assert!(matches!(result, Err(Error::UnknownCiphertextType(_))));
    }

    #[tokio::test]
    async fn test_validate_session_reasons_and_caching() {
        let fx = fixture();

        let validation = fx.repo.validate_session("not a jid").await.unwrap();
        assert_eq!(validation.reason, Some(ValidationFailure::InvalidJid));

        let validation = fx.repo.validate_session("abcd@lid").await.unwrap();
        assert_eq!(validation.reason, Some(ValidationFailure::NoSession));

        // The miss is memoized: a session appearing behind the cache's back
        // is not seen until the caches flush.
        seed_session(fx.kv.as_ref(), "abcd.0", OPEN_SESSION).await;
        let validation = fx.repo.validate_session("abcd@lid").await.unwrap();
        assert!(!validation.exists);

        fx.repo.destroy();
        let validation = fx.repo.validate_session("abcd@lid").await.unwrap();
        assert!(validation.exists);
        assert_eq!(validation.reason, None);
    }

    #[tokio::test]
    async fn test_validate_session_closed_record() {
        let fx = fixture();
        seed_session(fx.kv.as_ref(), "abcd.0", CLOSED_SESSION).await;

        let validation = fx.repo.validate_session("abcd@lid").await.unwrap();
        assert!(!validation.exists);
        assert_eq!(validation.reason, Some(ValidationFailure::NoOpenSession));
    }

    #[tokio::test]
    async fn test_delete_session_evicts_validation_cache() {
        let fx = fixture();
        seed_session(fx.kv.as_ref(), "abcd.0", OPEN_SESSION).await;

        assert!(fx.repo.validate_session("abcd@lid").await.unwrap().exists);
        fx.repo.delete_session("abcd@lid").await.unwrap();

        let validation = fx.repo.validate_session("abcd@lid").await.unwrap();
        assert!(!validation.exists);
        assert!(!session_exists(fx.kv.as_ref(), "abcd.0").await);

        // Invalid JIDs are only warned about.
        fx.repo.delete_session("not a jid").await.unwrap();
    }

    #[tokio::test]
    async fn test_group_roundtrip_with_distribution() {
        let fx = fixture();

        let message = fx
            .repo
            .encrypt_group_message("123-456@g.us", "abcd@lid", b"hello group")
            .await
            .unwrap();
        assert!(!message.sender_key_distribution.is_empty());

        let plaintext = fx
            .repo
            .decrypt_group_message("123-456@g.us", "abcd@lid", &message.ciphertext)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello group".to_vec());
    }

    #[tokio::test]
    async fn test_process_sender_key_distribution() {
        let fx = fixture();

        fx.repo
            .process_sender_key_distribution("123-456@g.us", "efgh@lid", b"skdm-bytes")
            .await
            .unwrap();

        // The author's sender key can now decrypt.
        let plaintext = fx
            .repo
            .decrypt_group_message("123-456@g.us", "efgh@lid", b"olleh")
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello".to_vec());

        let result = fx
            .repo
            .process_sender_key_distribution("", "efgh@lid", b"skdm-bytes")
            .await;
        assert!(matches!(result, Err(Error::MissingGroupId)));
    }

    #[tokio::test]
    async fn test_inject_session() {
        let fx = fixture();
        let bundle = PreKeyBundle {
            registration_id: 555,
            device_id: 0,
            pre_key_id: Some(1),
            pre_key_public: Some(vec![1u8; 33]),
            signed_pre_key_id: 2,
            signed_pre_key_public: vec![2u8; 33],
            signed_pre_key_signature: vec![3u8; 64],
            identity_key: vec![4u8; 33],
        };

        fx.repo.inject_session("abcd@lid", &bundle).await.unwrap();
        assert!(fx.repo.validate_session("abcd@lid").await.unwrap().exists);

        let message = fx.repo.encrypt_message("abcd@lid", b"hi").await.unwrap();
        assert_eq!(message.ciphertext, b"ih".to_vec());
    }
}
