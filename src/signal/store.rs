/// Signal storage adapter over the persistent key-value store

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::{
    error::Result,
    lid::LidMappingStore,
    signal::{
        protocol::{ProtocolAddress, SenderKeyName},
        DJB_TYPE,
    },
    store::{namespace, KeyValueStore, WriteBatch},
};

/// Our own long-term Signal identity, supplied by the host's credential
/// store.
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub registration_id: u32,
    /// Raw 32-byte X25519 public key, without the type byte.
    pub identity_public: Vec<u8>,
    pub identity_private: Vec<u8>,
}

/// Identity key pair as handed to the cipher suite. The public key carries
/// the X25519 type byte prefix.
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

/// Capability set the Signal cipher suite needs from storage.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<Bytes>>;
    async fn store_session(&self, address: &ProtocolAddress, record: &[u8]) -> Result<()>;
    async fn load_pre_key(&self, id: u32) -> Result<Option<Bytes>>;
    async fn remove_pre_key(&self, id: u32) -> Result<()>;
    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<Bytes>>;
    async fn load_sender_key(&self, name: &SenderKeyName) -> Result<Option<Bytes>>;
    async fn store_sender_key(&self, name: &SenderKeyName, record: &[u8]) -> Result<()>;
    async fn is_trusted_identity(&self, address: &ProtocolAddress, identity: &[u8]) -> Result<bool>;
    async fn our_registration_id(&self) -> Result<u32>;
    async fn our_identity(&self) -> Result<IdentityKeyPair>;
}

/// [`SignalStore`] backed by the key-value store.
///
/// Session loads prefer the linked identity: a request addressed to a PN
/// user whose LID is known locally is answered from the LID-addressed record
/// when one exists, so encryption keeps working across identity migration.
/// Everything else is a direct namespace passthrough.
pub struct KvSignalStore {
    kv: Arc<dyn KeyValueStore>,
    mappings: Arc<LidMappingStore>,
    credentials: AccountCredentials,
}

impl KvSignalStore {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        mappings: Arc<LidMappingStore>,
        credentials: AccountCredentials,
    ) -> Self {
        Self {
            kv,
            mappings,
            credentials,
        }
    }
}

#[async_trait]
impl SignalStore for KvSignalStore {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<Bytes>> {
        // Already LID-addressed: load directly.
        if self
            .mappings
            .stored_pn_for_lid_user(&address.name)
            .await?
            .is_some()
        {
            return self.kv.get_one(namespace::SESSION, &address.to_string()).await;
        }

        // PN-addressed with a known LID: prefer the migrated record. Lookups
        // stay local; the directory is never consulted on this path.
        if let Some(lid_user) = self.mappings.stored_lid_for_pn_user(&address.name).await? {
            let lid_address = ProtocolAddress::new(lid_user.as_str(), address.device_id);
            if let Some(record) = self
                .kv
                .get_one(namespace::SESSION, &lid_address.to_string())
                .await?
            {
                debug!("Serving session {} from LID address {}", address, lid_address);
                return Ok(Some(record));
            }
        }

        self.kv.get_one(namespace::SESSION, &address.to_string()).await
    }

    async fn store_session(&self, address: &ProtocolAddress, record: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.set(namespace::SESSION, address.to_string(), record.to_vec());
        self.kv.commit(batch).await
    }

    async fn load_pre_key(&self, id: u32) -> Result<Option<Bytes>> {
        self.kv.get_one(namespace::PRE_KEY, &id.to_string()).await
    }

    async fn remove_pre_key(&self, id: u32) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(namespace::PRE_KEY, id.to_string());
        self.kv.commit(batch).await
    }

    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<Bytes>> {
        self.kv
            .get_one(namespace::SIGNED_PRE_KEY, &id.to_string())
            .await
    }

    async fn load_sender_key(&self, name: &SenderKeyName) -> Result<Option<Bytes>> {
        self.kv.get_one(namespace::SENDER_KEY, &name.to_string()).await
    }

    async fn store_sender_key(&self, name: &SenderKeyName, record: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.set(namespace::SENDER_KEY, name.to_string(), record.to_vec());
        self.kv.commit(batch).await
    }

    async fn is_trusted_identity(
        &self,
        _address: &ProtocolAddress,
        _identity: &[u8],
    ) -> Result<bool> {
        // WhatsApp rotates identities across re-registrations; trust is
        // established at the pairing layer.
        Ok(true)
    }

    async fn our_registration_id(&self) -> Result<u32> {
        Ok(self.credentials.registration_id)
    }

    async fn our_identity(&self) -> Result<IdentityKeyPair> {
        let mut public = Vec::with_capacity(self.credentials.identity_public.len() + 1);
        public.push(DJB_TYPE);
        public.extend_from_slice(&self.credentials.identity_public);
        Ok(IdentityKeyPair {
            public,
            private: self.credentials.identity_private.clone(),
        })
    }
}
