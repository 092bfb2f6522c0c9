// Copyright (c) 2025 walid Contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # walid
//!
//! Identity-mapping and Signal-session core for WhatsApp clients.
//!
//! WhatsApp addresses peers in two parallel namespaces: legacy phone-number
//! identities (PN) and privacy-preserving linked identities (LID). This
//! crate keeps the bidirectional user-level index between the two, routes
//! Signal Protocol encryption through the preferred identity, and migrates
//! per-device sessions from PN to LID addresses atomically as mappings
//! become known. Persistence goes through a pluggable transactional
//! key-value store; the Signal primitives themselves are consumed through
//! trait contracts.

pub mod cache;
pub mod error;
pub mod lid;
pub mod signal;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use lid::{
    DirectoryResolver, LidMappingStore, LidPnMapping, MappingStats, MessageSender, RepairReport,
    ResolvedMapping,
};
pub use signal::{
    AccountCredentials, CiphertextType, EncryptedMessage, GroupEncryptedMessage, KvSignalStore,
    MigrationReport, PreKeyBundle, ProtocolAddress, SenderKeyName, SessionValidation,
    SignalProtocol, SignalRepository, SignalStore, ValidationFailure,
};
pub use store::{namespace, KeyValueStore, MemoryKeyValueStore, WriteBatch};
pub use types::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
