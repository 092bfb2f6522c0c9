/// Bidirectional user-level LID/PN identity mapping
///
/// WhatsApp peers are reachable under two parallel namespaces: legacy
/// phone-number identities (PN) and privacy-preserving linked identities
/// (LID). This module maintains the user-level index between the two,
/// write-through cached and backed by the `lid-mapping` namespace of the
/// persistent key-value store. Unknown mappings can be fetched in bulk from
/// an external directory service.

pub mod resolver;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    cache::TtlCache,
    error::{Error, Result},
    store::{namespace, KeyValueStore, WriteBatch},
    types::{JID, PN_SERVER},
};

pub use resolver::{DirectoryResolver, ResolvedMapping};

/// Suffix of the reverse (LID to PN) keys in the `lid-mapping` namespace.
const REVERSE_SUFFIX: &str = "_reverse";

fn reverse_key(lid_user: &str) -> String {
    format!("{}{}", lid_user, REVERSE_SUFFIX)
}

fn pn_cache_key(pn_user: &str) -> String {
    format!("pn:{}", pn_user)
}

fn lid_cache_key(lid_user: &str) -> String {
    format!("lid:{}", lid_user)
}

/// A device-specific PN/LID pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LidPnMapping {
    pub pn: JID,
    pub lid: JID,
}

/// Outcome counts of [`LidMappingStore::validate_and_repair`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Forward entries whose reverse already matched.
    pub validated: usize,
    /// Reverse entries rewritten to match their forward side.
    pub repaired: usize,
    /// Forward entries with unusable values.
    pub errors: usize,
}

/// Aggregate view over the `lid-mapping` namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingStats {
    pub total_mappings: usize,
    pub users: Vec<String>,
}

/// Addressing header of an inbound message, used to infer identity pairings.
#[derive(Debug, Clone)]
pub struct MessageSender {
    pub jid: String,
    pub participant: Option<String>,
}

/// User-level bidirectional LID/PN mapping store.
///
/// Every mapping is stored as two keys: forward (`<pn_user>` to the LID
/// user) and reverse (`<lid_user>_reverse` to the PN user), written together
/// in one batch so neither side can exist without the other. Device numbers
/// never enter the persisted keys or values; device-specific JIDs are
/// projected from user-level mappings at read time.
pub struct LidMappingStore {
    kv: Arc<dyn KeyValueStore>,
    cache: TtlCache<String>,
    resolver: Option<Arc<dyn DirectoryResolver>>,
}

impl LidMappingStore {
    /// Create a store without directory resolution; lookups are served from
    /// cache and persistent state only.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            cache: TtlCache::default(),
            resolver: None,
        }
    }

    /// Create a store that fetches unknown mappings from a directory
    /// resolver.
    pub fn with_resolver(kv: Arc<dyn KeyValueStore>, resolver: Arc<dyn DirectoryResolver>) -> Self {
        Self {
            kv,
            cache: TtlCache::default(),
            resolver: Some(resolver),
        }
    }

    /// Persist a single LID/PN pairing. Arguments are accepted in either
    /// order; exactly one must classify as LID and the other as PN.
    pub async fn store(&self, a: &str, b: &str) -> Result<()> {
        if a.trim().is_empty() || b.trim().is_empty() {
            return Err(Error::InvalidArgs("empty JID".to_string()));
        }
        let a = JID::parse(a)?;
        let b = JID::parse(b)?;
        let (lid, pn) = classify_pair(&a, &b).ok_or_else(|| {
            Error::InvalidArgs(format!("expected one LID and one PN, got {} and {}", a, b))
        })?;

        let mut batch = WriteBatch::new();
        batch.set(namespace::LID_MAPPING, pn.user.clone(), lid.user.clone());
        batch.set(namespace::LID_MAPPING, reverse_key(&lid.user), pn.user.clone());
        self.kv.commit(batch).await?;

        self.warm_cache(&pn.user, &lid.user);
        debug!("Stored LID mapping {} -> {}", pn.user, lid.user);
        Ok(())
    }

    /// Persist many pairings in one batch. Malformed pairs are logged and
    /// dropped; pairs whose mapping is already current are skipped. Returns
    /// the number of mappings actually written.
    pub async fn store_batch(&self, pairs: &[(String, String)]) -> Result<usize> {
        let mut staged = Vec::new();
        for (a, b) in pairs {
            let (a, b) = match (JID::parse(a), JID::parse(b)) {
                (Ok(a), Ok(b)) => (a, b),
                _ => {
                    warn!("Dropping malformed mapping pair ({}, {})", a, b);
                    continue;
                }
            };
            match classify_pair(&a, &b) {
                Some((lid, pn)) => staged.push((lid.user.clone(), pn.user.clone())),
                None => warn!("Dropping mapping pair without LID/PN split ({}, {})", a, b),
            }
        }
        self.store_user_mappings(staged).await
    }

    /// Resolve the device-specific LID JID for a phone-number JID.
    pub async fn get_lid_for_pn(&self, pn: &str) -> Result<Option<JID>> {
        let results = self.get_lids_for_pns(&[pn.to_string()]).await?;
        Ok(results.into_iter().next().map(|mapping| mapping.lid))
    }

    /// Resolve device-specific LID JIDs for a batch of phone-number JIDs.
    ///
    /// Known mappings are served from cache or the key-value store; full
    /// misses are collected and fetched from the directory resolver in one
    /// call, persisted, and projected back onto the original device-specific
    /// queries. Non-PN inputs are skipped, duplicates collapsed.
    pub async fn get_lids_for_pns(&self, pns: &[String]) -> Result<Vec<LidPnMapping>> {
        let mut results = Vec::new();
        // Full misses, grouped by normalized PN key. Hosted-PN queries rebase
        // to the ordinary PN server here since the mapping is user-level.
        let mut pending: HashMap<String, Vec<JID>> = HashMap::new();
        let mut seen = std::collections::HashSet::new();

        for pn in pns {
            let jid = match JID::parse(pn) {
                Ok(jid) => jid,
                Err(e) => {
                    warn!("Skipping unparseable PN query {}: {}", pn, e);
                    continue;
                }
            };
            if !jid.is_any_pn() {
                debug!("Skipping non-PN query {}", jid);
                continue;
            }
            if !seen.insert(jid.to_string()) {
                continue;
            }

            match self.stored_lid_for_pn_user(&jid.user).await? {
                Some(lid_user) => {
                    results.push(LidPnMapping {
                        lid: JID::lid(lid_user.as_str(), jid.device),
                        pn: jid,
                    });
                }
                None => {
                    let key = format!("{}@{}", jid.user, PN_SERVER);
                    pending.entry(key).or_default().push(jid);
                }
            }
        }

        if !pending.is_empty() {
            self.resolve_pending(&mut pending, &mut results).await?;
        }
        Ok(results)
    }

    /// Fetch the still-unknown PN users from the directory, persist what it
    /// returns and project the answers onto the original queries.
    async fn resolve_pending(
        &self,
        pending: &mut HashMap<String, Vec<JID>>,
        results: &mut Vec<LidPnMapping>,
    ) -> Result<()> {
        let Some(resolver) = &self.resolver else {
            debug!(
                "No directory resolver configured; {} PN users stay unresolved",
                pending.len()
            );
            return Ok(());
        };

        let keys: Vec<String> = pending.keys().cloned().collect();
        let resolved = match resolver.resolve(&keys).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Directory resolver failed for {} users: {}", keys.len(), e);
                return Ok(());
            }
        };
        if resolved.is_empty() {
            debug!("Directory resolver returned nothing for {} users", keys.len());
            return Ok(());
        }

        let staged = resolved
            .iter()
            .map(|pair| (pair.lid_user.clone(), pair.pn_user.clone()))
            .collect();
        self.store_user_mappings(staged).await?;

        for pair in resolved {
            let key = format!("{}@{}", pair.pn_user, PN_SERVER);
            if let Some(queries) = pending.remove(&key) {
                for query in queries {
                    results.push(LidPnMapping {
                        lid: JID::lid(pair.lid_user.as_str(), query.device),
                        pn: query,
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve the device-specific PN JID for a LID JID. Directory fetches
    /// never happen on this direction; absence is surfaced as `None`.
    pub async fn get_pn_for_lid(&self, lid: &str) -> Result<Option<JID>> {
        let jid = JID::parse(lid)?;
        if !jid.is_any_lid() {
            return Err(Error::InvalidArgs(format!("expected a LID, got {}", jid)));
        }

        match self.stored_pn_for_lid_user(&jid.user).await? {
            Some(pn_user) => Ok(Some(JID::pn(pn_user.as_str(), jid.device))),
            None => Ok(None),
        }
    }

    /// Cache-or-store lookup of the LID user mapped to a PN user. Never
    /// consults the directory resolver.
    pub async fn stored_lid_for_pn_user(&self, pn_user: &str) -> Result<Option<Arc<String>>> {
        let key = pn_cache_key(pn_user);
        if let Some(lid_user) = self.cache.get(&key) {
            return Ok(Some(lid_user));
        }

        match self.kv.get_one(namespace::LID_MAPPING, pn_user).await? {
            Some(value) => match mapping_value(&value) {
                Some(lid_user) => {
                    self.warm_cache(pn_user, &lid_user);
                    Ok(self.cache.get(&key))
                }
                None => {
                    warn!("Unusable forward mapping value for PN user {}", pn_user);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Cache-or-store lookup of the PN user mapped to a LID user. Never
    /// consults the directory resolver.
    pub async fn stored_pn_for_lid_user(&self, lid_user: &str) -> Result<Option<Arc<String>>> {
        let key = lid_cache_key(lid_user);
        if let Some(pn_user) = self.cache.get(&key) {
            return Ok(Some(pn_user));
        }

        match self
            .kv
            .get_one(namespace::LID_MAPPING, &reverse_key(lid_user))
            .await?
        {
            Some(value) => match mapping_value(&value) {
                Some(pn_user) => {
                    self.warm_cache(&pn_user, lid_user);
                    Ok(self.cache.get(&key))
                }
                None => {
                    warn!("Unusable reverse mapping value for LID user {}", lid_user);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Delete both sides of the mapping identified by a user id, which may
    /// be the PN (forward) or the LID (reverse) user. Returns false when no
    /// mapping exists.
    pub async fn remove(&self, user_id: &str) -> Result<bool> {
        let user = user_level(user_id);

        if let Some(value) = self.kv.get_one(namespace::LID_MAPPING, user).await? {
            // Forward hit: user is a PN user.
            let mut batch = WriteBatch::new();
            batch.delete(namespace::LID_MAPPING, user);
            if let Some(lid_user) = mapping_value(&value) {
                batch.delete(namespace::LID_MAPPING, reverse_key(&lid_user));
                self.cache.remove(&lid_cache_key(&lid_user));
            }
            self.kv.commit(batch).await?;
            self.cache.remove(&pn_cache_key(user));
            info!("Removed LID mapping for PN user {}", user);
            return Ok(true);
        }

        if let Some(value) = self
            .kv
            .get_one(namespace::LID_MAPPING, &reverse_key(user))
            .await?
        {
            // Reverse hit: user is a LID user.
            let mut batch = WriteBatch::new();
            batch.delete(namespace::LID_MAPPING, reverse_key(user));
            if let Some(pn_user) = mapping_value(&value) {
                batch.delete(namespace::LID_MAPPING, pn_user.clone());
                self.cache.remove(&pn_cache_key(&pn_user));
            }
            self.kv.commit(batch).await?;
            self.cache.remove(&lid_cache_key(user));
            info!("Removed LID mapping for LID user {}", user);
            return Ok(true);
        }

        Ok(false)
    }

    /// True iff the user id is present on either side of the mapping index.
    pub async fn has(&self, user_id: &str) -> Result<bool> {
        let user = user_level(user_id);
        let reverse = reverse_key(user);
        let found = self
            .kv
            .get(namespace::LID_MAPPING, &[user, reverse.as_str()])
            .await?;
        Ok(!found.is_empty())
    }

    /// Infer and persist an identity pairing from an inbound message header.
    pub async fn store_from_message(&self, jid: &str, participant: Option<&str>) -> Result<()> {
        let jid = JID::parse(jid)?;
        let participant = match participant {
            Some(participant) => Some(JID::parse(participant)?),
            None => None,
        };

        let Some((lid_user, pn_user)) = self.pairing_from_message(&jid, participant.as_ref()).await?
        else {
            return Ok(());
        };
        self.store_user_mappings(vec![(lid_user, pn_user)]).await?;
        Ok(())
    }

    /// Batch form of [`store_from_message`](Self::store_from_message).
    /// Conflicting pairings inside the batch (one PN user mapped to two
    /// distinct LID users) are logged; the last one wins.
    pub async fn store_from_messages(&self, messages: &[MessageSender]) -> Result<usize> {
        let mut staged: Vec<(String, String)> = Vec::new();
        let mut by_pn: HashMap<String, String> = HashMap::new();

        for message in messages {
            let jid = match JID::parse(&message.jid) {
                Ok(jid) => jid,
                Err(e) => {
                    warn!("Dropping message with malformed JID {}: {}", message.jid, e);
                    continue;
                }
            };
            let participant = match &message.participant {
                Some(participant) => match JID::parse(participant) {
                    Ok(participant) => Some(participant),
                    Err(e) => {
                        warn!("Dropping message with malformed participant {}: {}", participant, e);
                        continue;
                    }
                },
                None => None,
            };

            if let Some((lid_user, pn_user)) =
                self.pairing_from_message(&jid, participant.as_ref()).await?
            {
                if let Some(previous) = by_pn.get(&pn_user) {
                    if previous != &lid_user {
                        warn!(
                            "Conflicting LID mappings for PN user {} in batch: {} vs {}",
                            pn_user, previous, lid_user
                        );
                    }
                }
                by_pn.insert(pn_user.clone(), lid_user.clone());
                staged.push((lid_user, pn_user));
            }
        }

        // Last write wins on intra-batch conflicts.
        staged.retain(|(lid_user, pn_user)| by_pn.get(pn_user) == Some(lid_user));
        self.store_user_mappings(staged).await
    }

    /// Derive the user-level `(lid, pn)` pairing from a message header.
    /// First match wins; non-derivable headers yield `None`.
    async fn pairing_from_message(
        &self,
        jid: &JID,
        participant: Option<&JID>,
    ) -> Result<Option<(String, String)>> {
        match participant {
            Some(participant) if jid.is_any_lid() && participant.is_any_pn() => {
                Ok(Some((jid.user.clone(), participant.user.clone())))
            }
            Some(participant) if jid.is_any_pn() && participant.is_any_lid() => {
                Ok(Some((participant.user.clone(), jid.user.clone())))
            }
            None if jid.is_any_lid() => Ok(self
                .stored_pn_for_lid_user(&jid.user)
                .await?
                .map(|pn_user| (jid.user.clone(), pn_user.to_string()))),
            None if jid.is_any_pn() => Ok(self
                .stored_lid_for_pn_user(&jid.user)
                .await?
                .map(|lid_user| (lid_user.to_string(), jid.user.clone()))),
            _ => Ok(None),
        }
    }

    /// Stage user-level `(lid_user, pn_user)` pairs whose forward mapping is
    /// missing or different, commit them in one batch and refresh both cache
    /// directions. Returns the number of mappings written.
    async fn store_user_mappings(&self, pairs: Vec<(String, String)>) -> Result<usize> {
        if pairs.is_empty() {
            return Ok(0);
        }

        // One entry per PN user, last occurrence winning.
        let mut deduped: Vec<(String, String)> = Vec::new();
        for pair in pairs {
            deduped.retain(|(_, pn_user)| pn_user != &pair.1);
            deduped.push(pair);
        }
        let pairs = deduped;

        let pn_users: Vec<&str> = pairs.iter().map(|(_, pn_user)| pn_user.as_str()).collect();
        let existing = self.kv.get(namespace::LID_MAPPING, &pn_users).await?;

        let mut batch = WriteBatch::new();
        let mut written = Vec::new();
        for (lid_user, pn_user) in &pairs {
            let current = existing.get(pn_user).and_then(|value| mapping_value(value));
            if current.as_deref() == Some(lid_user.as_str()) {
                debug!("Mapping {} -> {} already current, skipping", pn_user, lid_user);
                continue;
            }
            batch.set(namespace::LID_MAPPING, pn_user.clone(), lid_user.clone());
            batch.set(namespace::LID_MAPPING, reverse_key(lid_user), pn_user.clone());
            written.push((lid_user.clone(), pn_user.clone()));
        }

        if batch.is_empty() {
            return Ok(0);
        }
        self.kv.commit(batch).await?;

        for (lid_user, pn_user) in &written {
            self.warm_cache(pn_user, lid_user);
        }
        info!("Stored {} LID mappings", written.len());
        Ok(written.len())
    }

    /// Scan every forward mapping and rewrite reverse entries that are
    /// missing or point at the wrong PN user. All repairs commit together.
    pub async fn validate_and_repair(&self) -> Result<RepairReport> {
        let entries: HashMap<String, bytes::Bytes> =
            self.kv.entries(namespace::LID_MAPPING).await?.into_iter().collect();

        let mut report = RepairReport::default();
        let mut batch = WriteBatch::new();
        for (key, value) in &entries {
            if key.ends_with(REVERSE_SUFFIX) {
                continue;
            }
            let Some(lid_user) = mapping_value(value) else {
                warn!("Forward mapping for {} has unusable value", key);
                report.errors += 1;
                continue;
            };

            let reverse = entries
                .get(&reverse_key(&lid_user))
                .and_then(|value| mapping_value(value));
            if reverse.as_deref() == Some(key.as_str()) {
                report.validated += 1;
            } else {
                batch.set(namespace::LID_MAPPING, reverse_key(&lid_user), key.clone());
                report.repaired += 1;
            }
        }

        if !batch.is_empty() {
            self.kv.commit(batch).await?;
        }
        info!(
            "Mapping index check: {} valid, {} repaired, {} errors",
            report.validated, report.repaired, report.errors
        );
        Ok(report)
    }

    /// Count mappings and list the PN users present in the index.
    pub async fn mapping_stats(&self) -> Result<MappingStats> {
        let entries = self.kv.entries(namespace::LID_MAPPING).await?;
        let mut users: Vec<String> = entries
            .into_iter()
            .filter(|(key, _)| !key.ends_with(REVERSE_SUFFIX))
            .map(|(key, _)| key)
            .collect();
        users.sort();
        Ok(MappingStats {
            total_mappings: users.len(),
            users,
        })
    }

    /// Drop the in-memory read cache. Persistent state is untouched.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn warm_cache(&self, pn_user: &str, lid_user: &str) {
        self.cache.insert(pn_cache_key(pn_user), lid_user.to_string());
        self.cache.insert(lid_cache_key(lid_user), pn_user.to_string());
    }
}

/// Exactly one side must be a LID and the other a PN, in either order.
fn classify_pair<'a>(a: &'a JID, b: &'a JID) -> Option<(&'a JID, &'a JID)> {
    if a.is_any_lid() && b.is_any_pn() {
        Some((a, b))
    } else if b.is_any_lid() && a.is_any_pn() {
        Some((b, a))
    } else {
        None
    }
}

/// Mapping values are non-empty UTF-8 user identifiers; anything else is
/// treated as absent.
fn mapping_value(value: &bytes::Bytes) -> Option<String> {
    match std::str::from_utf8(value) {
        Ok(value) if !value.is_empty() => Some(value.to_string()),
        _ => None,
    }
}

/// Strip server and device segments when callers pass a full JID.
fn user_level(user_id: &str) -> &str {
    let user = user_id.split('@').next().unwrap_or(user_id);
    user.split(':').next().unwrap_or(user)
}
