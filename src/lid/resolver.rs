use async_trait::async_trait;

use crate::error::Result;

/// A user-level pairing returned by the directory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub pn_user: String,
    pub lid_user: String,
}

/// External directory service resolving PN users to LID users in bulk.
///
/// Queries are normalized phone-number JIDs (`user@s.whatsapp.net`, no
/// device). Unresolved entries are simply absent from the result. The
/// resolver handles its own rate limits and retries; callers treat errors
/// and empty results identically, as "nothing learned".
#[async_trait]
pub trait DirectoryResolver: Send + Sync {
    async fn resolve(&self, pn_jids: &[String]) -> Result<Vec<ResolvedMapping>>;
}
