//! Outbound HTTP, the TTL result cache and opportunity persistence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub mod cache;
pub mod http;
pub mod pg;
pub mod store;

pub use cache::{CacheKey, TtlCache, PROFILE_LOOKUP_TTL, SOURCE_RESULT_TTL};
pub use http::{FetchError, FetchedResponse, Headers, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use pg::PgOpportunityStore;
pub use store::{
    default_staleness, merge_update, resolve_upsert, MemoryOpportunityStore, OpportunityStore, RunCommit,
    StoreError, UpsertDecision, UpsertOutcome, UpsertRecord, DEFAULT_STALENESS_HOURS,
};

pub const CRATE_NAME: &str = "gof-storage";

/// At-most-one concurrent discovery run per organization.
#[derive(Debug, Default)]
pub struct OrgRunLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl OrgRunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other run holds the organization's lock.
    pub async fn acquire(&self, org_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            // Holders and waiters keep a clone; a lone map reference is idle.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(org_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Organizations currently holding a lock entry.
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}
