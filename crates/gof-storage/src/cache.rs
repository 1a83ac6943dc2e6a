//! Short-TTL key/value cache shared across discovery runs.
//!
//! Passive store: callers do read-through themselves. Expiry is checked lazily
//! on read and expired entries are evicted on access.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub const SOURCE_RESULT_TTL: Duration = Duration::from_secs(300);
pub const PROFILE_LOOKUP_TTL: Duration = Duration::from_secs(3600);

/// `(source, normalized query params)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub source: String,
    pub params: String,
}

impl CacheKey {
    pub fn new(source: impl Into<String>, params: &str) -> Self {
        Self {
            source: source.into(),
            params: normalize_params(params),
        }
    }
}

/// Lowercases, collapses whitespace and sorts `;`-separated parameter groups.
fn normalize_params(params: &str) -> String {
    let mut parts = params
        .split(';')
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    parts.sort();
    parts.join(";")
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key, CacheEntry { value, expires_at });
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.remove(key);
    }

    /// Entry count, including expired entries not yet read.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_lazily_and_are_evicted_on_read() {
        let cache: TtlCache<CacheKey, Vec<String>> = TtlCache::new();
        let key = CacheKey::new("news-feed", "kw=education");
        cache
            .set(key.clone(), vec!["a".into()], Duration::from_secs(300))
            .await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get(&key).await, Some(vec!["a".to_string()]));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.len().await, 1, "no background sweeper");
        assert_eq!(cache.get(&key).await, None);
        assert!(cache.is_empty().await);
    }

    #[test]
    fn keys_normalize_param_order_and_case() {
        let a = CacheKey::new("federal-registry", "kw=Education,youth; loc=chicago");
        let b = CacheKey::new("federal-registry", "loc=Chicago;kw=education,youth");
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::new("news-feed", "loc=chicago;kw=education,youth"));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_entries() {
        let cache: Arc<TtlCache<CacheKey, usize>> = Arc::new(TtlCache::new());
        let mut handles = Vec::new();
        for i in 0..32usize {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .set(CacheKey::new("src", &format!("q={i}")), i, SOURCE_RESULT_TTL)
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.len().await, 32);
        assert_eq!(cache.get(&CacheKey::new("src", "q=7")).await, Some(7));
    }
}
