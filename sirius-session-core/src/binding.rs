use ahash::AHasher;
use moka::sync::Cache;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

const DOMAIN_BINDING: u8 = 3;
const DOMAIN_CHAIN: u8 = 4;

fn binding_key(group_id: Option<i64>, fingerprint: &str) -> u64 {
    let mut hasher = AHasher::default();
    hasher.write_u8(DOMAIN_BINDING);
    hasher.write_i64(group_id.unwrap_or(0));
    hasher.write(fingerprint.as_bytes());
    hasher.finish()
}

fn chain_key(group_id: Option<i64>, prefix_hash: u64, chain_prefix: &[String]) -> u64 {
    let mut hasher = AHasher::default();
    hasher.write_u8(DOMAIN_CHAIN);
    hasher.write_i64(group_id.unwrap_or(0));
    hasher.write_u64(prefix_hash);
    for segment in chain_prefix {
        hasher.write_u64(segment.len() as u64);
        hasher.write(segment.as_bytes());
    }
    hasher.finish()
}

/// Sticky-session store: hash(group, fingerprint) → account id, TTL-bounded.
///
/// Entries are refreshed on hit by re-inserting (moka's TTL is write-based),
/// and evicted eagerly when a binding goes stale.
pub struct BindingCache {
    cache: Cache<u64, i64>,
}

impl BindingCache {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl.max(Duration::from_secs(1)))
            .max_capacity(max_capacity.max(1))
            .build();
        Self { cache }
    }

    pub fn get(&self, group_id: Option<i64>, fingerprint: &str) -> Option<i64> {
        self.cache.get(&binding_key(group_id, fingerprint))
    }

    pub fn set(&self, group_id: Option<i64>, fingerprint: &str, account_id: i64) {
        self.cache.insert(binding_key(group_id, fingerprint), account_id);
    }

    /// Re-arm the TTL for an existing binding. No-op when absent.
    pub fn refresh(&self, group_id: Option<i64>, fingerprint: &str) {
        let key = binding_key(group_id, fingerprint);
        if let Some(account_id) = self.cache.get(&key) {
            self.cache.insert(key, account_id);
        }
    }

    pub fn delete(&self, group_id: Option<i64>, fingerprint: &str) {
        self.cache.invalidate(&binding_key(group_id, fingerprint));
    }
}

/// Value stored per digest chain: the conversation uuid assigned on first
/// contact plus the pinned account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBinding {
    pub uuid: Arc<str>,
    pub account_id: i64,
}

/// Gemini digest-chain store. A conversation is keyed by the session prefix
/// hash plus the chain of per-message digests; mid-conversation replies carry
/// a longer chain than the one cached, so lookups probe successive prefixes
/// from longest to shortest and take the first hit.
pub struct DigestChainCache {
    cache: Cache<u64, ChainBinding>,
}

impl DigestChainCache {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl.max(Duration::from_secs(1)))
            .max_capacity(max_capacity.max(1))
            .build();
        Self { cache }
    }

    pub fn save(
        &self,
        group_id: Option<i64>,
        prefix_hash: u64,
        chain: &[String],
        uuid: Arc<str>,
        account_id: i64,
    ) {
        self.cache.insert(
            chain_key(group_id, prefix_hash, chain),
            ChainBinding { uuid, account_id },
        );
    }

    pub fn find(
        &self,
        group_id: Option<i64>,
        prefix_hash: u64,
        chain: &[String],
    ) -> Option<ChainBinding> {
        for len in (1..=chain.len()).rev() {
            let key = chain_key(group_id, prefix_hash, &chain[..len]);
            if let Some(binding) = self.cache.get(&key) {
                return Some(binding);
            }
        }
        None
    }

    pub fn delete(&self, group_id: Option<i64>, prefix_hash: u64, chain: &[String]) {
        self.cache
            .invalidate(&chain_key(group_id, prefix_hash, chain));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::digest_chain;

    #[test]
    fn binding_set_get_delete() {
        let cache = BindingCache::new(Duration::from_secs(60), 1024);
        cache.set(Some(7), "s123", 1);

        assert_eq!(cache.get(Some(7), "s123"), Some(1));
        // Different group, same fingerprint: distinct binding.
        assert_eq!(cache.get(Some(8), "s123"), None);

        cache.delete(Some(7), "s123");
        assert_eq!(cache.get(Some(7), "s123"), None);
    }

    #[test]
    fn refresh_missing_binding_is_noop() {
        let cache = BindingCache::new(Duration::from_secs(60), 1024);
        cache.refresh(None, "ghost");
        assert_eq!(cache.get(None, "ghost"), None);
    }

    #[test]
    fn chain_lookup_prefers_longest_prefix() {
        let cache = DigestChainCache::new(Duration::from_secs(300), 1024);
        let short = digest_chain([("user", "hi"), ("model", "hello")]);
        let long = digest_chain([
            ("user", "hi"),
            ("model", "hello"),
            ("user", "more"),
            ("model", "sure"),
        ]);

        cache.save(None, 42, &short, Arc::from("conv-a"), 1);
        cache.save(None, 42, &long, Arc::from("conv-b"), 2);

        // The full chain matches the longer entry first.
        let hit = cache.find(None, 42, &long).unwrap();
        assert_eq!(hit.account_id, 2);
        assert_eq!(hit.uuid.as_ref(), "conv-b");
    }

    #[test]
    fn chain_lookup_falls_back_to_shorter_prefix() {
        let cache = DigestChainCache::new(Duration::from_secs(300), 1024);
        let cached = digest_chain([("user", "hi"), ("model", "hello")]);
        cache.save(Some(3), 42, &cached, Arc::from("conv-a"), 5);

        // A mid-conversation reply extends the chain; the prefix still pins
        // to the original account.
        let extended = digest_chain([("user", "hi"), ("model", "hello"), ("user", "and then")]);
        let hit = cache.find(Some(3), 42, &extended).unwrap();
        assert_eq!(hit.account_id, 5);
        assert_eq!(hit.uuid.as_ref(), "conv-a");
    }

    #[test]
    fn chain_miss_on_unrelated_conversation() {
        let cache = DigestChainCache::new(Duration::from_secs(300), 1024);
        let cached = digest_chain([("user", "hi")]);
        cache.save(None, 42, &cached, Arc::from("conv-a"), 5);

        let other = digest_chain([("user", "completely different")]);
        assert!(cache.find(None, 42, &other).is_none());
        assert!(cache.find(None, 43, &cached).is_none());
    }
}
