//! Config-wired facade over the session binding engine.

use crate::config::SessionConfig;
use sirius_session_core::{BindingCache, ChainBinding, DigestChainCache};
use std::sync::Arc;
use std::time::Duration;

const BINDING_CAPACITY: u64 = 100_000;
const CHAIN_CAPACITY: u64 = 100_000;

pub struct SessionService {
    bindings: BindingCache,
    chains: DigestChainCache,
}

impl SessionService {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            bindings: BindingCache::new(Duration::from_secs(cfg.ttl_secs), BINDING_CAPACITY),
            chains: DigestChainCache::new(
                Duration::from_secs(cfg.digest_ttl_secs),
                CHAIN_CAPACITY,
            ),
        }
    }

    pub fn get(&self, group_id: Option<i64>, fingerprint: &str) -> Option<i64> {
        self.bindings.get(group_id, fingerprint)
    }

    pub fn set(&self, group_id: Option<i64>, fingerprint: &str, account_id: i64) {
        self.bindings.set(group_id, fingerprint, account_id);
    }

    pub fn refresh(&self, group_id: Option<i64>, fingerprint: &str) {
        self.bindings.refresh(group_id, fingerprint);
    }

    pub fn delete(&self, group_id: Option<i64>, fingerprint: &str) {
        self.bindings.delete(group_id, fingerprint);
    }

    pub fn find_chain(
        &self,
        group_id: Option<i64>,
        prefix_hash: u64,
        chain: &[String],
    ) -> Option<ChainBinding> {
        self.chains.find(group_id, prefix_hash, chain)
    }

    pub fn save_chain(
        &self,
        group_id: Option<i64>,
        prefix_hash: u64,
        chain: &[String],
        uuid: Arc<str>,
        account_id: i64,
    ) {
        self.chains
            .save(group_id, prefix_hash, chain, uuid, account_id);
    }

    pub fn delete_chain(&self, group_id: Option<i64>, prefix_hash: u64, chain: &[String]) {
        self.chains.delete(group_id, prefix_hash, chain);
    }
}
