//! In-process concurrency reservation for accounts and end users.
//!
//! Slot acquisition is an atomic "counter < max ⇒ record request id" under
//! one short-lived lock. Every slot carries an expiry so a crashed or hung
//! request cannot pin an account forever; expired records are swept
//! opportunistically on the acquire path and by `cleanup_expired`.

use crate::config::LimiterConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLoad {
    pub current: u32,
    pub waiting: u32,
    /// Percentage of `max` currently held (0 when `max` is 0).
    pub load_rate: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("limiter state poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct SlotTable {
    /// request_id → slot expiry.
    holders: HashMap<String, Instant>,
    waiting: u32,
}

impl SlotTable {
    fn sweep(&mut self, now: Instant) {
        self.holders.retain(|_, expires| *expires > now);
    }
}

pub struct ConcurrencyLimiter {
    accounts: Mutex<HashMap<i64, SlotTable>>,
    users: Mutex<HashMap<String, SlotTable>>,
    slot_ttl: Duration,
    user_max: u32,
}

impl ConcurrencyLimiter {
    pub fn new(cfg: &LimiterConfig) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            slot_ttl: Duration::from_secs(cfg.slot_ttl_secs.max(1)),
            user_max: cfg.user_max,
        }
    }

    fn lock_accounts(&self) -> MutexGuard<'_, HashMap<i64, SlotTable>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_users(&self) -> MutexGuard<'_, HashMap<String, SlotTable>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to reserve one slot on `account_id`. Idempotent for a given
    /// `request_id`: re-acquiring refreshes the expiry and succeeds.
    pub fn acquire(&self, account_id: i64, max: u32, request_id: &str) -> bool {
        if max == 0 {
            return false;
        }
        let now = Instant::now();
        let mut map = self.lock_accounts();
        let table = map.entry(account_id).or_default();
        table.sweep(now);

        if table.holders.contains_key(request_id) || (table.holders.len() as u32) < max {
            table
                .holders
                .insert(request_id.to_string(), now + self.slot_ttl);
            return true;
        }
        false
    }

    /// Release a slot. Unknown request ids are a no-op so the termination
    /// path may always call this unconditionally.
    pub fn release(&self, account_id: i64, request_id: &str) {
        let mut map = self.lock_accounts();
        if let Some(table) = map.get_mut(&account_id) {
            table.holders.remove(request_id);
            if table.holders.is_empty() && table.waiting == 0 {
                map.remove(&account_id);
            }
        }
    }

    /// Join the wait queue behind an account. Returns the 1-based waiting
    /// position, or `None` when `max_wait` parallel waiters are already
    /// queued (the caller treats that as a failover signal).
    pub fn waiting_increment(&self, account_id: i64, max_wait: u32) -> Option<u32> {
        let mut map = self.lock_accounts();
        let table = map.entry(account_id).or_default();
        if table.waiting >= max_wait {
            return None;
        }
        table.waiting += 1;
        Some(table.waiting)
    }

    pub fn waiting_decrement(&self, account_id: i64) {
        let mut map = self.lock_accounts();
        if let Some(table) = map.get_mut(&account_id) {
            table.waiting = table.waiting.saturating_sub(1);
            if table.holders.is_empty() && table.waiting == 0 {
                map.remove(&account_id);
            }
        }
    }

    /// One-shot load snapshot for a candidate set, used by load-aware
    /// ranking. Errors fall back to the priority-only path in the scheduler.
    pub fn load_batch(&self, accounts: &[(i64, u32)]) -> Result<HashMap<i64, SlotLoad>, LimiterError> {
        let now = Instant::now();
        let mut map = self.accounts.lock().map_err(|_| LimiterError::Poisoned)?;

        let mut out = HashMap::with_capacity(accounts.len());
        for (id, max) in accounts {
            let (current, waiting) = match map.get_mut(id) {
                Some(table) => {
                    table.sweep(now);
                    (table.holders.len() as u32, table.waiting)
                }
                None => (0, 0),
            };
            let load_rate = if *max == 0 { 0 } else { current * 100 / max };
            out.insert(
                *id,
                SlotLoad {
                    current,
                    waiting,
                    load_rate,
                },
            );
        }
        Ok(out)
    }

    /// Sweep expired slot records for one account.
    pub fn cleanup_expired(&self, account_id: i64) {
        let now = Instant::now();
        let mut map = self.lock_accounts();
        if let Some(table) = map.get_mut(&account_id) {
            let before = table.holders.len();
            table.sweep(now);
            let swept = before - table.holders.len();
            if swept > 0 {
                warn!(account.id = account_id, swept, "reclaimed expired slots");
            }
        }
    }

    /// Per-user reservation, applied before the per-account acquire.
    /// Unlimited when `user_max` is 0.
    pub fn user_acquire(&self, user: &str, request_id: &str) -> bool {
        if self.user_max == 0 {
            return true;
        }
        let now = Instant::now();
        let mut map = self.lock_users();
        let table = map.entry(user.to_string()).or_default();
        table.sweep(now);

        if table.holders.contains_key(request_id)
            || (table.holders.len() as u32) < self.user_max
        {
            table
                .holders
                .insert(request_id.to_string(), now + self.slot_ttl);
            return true;
        }
        false
    }

    pub fn user_release(&self, user: &str, request_id: &str) {
        let mut map = self.lock_users();
        if let Some(table) = map.get_mut(user) {
            table.holders.remove(request_id);
            if table.holders.is_empty() {
                map.remove(user);
            }
        }
    }
}

/// RAII reservation: releases the account slot (and the user slot when one
/// was taken) exactly once, on drop or on explicit `release()`. Dropping on
/// the client-cancel path therefore cannot leak slots.
pub struct SlotGuard {
    limiter: Arc<ConcurrencyLimiter>,
    account_id: i64,
    request_id: String,
    user: Option<String>,
    released: bool,
}

impl SlotGuard {
    pub fn new(
        limiter: Arc<ConcurrencyLimiter>,
        account_id: i64,
        request_id: String,
        user: Option<String>,
    ) -> Self {
        Self {
            limiter,
            account_id,
            request_id,
            user,
            released: false,
        }
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.limiter.release(self.account_id, &self.request_id);
        if let Some(user) = &self.user {
            self.limiter.user_release(user, &self.request_id);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// RAII wait-queue membership; decrements the waiting counter on drop.
pub struct WaitGuard {
    limiter: Arc<ConcurrencyLimiter>,
    account_id: i64,
}

impl WaitGuard {
    pub fn new(limiter: Arc<ConcurrencyLimiter>, account_id: i64) -> Self {
        Self {
            limiter,
            account_id,
        }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.limiter.waiting_decrement(self.account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(user_max: u32) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(&LimiterConfig {
            slot_ttl_secs: 600,
            user_max,
        })
    }

    #[test]
    fn acquire_respects_max_and_is_idempotent() {
        let l = limiter(0);
        assert!(l.acquire(1, 2, "r1"));
        assert!(l.acquire(1, 2, "r2"));
        assert!(!l.acquire(1, 2, "r3"));

        // Duplicate request id: still held, still true.
        assert!(l.acquire(1, 2, "r1"));

        l.release(1, "r1");
        assert!(l.acquire(1, 2, "r3"));
    }

    #[test]
    fn release_unknown_id_is_noop() {
        let l = limiter(0);
        l.release(9, "ghost");
        assert!(l.acquire(9, 1, "r1"));
    }

    #[test]
    fn waiting_cap_is_enforced() {
        let l = limiter(0);
        assert_eq!(l.waiting_increment(1, 2), Some(1));
        assert_eq!(l.waiting_increment(1, 2), Some(2));
        assert_eq!(l.waiting_increment(1, 2), None);

        l.waiting_decrement(1);
        assert_eq!(l.waiting_increment(1, 2), Some(2));
    }

    #[test]
    fn load_batch_reports_current_waiting_and_rate() {
        let l = limiter(0);
        assert!(l.acquire(1, 10, "a"));
        assert!(l.acquire(1, 10, "b"));
        l.waiting_increment(1, 5);

        let loads = l.load_batch(&[(1, 10), (2, 4)]).unwrap();
        assert_eq!(
            loads[&1],
            SlotLoad {
                current: 2,
                waiting: 1,
                load_rate: 20
            }
        );
        assert_eq!(
            loads[&2],
            SlotLoad {
                current: 0,
                waiting: 0,
                load_rate: 0
            }
        );
    }

    #[test]
    fn expired_slots_are_swept() {
        let l = ConcurrencyLimiter::new(&LimiterConfig {
            slot_ttl_secs: 1,
            user_max: 0,
        });
        // Manually age the slot by using the ttl floor: acquire then
        // overwrite the expiry via a second acquire after sleeping.
        assert!(l.acquire(1, 1, "r1"));
        std::thread::sleep(Duration::from_millis(1100));
        // r1 expired, so a new request fits without an explicit release.
        assert!(l.acquire(1, 1, "r2"));
    }

    #[test]
    fn slot_guard_releases_on_drop() {
        let l = Arc::new(limiter(0));
        assert!(l.acquire(1, 1, "r1"));
        {
            let _guard = SlotGuard::new(l.clone(), 1, "r1".to_string(), None);
            assert!(!l.acquire(1, 1, "r2"));
        }
        assert!(l.acquire(1, 1, "r2"));
    }

    #[test]
    fn user_limit_applies_before_account() {
        let l = limiter(1);
        assert!(l.user_acquire("u1", "r1"));
        assert!(!l.user_acquire("u1", "r2"));
        assert!(l.user_acquire("u2", "r2"));

        l.user_release("u1", "r1");
        assert!(l.user_acquire("u1", "r3"));
    }
}
