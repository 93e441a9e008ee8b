//! Account selection: resolve the target group and platform, filter the
//! candidate pool, rank it, and reserve a concurrency slot.
//!
//! The pipeline is a single pass per group; `claude_code_only` fallback
//! chains re-enter it with the fallback group. Sticky sessions short-circuit
//! the pipeline entirely when the bound account is still usable.

use crate::accounts::{Account, AccountKind, AccountStatus, AccountStoreHandle, Group, Platform};
use crate::config::SchedulingConfig;
use crate::error::GatewayError;
use crate::limiter::{ConcurrencyLimiter, SlotLoad};
use crate::session::SessionService;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-waiter slice used to estimate queue time in a `WaitPlan`.
const WAIT_SLICE: Duration = Duration::from_millis(500);

/// Request-scoped context carried explicitly through selection (no
/// task-local tricks): forced platform, pre-hydrated group, request id.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub group_id: Option<i64>,
    /// Group already hydrated by an outer layer; reused when its id matches
    /// `group_id` so the pipeline skips one store read.
    pub group: Option<Group>,
    pub force_platform: Option<Platform>,
    pub claude_code: bool,
    /// `metadata.user_id`, for the per-user concurrency limiter.
    pub user_id: Option<String>,
}

/// Session identity used for sticky lookups.
#[derive(Debug, Clone)]
pub enum SessionKey {
    Fingerprint(String),
    /// Gemini digest-chain variant; probes chain prefixes longest-first.
    GeminiChain { prefix_hash: u64, chain: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct Selected {
    pub account: Account,
    /// Conversation uuid for digest-chain sessions (new or salvaged).
    pub session_uuid: Option<Arc<str>>,
}

/// "Queue behind this account" instead of "use this account now".
#[derive(Debug, Clone)]
pub struct WaitPlan {
    pub account: Account,
    pub waiting_position: u32,
    pub estimated_wait: Duration,
}

#[derive(Debug, Clone)]
pub enum SelectOutcome {
    /// Slot acquired; the caller owns the reservation.
    Ready(Selected),
    /// Every policy-eligible candidate is at capacity; the caller may wait.
    Wait(WaitPlan),
}

#[derive(Debug, Default)]
struct FilterStats {
    excluded: usize,
    inactive: usize,
    rate_limited: usize,
    overloaded: usize,
    temp_unschedulable: usize,
    scope_limited: usize,
    model_unsupported: usize,
    platform_mismatch: usize,
}

impl FilterStats {
    fn hint(&self) -> String {
        let mut parts = Vec::new();
        for (count, label) in [
            (self.excluded, "already tried"),
            (self.inactive, "not active"),
            (self.rate_limited, "rate-limited"),
            (self.overloaded, "overloaded"),
            (self.temp_unschedulable, "temporarily unschedulable"),
            (self.scope_limited, "model-scope limited"),
            (self.model_unsupported, "without model support"),
            (self.platform_mismatch, "on another platform"),
        ] {
            if count > 0 {
                parts.push(format!("{count} {label}"));
            }
        }
        if parts.is_empty() {
            "no accounts configured".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Platform admission for one candidate: its own platform, or the
/// Antigravity mixed-scheduling exception for Anthropic traffic.
fn platform_admits(account: &Account, platform: Platform) -> bool {
    if account.platform == platform {
        return true;
    }
    platform == Platform::Anthropic
        && account.platform == Platform::Antigravity
        && account.mixed_scheduling()
}

fn filter_candidates(
    accounts: &[Account],
    platform: Platform,
    model: &str,
    excluded: &HashSet<i64>,
    now: DateTime<Utc>,
) -> (Vec<Account>, FilterStats) {
    let mut stats = FilterStats::default();
    let mut kept = Vec::new();

    for account in accounts {
        if excluded.contains(&account.id) {
            stats.excluded += 1;
            continue;
        }
        if !platform_admits(account, platform) {
            stats.platform_mismatch += 1;
            continue;
        }
        if account.status != AccountStatus::Active || !account.schedulable {
            stats.inactive += 1;
            continue;
        }
        if account.rate_limit_reset_at.is_some_and(|t| now < t) {
            stats.rate_limited += 1;
            continue;
        }
        if account.overload_until.is_some_and(|t| now < t) {
            stats.overloaded += 1;
            continue;
        }
        if account.temp_unschedulable_until.is_some_and(|t| now < t) {
            stats.temp_unschedulable += 1;
            continue;
        }
        if account.is_scope_limited(model, now) {
            stats.scope_limited += 1;
            continue;
        }
        if !account.supports_model(model) {
            stats.model_unsupported += 1;
            continue;
        }
        kept.push(account.clone());
    }

    (kept, stats)
}

/// OAuth-family accounts outrank api-key accounts at equal priority on the
/// Gemini platform.
fn gemini_kind_rank(kind: AccountKind) -> u8 {
    match kind {
        AccountKind::Oauth => 0,
        AccountKind::SetupToken => 1,
        AccountKind::ApiKey => 2,
    }
}

fn rank_candidates(
    candidates: &mut [Account],
    loads: Option<&HashMap<i64, SlotLoad>>,
    platform: Platform,
) {
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| {
                if platform == Platform::Gemini {
                    gemini_kind_rank(a.kind).cmp(&gemini_kind_rank(b.kind))
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| match loads {
                Some(loads) => {
                    let la = loads.get(&a.id).map_or(0, |l| l.load_rate);
                    let lb = loads.get(&b.id).map_or(0, |l| l.load_rate);
                    la.cmp(&lb)
                }
                // Legacy path: never-used accounts first, then least
                // recently used.
                None => (!a.never_used(), a.last_used_at).cmp(&(!b.never_used(), b.last_used_at)),
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub struct Scheduler {
    store: AccountStoreHandle,
    sessions: Arc<SessionService>,
    limiter: Arc<ConcurrencyLimiter>,
    cfg: SchedulingConfig,
}

impl Scheduler {
    pub fn new(
        store: AccountStoreHandle,
        sessions: Arc<SessionService>,
        limiter: Arc<ConcurrencyLimiter>,
        cfg: SchedulingConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            limiter,
            cfg,
        }
    }

    pub fn store(&self) -> &AccountStoreHandle {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    /// Candidate count before concurrency, used by the proxy to size its
    /// retry budget.
    pub async fn candidate_count(
        &self,
        ctx: &RequestContext,
        model: &str,
    ) -> Result<usize, GatewayError> {
        let group = self.initial_group(ctx).await?;
        let platform = self.resolve_platform(ctx, group.as_ref(), model)?;
        let base = self.list_base(group.as_ref(), platform).await?;
        let (kept, _) = filter_candidates(&base, platform, model, &HashSet::new(), Utc::now());
        Ok(kept.len())
    }

    /// Select one account per §scheduling pipeline. `excluded` carries the
    /// accounts already tried for this client request.
    pub async fn select(
        &self,
        ctx: &RequestContext,
        session: Option<&SessionKey>,
        model: &str,
        excluded: &HashSet<i64>,
    ) -> Result<SelectOutcome, GatewayError> {
        let mut visited: HashSet<i64> = HashSet::new();
        let mut group = self.initial_group(ctx).await?;

        // Gate non-Claude-Code traffic off claude_code_only groups before
        // anything else runs.
        if let Some(g) = group.clone() {
            visited.insert(g.id);
            if g.claude_code_only && !(ctx.claude_code && self.cfg.claude_code_detection) {
                group = Some(self.walk_fallback(&g, &mut visited).await?);
            }
        }

        loop {
            let platform = self.resolve_platform(ctx, group.as_ref(), model)?;

            match self
                .select_once(ctx, group.as_ref(), session, model, excluded, platform)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err @ GatewayError::NoAvailableAccounts { .. }) => {
                    // Exhausted pipeline: claude-code-only groups may declare
                    // a fallback group to re-enter with.
                    let Some(g) = &group else { return Err(err) };
                    if !g.claude_code_only {
                        return Err(err);
                    }
                    let Some(fallback_id) = g.fallback_group_id else {
                        return Err(GatewayError::ClaudeCodeOnly { group_id: g.id });
                    };
                    if !visited.insert(fallback_id) {
                        return Err(GatewayError::GroupFallbackCycle {
                            group_id: fallback_id,
                        });
                    }
                    let fallback = self
                        .store
                        .get_group(fallback_id)
                        .await?
                        .ok_or(GatewayError::GroupNotFound(fallback_id))?;
                    info!(
                        from = g.id,
                        to = fallback.id,
                        "claude-code-only group exhausted; entering fallback group"
                    );
                    group = Some(fallback);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn initial_group(&self, ctx: &RequestContext) -> Result<Option<Group>, GatewayError> {
        let Some(group_id) = ctx.group_id else {
            return Ok(None);
        };
        if let Some(g) = &ctx.group {
            if g.id == group_id && g.hydrated {
                return Ok(Some(g.clone()));
            }
        }
        let group = self
            .store
            .get_group(group_id)
            .await?
            .ok_or(GatewayError::GroupNotFound(group_id))?;
        Ok(Some(group))
    }

    /// Follow `fallback_group_id` until a group admits this request. Cycles
    /// are refused with a typed error.
    async fn walk_fallback(
        &self,
        start: &Group,
        visited: &mut HashSet<i64>,
    ) -> Result<Group, GatewayError> {
        let mut current = start.clone();
        loop {
            let Some(next_id) = current.fallback_group_id else {
                return Err(GatewayError::ClaudeCodeOnly {
                    group_id: current.id,
                });
            };
            if !visited.insert(next_id) {
                return Err(GatewayError::GroupFallbackCycle { group_id: next_id });
            }
            let next = self
                .store
                .get_group(next_id)
                .await?
                .ok_or(GatewayError::GroupNotFound(next_id))?;
            if !next.claude_code_only {
                return Ok(next);
            }
            current = next;
        }
    }

    fn resolve_platform(
        &self,
        ctx: &RequestContext,
        group: Option<&Group>,
        model: &str,
    ) -> Result<Platform, GatewayError> {
        if let Some(p) = ctx.force_platform {
            return Ok(p);
        }
        if let Some(p) = group.and_then(|g| g.platform) {
            return Ok(p);
        }
        Platform::from_model(model).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("cannot resolve a platform for model `{model}`"))
        })
    }

    async fn list_base(
        &self,
        group: Option<&Group>,
        platform: Platform,
    ) -> Result<Vec<Account>, GatewayError> {
        match group {
            Some(g) => self.store.list_schedulable_by_group(g.id).await,
            None => {
                let mut platforms = vec![platform];
                if platform == Platform::Anthropic {
                    // Mixed scheduling: opted-in Antigravity accounts may
                    // serve Anthropic traffic.
                    platforms.push(Platform::Antigravity);
                }
                self.store.list_schedulable_by_platforms(platforms).await
            }
        }
    }

    async fn select_once(
        &self,
        ctx: &RequestContext,
        group: Option<&Group>,
        session: Option<&SessionKey>,
        model: &str,
        excluded: &HashSet<i64>,
        platform: Platform,
    ) -> Result<SelectOutcome, GatewayError> {
        let group_key = group.map(|g| g.id);
        let now = Utc::now();

        // Sticky lookup: a valid binding bypasses ranking entirely.
        if let Some(key) = session {
            if let Some(outcome) = self
                .try_sticky(ctx, group_key, key, model, excluded, platform, now)
                .await?
            {
                return Ok(outcome);
            }
        }

        let base = self.list_base(group, platform).await?;

        // Model routing override: restrict to the routed account list; an
        // empty restricted set after filtering falls back to the normal
        // candidate pool.
        let mut candidates = Vec::new();
        let mut routed_applied = false;
        if let Some(routed) = group.and_then(|g| g.routed_accounts(model)) {
            let routed_pool: Vec<Account> = base
                .iter()
                .filter(|a| routed.contains(&a.id))
                .cloned()
                .collect();
            let (kept, _) = filter_candidates(&routed_pool, platform, model, excluded, now);
            if kept.is_empty() {
                warn!(
                    group = ?group_key,
                    %model,
                    routed = ?routed,
                    "model routing produced no eligible account; falling back to group pool"
                );
            } else {
                candidates = kept;
                routed_applied = true;
            }
        }

        let stats = if routed_applied {
            FilterStats::default()
        } else {
            let (kept, stats) = filter_candidates(&base, platform, model, excluded, now);
            candidates = kept;
            stats
        };

        if candidates.is_empty() {
            return Err(GatewayError::NoAvailableAccounts { hint: stats.hint() });
        }

        let load_pairs: Vec<(i64, u32)> =
            candidates.iter().map(|a| (a.id, a.concurrency)).collect();
        let loads = if self.cfg.load_batch_enabled {
            match self.limiter.load_batch(&load_pairs) {
                Ok(loads) => Some(loads),
                Err(e) => {
                    warn!(error = %e, "load batch failed; using priority-only ranking");
                    None
                }
            }
        } else {
            None
        };

        rank_candidates(&mut candidates, loads.as_ref(), platform);
        debug!(
            %model,
            platform = platform.as_str(),
            ranked = ?candidates.iter().map(|a| a.id).collect::<Vec<_>>(),
            "candidates ranked"
        );

        self.reserve(ctx, group_key, session, model, candidates, loads)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_sticky(
        &self,
        ctx: &RequestContext,
        group_key: Option<i64>,
        key: &SessionKey,
        model: &str,
        excluded: &HashSet<i64>,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<Option<SelectOutcome>, GatewayError> {
        let (bound_id, chain_uuid) = match key {
            SessionKey::Fingerprint(fp) => (self.sessions.get(group_key, fp), None),
            SessionKey::GeminiChain { prefix_hash, chain } => {
                match self.sessions.find_chain(group_key, *prefix_hash, chain) {
                    Some(binding) => (Some(binding.account_id), Some(binding.uuid)),
                    None => (None, None),
                }
            }
        };
        let Some(bound_id) = bound_id else {
            return Ok(None);
        };

        let account = self.store.get_account(bound_id).await?;
        let usable = account.as_ref().is_some_and(|a| {
            platform_admits(a, platform)
                && !excluded.contains(&a.id)
                && a.is_eligible(now)
                && !a.is_scope_limited(model, now)
                && a.supports_model(model)
        });

        let Some(account) = account.filter(|_| usable) else {
            debug!(account.id = bound_id, "sticky binding stale; evicting");
            self.evict_session(group_key, key);
            return Ok(None);
        };

        if !self.user_admit(ctx) {
            return Err(GatewayError::NoAvailableAccounts {
                hint: "user concurrency limit reached".to_string(),
            });
        }

        if self
            .limiter
            .acquire(account.id, account.concurrency, &ctx.request_id)
        {
            self.commit_session(group_key, key, account.id, chain_uuid.clone());
            self.store.touch_last_used(vec![account.id], now);
            debug!(account.id = account.id, "sticky hit");
            return Ok(Some(SelectOutcome::Ready(Selected {
                account,
                session_uuid: chain_uuid,
            })));
        }

        self.user_abort(ctx);

        // Bound account is policy-eligible but full: queue behind it rather
        // than breaking the session.
        if let Some(position) = self
            .limiter
            .waiting_increment(account.id, self.cfg.sticky_session_max_waiting)
        {
            return Ok(Some(SelectOutcome::Wait(WaitPlan {
                estimated_wait: WAIT_SLICE * position,
                waiting_position: position,
                account,
            })));
        }

        // Wait queue full: fall through to normal selection.
        Ok(None)
    }

    async fn reserve(
        &self,
        ctx: &RequestContext,
        group_key: Option<i64>,
        session: Option<&SessionKey>,
        _model: &str,
        candidates: Vec<Account>,
        loads: Option<HashMap<i64, SlotLoad>>,
    ) -> Result<SelectOutcome, GatewayError> {
        if !self.user_admit(ctx) {
            return Err(GatewayError::NoAvailableAccounts {
                hint: "user concurrency limit reached".to_string(),
            });
        }

        for account in &candidates {
            self.limiter.cleanup_expired(account.id);
            if self
                .limiter
                .acquire(account.id, account.concurrency, &ctx.request_id)
            {
                let uuid = if let Some(key) = session {
                    let uuid = chain_uuid_for(key);
                    self.commit_session(group_key, key, account.id, uuid.clone());
                    uuid
                } else {
                    None
                };
                self.store.touch_last_used(vec![account.id], Utc::now());
                return Ok(SelectOutcome::Ready(Selected {
                    account: account.clone(),
                    session_uuid: uuid,
                }));
            }
        }

        self.user_abort(ctx);

        // All policy-eligible candidates are at capacity: pin a wait plan to
        // the one with the shortest queue. No sticky write here.
        let waiting_of = |id: i64| -> u32 {
            loads
                .as_ref()
                .and_then(|l| l.get(&id))
                .map_or(0, |l| l.waiting)
        };
        let Some(target) = candidates
            .iter()
            .min_by_key(|a| (waiting_of(a.id), a.id))
            .cloned()
        else {
            return Err(GatewayError::NoAvailableAccounts {
                hint: "no policy-eligible account".to_string(),
            });
        };

        match self
            .limiter
            .waiting_increment(target.id, self.cfg.sticky_session_max_waiting)
        {
            Some(position) => Ok(SelectOutcome::Wait(WaitPlan {
                estimated_wait: WAIT_SLICE * position,
                waiting_position: position,
                account: target,
            })),
            None => Err(GatewayError::NoAvailableAccounts {
                hint: "all candidates at capacity and wait queues full".to_string(),
            }),
        }
    }

    fn user_admit(&self, ctx: &RequestContext) -> bool {
        match &ctx.user_id {
            Some(user) => self.limiter.user_acquire(user, &ctx.request_id),
            None => true,
        }
    }

    fn user_abort(&self, ctx: &RequestContext) {
        if let Some(user) = &ctx.user_id {
            self.limiter.user_release(user, &ctx.request_id);
        }
    }

    fn evict_session(&self, group_key: Option<i64>, key: &SessionKey) {
        match key {
            SessionKey::Fingerprint(fp) => self.sessions.delete(group_key, fp),
            SessionKey::GeminiChain { prefix_hash, chain } => {
                self.sessions.delete_chain(group_key, *prefix_hash, chain);
            }
        }
    }

    /// Sticky write rule: only after a successful acquire.
    fn commit_session(
        &self,
        group_key: Option<i64>,
        key: &SessionKey,
        account_id: i64,
        uuid: Option<Arc<str>>,
    ) {
        match key {
            SessionKey::Fingerprint(fp) => self.sessions.set(group_key, fp, account_id),
            SessionKey::GeminiChain { prefix_hash, chain } => {
                let uuid = uuid.unwrap_or_else(|| Arc::from(Uuid::new_v4().to_string()));
                self.sessions
                    .save_chain(group_key, *prefix_hash, chain, uuid, account_id);
            }
        }
    }
}

/// Reuse a salvaged chain uuid; mint a fresh one for new chains.
fn chain_uuid_for(key: &SessionKey) -> Option<Arc<str>> {
    match key {
        SessionKey::Fingerprint(_) => None,
        SessionKey::GeminiChain { .. } => Some(Arc::from(Uuid::new_v4().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{self, GroupStatus};
    use crate::config::{LimiterConfig, SessionConfig};
    use serde_json::{Map, json};

    fn test_account(platform: Platform, priority: i32) -> Account {
        Account {
            id: 0,
            name: "acct".to_string(),
            platform,
            kind: AccountKind::ApiKey,
            priority,
            schedulable: true,
            status: AccountStatus::Active,
            error_message: None,
            concurrency: 10,
            credentials: Map::new(),
            credential_generation: 0,
            last_used_at: None,
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            scoped_rate_limits: Default::default(),
            group_ids: Vec::new(),
            extra: Map::new(),
        }
    }

    fn test_group(platform: Option<Platform>) -> Group {
        Group {
            id: 0,
            name: "group".to_string(),
            platform,
            status: GroupStatus::Active,
            hydrated: true,
            claude_code_only: false,
            fallback_group_id: None,
            model_routing_enabled: false,
            model_routing: HashMap::new(),
            account_ids: Vec::new(),
        }
    }

    fn ctx(request_id: &str) -> RequestContext {
        RequestContext {
            request_id: request_id.to_string(),
            ..Default::default()
        }
    }

    async fn scheduler_with(cfg: SchedulingConfig) -> Scheduler {
        let store = accounts::store::spawn_in_memory().await;
        let sessions = Arc::new(SessionService::new(&SessionConfig::default()));
        let limiter = Arc::new(ConcurrencyLimiter::new(&LimiterConfig::default()));
        Scheduler::new(store, sessions, limiter, cfg)
    }

    async fn scheduler() -> Scheduler {
        scheduler_with(SchedulingConfig::default()).await
    }

    fn ready_id(outcome: SelectOutcome) -> i64 {
        match outcome {
            SelectOutcome::Ready(s) => s.account.id,
            SelectOutcome::Wait(plan) => panic!("unexpected wait plan for {}", plan.account.id),
        }
    }

    const SONNET: &str = "claude-3-5-sonnet-20241022";

    #[tokio::test]
    async fn single_platform_selection_prefers_priority() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();
        sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();
        // Antigravity without mixed_scheduling never serves Anthropic.
        sched
            .store
            .insert_account(test_account(Platform::Antigravity, 1))
            .await
            .unwrap();

        let outcome = sched
            .select(&ctx("r1"), None, SONNET, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), a);
        assert_eq!(a, 1);
    }

    #[tokio::test]
    async fn sticky_hit_returns_bound_account() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();
        sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();

        // Bind the session to the *worse*-priority account; a sticky hit
        // must still win without ranking.
        sched.sessions.set(None, "s123", a);

        let key = SessionKey::Fingerprint("s123".to_string());
        let outcome = sched
            .select(&ctx("r1"), Some(&key), SONNET, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), a);
    }

    #[tokio::test]
    async fn sticky_salvage_evicts_and_rebinds() {
        let sched = scheduler().await;
        let mut disabled = test_account(Platform::Anthropic, 1);
        disabled.status = AccountStatus::Disabled;
        let a = sched.store.insert_account(disabled).await.unwrap();
        let b = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();

        sched.sessions.set(None, "s123", a);

        let key = SessionKey::Fingerprint("s123".to_string());
        let outcome = sched
            .select(&ctx("r1"), Some(&key), SONNET, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), b);

        // Old binding deleted and replaced by the account actually served.
        assert_eq!(sched.sessions.get(None, "s123"), Some(b));
    }

    #[tokio::test]
    async fn model_routing_fallback_when_routed_account_missing() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();
        let b = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();

        let mut group = test_group(Some(Platform::Anthropic));
        group.model_routing_enabled = true;
        group.model_routing.insert(SONNET.to_string(), vec![99]);
        group.account_ids = vec![a, b];
        let gid = sched.store.insert_group(group).await.unwrap();

        let mut c = ctx("r1");
        c.group_id = Some(gid);
        let outcome = sched.select(&c, None, SONNET, &HashSet::new()).await.unwrap();
        assert_eq!(ready_id(outcome), a);
    }

    #[tokio::test]
    async fn model_routing_restricts_to_listed_accounts() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();
        let b = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();

        let mut group = test_group(Some(Platform::Anthropic));
        group.model_routing_enabled = true;
        // Route to the worse-priority account only.
        group.model_routing.insert(SONNET.to_string(), vec![b]);
        group.account_ids = vec![a, b];
        let gid = sched.store.insert_group(group).await.unwrap();

        let mut c = ctx("r1");
        c.group_id = Some(gid);
        let outcome = sched.select(&c, None, SONNET, &HashSet::new()).await.unwrap();
        assert_eq!(ready_id(outcome), b);
    }

    #[tokio::test]
    async fn load_aware_rank_prefers_lower_load() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();
        let b = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();

        // Load account a to 80%, account b to 20% (concurrency is 10).
        for i in 0..8 {
            assert!(sched.limiter.acquire(a, 10, &format!("warm-a-{i}")));
        }
        for i in 0..2 {
            assert!(sched.limiter.acquire(b, 10, &format!("warm-b-{i}")));
        }

        let outcome = sched
            .select(&ctx("r1"), None, SONNET, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), b);
    }

    #[tokio::test]
    async fn rate_limited_account_is_skipped_until_reset() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();
        let b = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();

        sched
            .store
            .set_rate_limit(a, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        let outcome = sched
            .select(&ctx("r1"), None, SONNET, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), b);

        // Reset elapsed (clamped to "now" at set time): preferred again.
        sched.store.clear_rate_limit(a).await.unwrap();
        let outcome = sched
            .select(&ctx("r2"), None, SONNET, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), a);
    }

    #[tokio::test]
    async fn scoped_rate_limit_only_blocks_that_model() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();
        sched
            .store
            .set_scoped_rate_limit(
                a,
                SONNET.to_string(),
                Utc::now() + chrono::Duration::seconds(60),
            )
            .await
            .unwrap();

        let err = sched
            .select(&ctx("r1"), None, SONNET, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccounts { .. }));

        let outcome = sched
            .select(&ctx("r2"), None, "claude-3-5-haiku-20241022", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), a);
    }

    #[tokio::test]
    async fn mixed_scheduling_requires_opt_in() {
        let sched = scheduler().await;
        let mut ag = test_account(Platform::Antigravity, 1);
        ag.extra.insert("mixed_scheduling".to_string(), json!(true));
        let mixed = sched.store.insert_account(ag).await.unwrap();
        let plain = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();

        // Model in the Antigravity allow-list, requested on Anthropic.
        let outcome = sched
            .select(&ctx("r1"), None, "claude-sonnet-4-5", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), mixed);

        // Without the opt-in the Antigravity account is invisible.
        let sched2 = scheduler().await;
        sched2
            .store
            .insert_account(test_account(Platform::Antigravity, 1))
            .await
            .unwrap();
        let plain2 = sched2
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();
        let outcome = sched2
            .select(&ctx("r1"), None, "claude-sonnet-4-5", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), plain2);
        let _ = (plain, plain2);
    }

    #[tokio::test]
    async fn routed_antigravity_without_opt_in_falls_back() {
        let sched = scheduler().await;
        let ag = sched
            .store
            .insert_account(test_account(Platform::Antigravity, 1))
            .await
            .unwrap();
        let anthro = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();

        let mut group = test_group(Some(Platform::Anthropic));
        group.model_routing_enabled = true;
        group
            .model_routing
            .insert("claude-sonnet-4-5".to_string(), vec![ag]);
        group.account_ids = vec![ag, anthro];
        let gid = sched.store.insert_group(group).await.unwrap();

        let mut c = ctx("r1");
        c.group_id = Some(gid);
        let outcome = sched
            .select(&c, None, "claude-sonnet-4-5", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), anthro);
    }

    #[tokio::test]
    async fn excluded_accounts_never_return() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();
        let b = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 2))
            .await
            .unwrap();

        let excluded: HashSet<i64> = [a].into_iter().collect();
        let outcome = sched
            .select(&ctx("r1"), None, SONNET, &excluded)
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), b);

        let both: HashSet<i64> = [a, b].into_iter().collect();
        let err = sched.select(&ctx("r2"), None, SONNET, &both).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccounts { .. }));
    }

    #[tokio::test]
    async fn full_account_yields_wait_plan() {
        let sched = scheduler().await;
        let mut small = test_account(Platform::Anthropic, 1);
        small.concurrency = 1;
        let a = sched.store.insert_account(small).await.unwrap();

        assert!(sched.limiter.acquire(a, 1, "occupant"));

        let outcome = sched
            .select(&ctx("r1"), None, SONNET, &HashSet::new())
            .await
            .unwrap();
        match outcome {
            SelectOutcome::Wait(plan) => {
                assert_eq!(plan.account.id, a);
                assert_eq!(plan.waiting_position, 1);
                assert!(plan.estimated_wait >= WAIT_SLICE);
            }
            SelectOutcome::Ready(s) => panic!("unexpected ready on {}", s.account.id),
        }
    }

    #[tokio::test]
    async fn wait_queue_cap_turns_into_capacity_error() {
        let sched = scheduler_with(SchedulingConfig {
            sticky_session_max_waiting: 0,
            ..Default::default()
        })
        .await;
        let mut small = test_account(Platform::Anthropic, 1);
        small.concurrency = 1;
        let a = sched.store.insert_account(small).await.unwrap();
        assert!(sched.limiter.acquire(a, 1, "occupant"));

        let err = sched
            .select(&ctx("r1"), None, SONNET, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccounts { .. }));
    }

    #[tokio::test]
    async fn claude_code_only_without_fallback_rejects() {
        let sched = scheduler().await;
        let mut group = test_group(Some(Platform::Anthropic));
        group.claude_code_only = true;
        let gid = sched.store.insert_group(group).await.unwrap();

        let mut c = ctx("r1");
        c.group_id = Some(gid);
        let err = sched.select(&c, None, SONNET, &HashSet::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClaudeCodeOnly { .. }));
    }

    #[tokio::test]
    async fn fallback_cycle_is_rejected() {
        let sched = scheduler().await;
        // In-memory ids are sequential; the first insert points forward to
        // the second, the second back to the first.
        let mut b = test_group(Some(Platform::Anthropic));
        b.claude_code_only = true;
        b.fallback_group_id = Some(2);
        let b_id = sched.store.insert_group(b).await.unwrap();

        let mut a = test_group(Some(Platform::Anthropic));
        a.claude_code_only = true;
        a.fallback_group_id = Some(b_id);
        let a_id = sched.store.insert_group(a).await.unwrap();
        assert_eq!(a_id, 2);

        let mut c = ctx("r1");
        c.group_id = Some(a_id);
        let err = sched.select(&c, None, SONNET, &HashSet::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::GroupFallbackCycle { .. }));
    }

    #[tokio::test]
    async fn non_claude_code_request_walks_to_fallback_group() {
        let sched = scheduler().await;
        let acct = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();

        let mut open = test_group(Some(Platform::Anthropic));
        open.account_ids = vec![acct];
        let open_id = sched.store.insert_group(open).await.unwrap();

        let mut gated = test_group(Some(Platform::Anthropic));
        gated.claude_code_only = true;
        gated.fallback_group_id = Some(open_id);
        let gated_id = sched.store.insert_group(gated).await.unwrap();

        let mut c = ctx("r1");
        c.group_id = Some(gated_id);
        c.claude_code = false;
        let outcome = sched.select(&c, None, SONNET, &HashSet::new()).await.unwrap();
        assert_eq!(ready_id(outcome), acct);
    }

    #[tokio::test]
    async fn exhausted_claude_code_group_reenters_with_fallback() {
        let sched = scheduler().await;
        let acct = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();

        let mut open = test_group(Some(Platform::Anthropic));
        open.account_ids = vec![acct];
        let open_id = sched.store.insert_group(open).await.unwrap();

        // Gated group with no members at all.
        let mut gated = test_group(Some(Platform::Anthropic));
        gated.claude_code_only = true;
        gated.fallback_group_id = Some(open_id);
        let gated_id = sched.store.insert_group(gated).await.unwrap();

        let mut c = ctx("r1");
        c.group_id = Some(gated_id);
        c.claude_code = true;
        let outcome = sched.select(&c, None, SONNET, &HashSet::new()).await.unwrap();
        assert_eq!(ready_id(outcome), acct);
    }

    #[tokio::test]
    async fn gemini_prefers_oauth_at_equal_priority() {
        let sched = scheduler().await;
        let apikey = sched
            .store
            .insert_account(test_account(Platform::Gemini, 1))
            .await
            .unwrap();
        let mut oauth = test_account(Platform::Gemini, 1);
        oauth.kind = AccountKind::Oauth;
        oauth
            .credentials
            .insert("refresh_token".to_string(), json!("rt"));
        let oauth_id = sched.store.insert_account(oauth).await.unwrap();

        // The api-key account has the lower id; kind still wins.
        assert!(apikey < oauth_id);
        let outcome = sched
            .select(&ctx("r1"), None, "gemini-2.5-pro", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), oauth_id);
    }

    #[tokio::test]
    async fn digest_chain_sticky_pins_mid_conversation() {
        let sched = scheduler().await;
        let a = sched
            .store
            .insert_account(test_account(Platform::Gemini, 1))
            .await
            .unwrap();
        let b = sched
            .store
            .insert_account(test_account(Platform::Gemini, 1))
            .await
            .unwrap();

        let chain = sirius_session_core::digest_chain([("user", "hi"), ("model", "hello")]);
        let key = SessionKey::GeminiChain {
            prefix_hash: 42,
            chain: chain.clone(),
        };
        let first = sched
            .select(&ctx("r1"), Some(&key), "gemini-2.5-pro", &HashSet::new())
            .await
            .unwrap();
        let SelectOutcome::Ready(first) = first else {
            panic!("expected ready");
        };
        let pinned = first.account.id;
        assert!(pinned == a || pinned == b);
        assert!(first.session_uuid.is_some());

        // A longer chain (the conversation grew) still pins to the same
        // account through prefix probing.
        let longer = sirius_session_core::digest_chain([
            ("user", "hi"),
            ("model", "hello"),
            ("user", "more"),
        ]);
        let key2 = SessionKey::GeminiChain {
            prefix_hash: 42,
            chain: longer,
        };
        let second = sched
            .select(&ctx("r2"), Some(&key2), "gemini-2.5-pro", &HashSet::new())
            .await
            .unwrap();
        let SelectOutcome::Ready(second) = second else {
            panic!("expected ready");
        };
        assert_eq!(second.account.id, pinned);
        assert_eq!(second.session_uuid, first.session_uuid);
    }

    #[tokio::test]
    async fn never_used_accounts_rank_first_on_legacy_path() {
        let sched = scheduler_with(SchedulingConfig {
            load_batch_enabled: false,
            ..Default::default()
        })
        .await;
        let mut used = test_account(Platform::Anthropic, 1);
        used.last_used_at = Some(Utc::now());
        let used_id = sched.store.insert_account(used).await.unwrap();
        let fresh = sched
            .store
            .insert_account(test_account(Platform::Anthropic, 1))
            .await
            .unwrap();

        let outcome = sched
            .select(&ctx("r1"), None, SONNET, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(ready_id(outcome), fresh);
        let _ = used_id;
    }
}
