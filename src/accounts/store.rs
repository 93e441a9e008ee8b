use crate::accounts::model::{Account, AccountStatus, Group, Platform};
use crate::db::{AccountPatch, DbActorHandle};
use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::collections::HashMap;
use tracing::{info, warn};

/// Messages handled by the account store actor. Mutations are CAS-flavored:
/// applying the same transition twice lands in the same state, so upstream
/// classifiers may retry freely.
#[derive(Debug)]
pub enum AccountStoreMessage {
    GetAccount(i64, RpcReplyPort<Option<Account>>),
    GetGroup(i64, RpcReplyPort<Option<Group>>),
    ListSchedulableByPlatforms(Vec<Platform>, RpcReplyPort<Vec<Account>>),
    ListSchedulableByGroup(i64, RpcReplyPort<Vec<Account>>),

    InsertAccount(Box<Account>, RpcReplyPort<Result<i64, GatewayError>>),
    InsertGroup(Box<Group>, RpcReplyPort<Result<i64, GatewayError>>),

    SetError(i64, String, RpcReplyPort<()>),
    SetRateLimit(i64, DateTime<Utc>, RpcReplyPort<()>),
    SetScopedRateLimit(i64, String, DateTime<Utc>, RpcReplyPort<()>),
    SetOverload(i64, DateTime<Utc>, RpcReplyPort<()>),
    SetTempUnschedulable(i64, DateTime<Utc>, String, RpcReplyPort<()>),
    ClearRateLimit(i64, RpcReplyPort<()>),
    ClearOverload(i64, RpcReplyPort<()>),
    /// Success path: clear rate-limit/overload timers and stamp last_used_at.
    MarkSuccess(i64, DateTime<Utc>, RpcReplyPort<()>),

    /// Batched last_used_at stamp from the selection hot path (no reply).
    TouchLastUsed { ids: Vec<i64>, at: DateTime<Utc> },
}

#[derive(Clone)]
pub struct AccountStoreHandle {
    actor: ActorRef<AccountStoreMessage>,
}

impl AccountStoreHandle {
    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::GetAccount, id)
            .map_err(|e| GatewayError::Actor(format!("AccountStore GetAccount RPC failed: {e}")))
    }

    pub async fn get_group(&self, id: i64) -> Result<Option<Group>, GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::GetGroup, id)
            .map_err(|e| GatewayError::Actor(format!("AccountStore GetGroup RPC failed: {e}")))
    }

    pub async fn list_schedulable_by_platforms(
        &self,
        platforms: Vec<Platform>,
    ) -> Result<Vec<Account>, GatewayError> {
        ractor::call!(
            self.actor,
            AccountStoreMessage::ListSchedulableByPlatforms,
            platforms
        )
        .map_err(|e| {
            GatewayError::Actor(format!("AccountStore ListSchedulableByPlatforms RPC failed: {e}"))
        })
    }

    pub async fn list_schedulable_by_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<Account>, GatewayError> {
        ractor::call!(
            self.actor,
            AccountStoreMessage::ListSchedulableByGroup,
            group_id
        )
        .map_err(|e| {
            GatewayError::Actor(format!("AccountStore ListSchedulableByGroup RPC failed: {e}"))
        })
    }

    pub async fn insert_account(&self, account: Account) -> Result<i64, GatewayError> {
        ractor::call!(
            self.actor,
            AccountStoreMessage::InsertAccount,
            Box::new(account)
        )
        .map_err(|e| GatewayError::Actor(format!("AccountStore InsertAccount RPC failed: {e}")))?
    }

    pub async fn insert_group(&self, group: Group) -> Result<i64, GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::InsertGroup, Box::new(group))
            .map_err(|e| GatewayError::Actor(format!("AccountStore InsertGroup RPC failed: {e}")))?
    }

    pub async fn set_error(&self, id: i64, message: String) -> Result<(), GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::SetError, id, message)
            .map_err(|e| GatewayError::Actor(format!("AccountStore SetError RPC failed: {e}")))
    }

    pub async fn set_rate_limit(
        &self,
        id: i64,
        reset_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::SetRateLimit, id, reset_at)
            .map_err(|e| GatewayError::Actor(format!("AccountStore SetRateLimit RPC failed: {e}")))
    }

    pub async fn set_scoped_rate_limit(
        &self,
        id: i64,
        scope: String,
        reset_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        ractor::call!(
            self.actor,
            AccountStoreMessage::SetScopedRateLimit,
            id,
            scope,
            reset_at
        )
        .map_err(|e| {
            GatewayError::Actor(format!("AccountStore SetScopedRateLimit RPC failed: {e}"))
        })
    }

    pub async fn set_overload(&self, id: i64, until: DateTime<Utc>) -> Result<(), GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::SetOverload, id, until)
            .map_err(|e| GatewayError::Actor(format!("AccountStore SetOverload RPC failed: {e}")))
    }

    pub async fn set_temp_unschedulable(
        &self,
        id: i64,
        until: DateTime<Utc>,
        reason: String,
    ) -> Result<(), GatewayError> {
        ractor::call!(
            self.actor,
            AccountStoreMessage::SetTempUnschedulable,
            id,
            until,
            reason
        )
        .map_err(|e| {
            GatewayError::Actor(format!("AccountStore SetTempUnschedulable RPC failed: {e}"))
        })
    }

    pub async fn clear_rate_limit(&self, id: i64) -> Result<(), GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::ClearRateLimit, id).map_err(|e| {
            GatewayError::Actor(format!("AccountStore ClearRateLimit RPC failed: {e}"))
        })
    }

    pub async fn clear_overload(&self, id: i64) -> Result<(), GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::ClearOverload, id)
            .map_err(|e| GatewayError::Actor(format!("AccountStore ClearOverload RPC failed: {e}")))
    }

    pub async fn mark_success(&self, id: i64, at: DateTime<Utc>) -> Result<(), GatewayError> {
        ractor::call!(self.actor, AccountStoreMessage::MarkSuccess, id, at)
            .map_err(|e| GatewayError::Actor(format!("AccountStore MarkSuccess RPC failed: {e}")))
    }

    /// Fire-and-forget batched `last_used_at` stamp.
    pub fn touch_last_used(&self, ids: Vec<i64>, at: DateTime<Utc>) {
        let _ = ractor::cast!(self.actor, AccountStoreMessage::TouchLastUsed { ids, at });
    }
}

struct AccountStoreState {
    accounts: HashMap<i64, Account>,
    groups: HashMap<i64, Group>,
    db: Option<DbActorHandle>,
    /// Monotonic ids for the in-memory (db-less) mode used by tests.
    next_mem_id: i64,
}

impl AccountStoreState {
    fn persist(&self, id: i64, patch: AccountPatch) {
        let Some(db) = self.db.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = db.patch_account(id, patch).await {
                warn!("account {id}: write-behind patch failed: {e}");
            }
        });
    }

    fn scoped_json(account: &Account) -> String {
        let scoped: HashMap<&String, String> = account
            .scoped_rate_limits
            .iter()
            .map(|(k, v)| (k, v.to_rfc3339()))
            .collect();
        serde_json::to_string(&scoped).unwrap_or_else(|_| "{}".to_string())
    }
}

struct AccountStoreActor;

#[ractor::async_trait]
impl Actor for AccountStoreActor {
    type Msg = AccountStoreMessage;
    type State = AccountStoreState;
    type Arguments = Option<DbActorHandle>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        db: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (accounts, groups) = match &db {
            Some(db) => {
                let accounts = db
                    .list_accounts()
                    .await
                    .map_err(|e| ActorProcessingErr::from(format!("load accounts failed: {e}")))?;
                let groups = db
                    .list_groups()
                    .await
                    .map_err(|e| ActorProcessingErr::from(format!("load groups failed: {e}")))?;
                (accounts, groups)
            }
            None => (Vec::new(), Vec::new()),
        };

        info!(
            accounts = accounts.len(),
            groups = groups.len(),
            "AccountStore loaded"
        );

        Ok(AccountStoreState {
            accounts: accounts.into_iter().map(|a| (a.id, a)).collect(),
            groups: groups.into_iter().map(|g| (g.id, g)).collect(),
            db,
            next_mem_id: 1,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            AccountStoreMessage::GetAccount(id, reply) => {
                let _ = reply.send(state.accounts.get(&id).cloned());
            }
            AccountStoreMessage::GetGroup(id, reply) => {
                let _ = reply.send(state.groups.get(&id).cloned());
            }
            AccountStoreMessage::ListSchedulableByPlatforms(platforms, reply) => {
                let mut out: Vec<Account> = state
                    .accounts
                    .values()
                    .filter(|a| a.schedulable && platforms.contains(&a.platform))
                    .cloned()
                    .collect();
                out.sort_by_key(|a| a.id);
                let _ = reply.send(out);
            }
            AccountStoreMessage::ListSchedulableByGroup(group_id, reply) => {
                let mut out: Vec<Account> = state
                    .accounts
                    .values()
                    .filter(|a| a.schedulable && a.group_ids.contains(&group_id))
                    .cloned()
                    .collect();
                out.sort_by_key(|a| a.id);
                let _ = reply.send(out);
            }

            AccountStoreMessage::InsertAccount(account, reply) => {
                let res = self.insert_account(state, *account).await;
                let _ = reply.send(res);
            }
            AccountStoreMessage::InsertGroup(group, reply) => {
                let res = self.insert_group(state, *group).await;
                let _ = reply.send(res);
            }

            AccountStoreMessage::SetError(id, message, reply) => {
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.status = AccountStatus::Error;
                    account.error_message = Some(message.clone());
                    // The error status supersedes the transient indicators
                    // for display; it does not make the account eligible.
                    account.rate_limit_reset_at = None;
                    account.overload_until = None;
                    warn!(account.id = id, %message, "account transitioned to error");
                    state.persist(
                        id,
                        AccountPatch {
                            status: Some(AccountStatus::Error.as_str().to_string()),
                            error_message: Some(Some(message)),
                            rate_limit_reset_at: Some(None),
                            overload_until: Some(None),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::SetRateLimit(id, reset_at, reply) => {
                let reset_at = reset_at.max(Utc::now());
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.rate_limit_reset_at = Some(reset_at);
                    info!(account.id = id, reset_at = %reset_at, "account rate-limited");
                    state.persist(
                        id,
                        AccountPatch {
                            rate_limit_reset_at: Some(Some(reset_at)),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::SetScopedRateLimit(id, scope, reset_at, reply) => {
                let reset_at = reset_at.max(Utc::now());
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.scoped_rate_limits.insert(scope.clone(), reset_at);
                    info!(account.id = id, %scope, reset_at = %reset_at, "scope rate-limited");
                    let scoped = AccountStoreState::scoped_json(account);
                    state.persist(
                        id,
                        AccountPatch {
                            scoped_rate_limits: Some(scoped),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::SetOverload(id, until, reply) => {
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.overload_until = Some(until);
                    info!(account.id = id, until = %until, "account overloaded");
                    state.persist(
                        id,
                        AccountPatch {
                            overload_until: Some(Some(until)),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::SetTempUnschedulable(id, until, reason, reply) => {
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.temp_unschedulable_until = Some(until);
                    warn!(account.id = id, until = %until, %reason, "account temp-unschedulable");
                    state.persist(
                        id,
                        AccountPatch {
                            temp_unschedulable_until: Some(Some(until)),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::ClearRateLimit(id, reply) => {
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.rate_limit_reset_at = None;
                    state.persist(
                        id,
                        AccountPatch {
                            rate_limit_reset_at: Some(None),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::ClearOverload(id, reply) => {
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.overload_until = None;
                    state.persist(
                        id,
                        AccountPatch {
                            overload_until: Some(None),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::MarkSuccess(id, at, reply) => {
                if let Some(account) = state.accounts.get_mut(&id) {
                    account.rate_limit_reset_at = None;
                    account.overload_until = None;
                    account.last_used_at = Some(at);
                    state.persist(
                        id,
                        AccountPatch {
                            rate_limit_reset_at: Some(None),
                            overload_until: Some(None),
                            last_used_at: Some(at),
                            ..Default::default()
                        },
                    );
                }
                let _ = reply.send(());
            }

            AccountStoreMessage::TouchLastUsed { ids, at } => {
                for id in ids {
                    if let Some(account) = state.accounts.get_mut(&id) {
                        account.last_used_at = Some(at);
                        state.persist(
                            id,
                            AccountPatch {
                                last_used_at: Some(at),
                                ..Default::default()
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl AccountStoreActor {
    async fn insert_account(
        &self,
        state: &mut AccountStoreState,
        mut account: Account,
    ) -> Result<i64, GatewayError> {
        let id = match &state.db {
            Some(db) => db.insert_account(account.clone()).await?,
            None => {
                let id = state.next_mem_id;
                state.next_mem_id += 1;
                id
            }
        };
        account.id = id;
        for group_id in &account.group_ids {
            if let Some(group) = state.groups.get_mut(group_id) {
                if !group.account_ids.contains(&id) {
                    group.account_ids.push(id);
                }
            }
        }
        state.accounts.insert(id, account);
        Ok(id)
    }

    async fn insert_group(
        &self,
        state: &mut AccountStoreState,
        mut group: Group,
    ) -> Result<i64, GatewayError> {
        let id = match &state.db {
            Some(db) => db.insert_group(group.clone()).await?,
            None => {
                let id = state.next_mem_id;
                state.next_mem_id += 1;
                id
            }
        };
        group.id = id;
        group.hydrated = true;
        for account_id in &group.account_ids {
            if let Some(account) = state.accounts.get_mut(account_id) {
                if !account.group_ids.contains(&id) {
                    account.group_ids.push(id);
                }
            }
        }
        state.groups.insert(id, group);
        Ok(id)
    }
}

/// Spawn the account store backed by the database actor.
pub async fn spawn(db: DbActorHandle) -> AccountStoreHandle {
    spawn_inner(Some(db)).await
}

/// Spawn a store with no persistence. Used by tests and benches.
pub async fn spawn_in_memory() -> AccountStoreHandle {
    spawn_inner(None).await
}

async fn spawn_inner(db: Option<DbActorHandle>) -> AccountStoreHandle {
    let (actor, _jh) = Actor::spawn(None, AccountStoreActor, db)
        .await
        .expect("failed to spawn AccountStoreActor");
    AccountStoreHandle { actor }
}
