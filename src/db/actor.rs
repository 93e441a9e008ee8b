use crate::accounts::{Account, Group};
use crate::db::models::{DbAccountGroupRow, DbAccountRow, DbGroupRow};
use crate::db::patch::AccountPatch;
use crate::db::schema::SQLITE_INIT;
use crate::error::GatewayError;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::{str::FromStr, time::Duration};
use tracing::{info, warn};

#[derive(Debug)]
pub enum DbActorMessage {
    /// Load every account with its group memberships.
    ListAccounts(RpcReplyPort<Result<Vec<Account>, GatewayError>>),

    /// Load every group with its member account ids.
    ListGroups(RpcReplyPort<Result<Vec<Group>, GatewayError>>),

    /// Insert an account (plus membership rows) and return its id.
    InsertAccount(Box<Account>, RpcReplyPort<Result<i64, GatewayError>>),

    /// Insert a group and return its id.
    InsertGroup(Box<Group>, RpcReplyPort<Result<i64, GatewayError>>),

    /// Patch an account row by id.
    PatchAccount(i64, AccountPatch, RpcReplyPort<Result<(), GatewayError>>),
}

#[derive(Clone)]
pub struct DbActorHandle {
    actor: ActorRef<DbActorMessage>,
}

impl DbActorHandle {
    pub async fn list_accounts(&self) -> Result<Vec<Account>, GatewayError> {
        ractor::call!(self.actor, DbActorMessage::ListAccounts)
            .map_err(|e| GatewayError::Actor(format!("DbActor ListAccounts RPC failed: {e}")))?
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, GatewayError> {
        ractor::call!(self.actor, DbActorMessage::ListGroups)
            .map_err(|e| GatewayError::Actor(format!("DbActor ListGroups RPC failed: {e}")))?
    }

    pub async fn insert_account(&self, account: Account) -> Result<i64, GatewayError> {
        ractor::call!(self.actor, DbActorMessage::InsertAccount, Box::new(account))
            .map_err(|e| GatewayError::Actor(format!("DbActor InsertAccount RPC failed: {e}")))?
    }

    pub async fn insert_group(&self, group: Group) -> Result<i64, GatewayError> {
        ractor::call!(self.actor, DbActorMessage::InsertGroup, Box::new(group))
            .map_err(|e| GatewayError::Actor(format!("DbActor InsertGroup RPC failed: {e}")))?
    }

    pub async fn patch_account(&self, id: i64, patch: AccountPatch) -> Result<(), GatewayError> {
        ractor::call!(self.actor, DbActorMessage::PatchAccount, id, patch)
            .map_err(|e| GatewayError::Actor(format!("DbActor PatchAccount RPC failed: {e}")))?
    }
}

struct DbActorState {
    pool: SqlitePool,
}

struct DbActor;

#[ractor::async_trait]
impl Actor for DbActor {
    type Msg = DbActorMessage;
    type State = DbActorState;
    type Arguments = String;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        database_url: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("DbActor initialized");
        Ok(DbActorState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DbActorMessage::ListAccounts(reply) => {
                let res = self.list_accounts(&state.pool).await;
                let _ = reply.send(res);
            }
            DbActorMessage::ListGroups(reply) => {
                let res = self.list_groups(&state.pool).await;
                let _ = reply.send(res);
            }
            DbActorMessage::InsertAccount(account, reply) => {
                let res = self.insert_account(&state.pool, *account).await;
                let _ = reply.send(res);
            }
            DbActorMessage::InsertGroup(group, reply) => {
                let res = self.insert_group(&state.pool, *group).await;
                let _ = reply.send(res);
            }
            DbActorMessage::PatchAccount(id, patch, reply) => {
                let res = self.patch_account(&state.pool, id, patch).await;
                let _ = reply.send(res);
            }
        }
        Ok(())
    }
}

impl DbActor {
    async fn load_memberships(
        &self,
        pool: &SqlitePool,
    ) -> Result<Vec<DbAccountGroupRow>, GatewayError> {
        let rows = sqlx::query_as::<_, DbAccountGroupRow>(
            "SELECT account_id, group_id FROM account_groups",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn list_accounts(&self, pool: &SqlitePool) -> Result<Vec<Account>, GatewayError> {
        let rows = sqlx::query_as::<_, DbAccountRow>(
            r#"
        SELECT id, name, platform, kind, priority, schedulable, status, error_message,
               concurrency, credentials, credential_generation, extra, last_used_at,
               rate_limit_reset_at, overload_until, temp_unschedulable_until,
               scoped_rate_limits, created_at, updated_at
        FROM accounts
        ORDER BY id
        "#,
        )
        .fetch_all(pool)
        .await?;

        let mut memberships: HashMap<i64, Vec<i64>> = HashMap::new();
        for m in self.load_memberships(pool).await? {
            memberships.entry(m.account_id).or_default().push(m.group_id);
        }

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            let group_ids = memberships.remove(&id).unwrap_or_default();
            match row.into_account(group_ids) {
                Ok(account) => accounts.push(account),
                Err(reason) => warn!("skipping malformed account row: {reason}"),
            }
        }
        Ok(accounts)
    }

    async fn list_groups(&self, pool: &SqlitePool) -> Result<Vec<Group>, GatewayError> {
        let rows = sqlx::query_as::<_, DbGroupRow>(
            r#"
        SELECT id, name, platform, status, claude_code_only, fallback_group_id,
               model_routing_enabled, model_routing, created_at, updated_at
        FROM groups
        ORDER BY id
        "#,
        )
        .fetch_all(pool)
        .await?;

        let mut members: HashMap<i64, Vec<i64>> = HashMap::new();
        for m in self.load_memberships(pool).await? {
            members.entry(m.group_id).or_default().push(m.account_id);
        }

        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            let account_ids = members.remove(&id).unwrap_or_default();
            match row.into_group(account_ids) {
                Ok(group) => groups.push(group),
                Err(reason) => warn!("skipping malformed group row: {reason}"),
            }
        }
        Ok(groups)
    }

    async fn insert_account(
        &self,
        pool: &SqlitePool,
        account: Account,
    ) -> Result<i64, GatewayError> {
        let now = Utc::now();
        let credentials = serde_json::to_string(&account.credentials)?;
        let extra = serde_json::to_string(&account.extra)?;
        let scoped: HashMap<&String, String> = account
            .scoped_rate_limits
            .iter()
            .map(|(k, v)| (k, v.to_rfc3339()))
            .collect();
        let scoped = serde_json::to_string(&scoped)?;

        let id: i64 = sqlx::query_scalar(
            r#"
        INSERT INTO accounts (
            name, platform, kind, priority, schedulable, status, error_message,
            concurrency, credentials, credential_generation, extra, last_used_at,
            rate_limit_reset_at, overload_until, temp_unschedulable_until,
            scoped_rate_limits, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
        )
        .bind(&account.name)
        .bind(account.platform.as_str())
        .bind(account.kind.as_str())
        .bind(i64::from(account.priority))
        .bind(account.schedulable)
        .bind(account.status.as_str())
        .bind(&account.error_message)
        .bind(i64::from(account.concurrency))
        .bind(credentials)
        .bind(account.credential_generation as i64)
        .bind(extra)
        .bind(account.last_used_at)
        .bind(account.rate_limit_reset_at)
        .bind(account.overload_until)
        .bind(account.temp_unschedulable_until)
        .bind(scoped)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?;

        for group_id in &account.group_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO account_groups (account_id, group_id) VALUES (?, ?)",
            )
            .bind(id)
            .bind(group_id)
            .execute(pool)
            .await?;
        }

        Ok(id)
    }

    async fn insert_group(&self, pool: &SqlitePool, group: Group) -> Result<i64, GatewayError> {
        let now = Utc::now();
        let model_routing = serde_json::to_string(&group.model_routing)?;

        let id: i64 = sqlx::query_scalar(
            r#"
        INSERT INTO groups (
            name, platform, status, claude_code_only, fallback_group_id,
            model_routing_enabled, model_routing, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
        )
        .bind(&group.name)
        .bind(group.platform.map(|p| p.as_str()))
        .bind(group.status.as_str())
        .bind(group.claude_code_only)
        .bind(group.fallback_group_id)
        .bind(group.model_routing_enabled)
        .bind(model_routing)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?;

        for account_id in &group.account_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO account_groups (account_id, group_id) VALUES (?, ?)",
            )
            .bind(account_id)
            .bind(id)
            .execute(pool)
            .await?;
        }

        Ok(id)
    }

    async fn patch_account(
        &self,
        pool: &SqlitePool,
        id: i64,
        patch: AccountPatch,
    ) -> Result<(), GatewayError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut qb = sqlx::QueryBuilder::new("UPDATE accounts SET updated_at = ");
        qb.push_bind(Utc::now());

        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status);
        }
        if let Some(error_message) = patch.error_message {
            qb.push(", error_message = ").push_bind(error_message);
        }
        if let Some(schedulable) = patch.schedulable {
            qb.push(", schedulable = ").push_bind(schedulable);
        }
        if let Some(reset) = patch.rate_limit_reset_at {
            qb.push(", rate_limit_reset_at = ").push_bind(reset);
        }
        if let Some(until) = patch.overload_until {
            qb.push(", overload_until = ").push_bind(until);
        }
        if let Some(until) = patch.temp_unschedulable_until {
            qb.push(", temp_unschedulable_until = ").push_bind(until);
        }
        if let Some(scoped) = patch.scoped_rate_limits {
            qb.push(", scoped_rate_limits = ").push_bind(scoped);
        }
        if let Some(last_used) = patch.last_used_at {
            qb.push(", last_used_at = ").push_bind(last_used);
        }
        if let Some(credentials) = patch.credentials {
            qb.push(", credentials = ").push_bind(credentials);
        }
        if let Some(generation) = patch.credential_generation {
            qb.push(", credential_generation = ").push_bind(generation);
        }

        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(pool).await?;
        Ok(())
    }
}

/// Spawn the database actor and return a cloneable handle.
pub async fn spawn(database_url: &str) -> DbActorHandle {
    // Suffixed so repeated spawns within the same process (e.g. multiple
    // tests in one test binary) don't collide in ractor's name registry.
    let name = format!("DbActor-{}", uuid::Uuid::new_v4());
    let (actor, _jh) = ractor::Actor::spawn(Some(name), DbActor, database_url.to_string())
        .await
        .expect("failed to spawn DbActor");

    DbActorHandle { actor }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), GatewayError> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}
