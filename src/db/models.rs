//! Rust structs mirroring DB rows, plus conversions into the domain model.

use crate::accounts::{Account, AccountKind, AccountStatus, Group, GroupStatus, Platform};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, FromRow)]
pub struct DbAccountRow {
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub kind: String,
    pub priority: i64,
    pub schedulable: bool,
    pub status: String,
    pub error_message: Option<String>,
    pub concurrency: i64,
    pub credentials: String,
    pub credential_generation: i64,
    pub extra: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overload_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    pub scoped_rate_limits: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbGroupRow {
    pub id: i64,
    pub name: String,
    pub platform: Option<String>,
    pub status: String,
    pub claude_code_only: bool,
    pub fallback_group_id: Option<i64>,
    pub model_routing_enabled: bool,
    pub model_routing: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, FromRow)]
pub struct DbAccountGroupRow {
    pub account_id: i64,
    pub group_id: i64,
}

fn json_object(raw: &str) -> Map<String, Value> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

fn scoped_limits(raw: &str) -> BTreeMap<String, DateTime<Utc>> {
    json_object(raw)
        .into_iter()
        .filter_map(|(scope, v)| {
            let ts = v.as_str()?;
            let reset = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
            Some((scope, reset))
        })
        .collect()
}

impl DbAccountRow {
    /// Project a row into the domain account. Rows with unknown enum text are
    /// rejected rather than silently defaulted.
    pub fn into_account(self, group_ids: Vec<i64>) -> Result<Account, String> {
        let platform = Platform::parse(&self.platform)
            .ok_or_else(|| format!("account {}: unknown platform {}", self.id, self.platform))?;
        let kind = AccountKind::parse(&self.kind)
            .ok_or_else(|| format!("account {}: unknown kind {}", self.id, self.kind))?;
        let status = AccountStatus::parse(&self.status)
            .ok_or_else(|| format!("account {}: unknown status {}", self.id, self.status))?;

        Ok(Account {
            id: self.id,
            name: self.name,
            platform,
            kind,
            priority: self.priority as i32,
            schedulable: self.schedulable,
            status,
            error_message: self.error_message,
            concurrency: self.concurrency.max(0) as u32,
            credentials: json_object(&self.credentials),
            credential_generation: self.credential_generation.max(0) as u64,
            last_used_at: self.last_used_at,
            rate_limit_reset_at: self.rate_limit_reset_at,
            overload_until: self.overload_until,
            temp_unschedulable_until: self.temp_unschedulable_until,
            scoped_rate_limits: scoped_limits(&self.scoped_rate_limits),
            group_ids,
            extra: json_object(&self.extra),
        })
    }
}

impl DbGroupRow {
    pub fn into_group(self, account_ids: Vec<i64>) -> Result<Group, String> {
        let platform = match self.platform.as_deref() {
            None | Some("") => None,
            Some(p) => Some(
                Platform::parse(p)
                    .ok_or_else(|| format!("group {}: unknown platform {p}", self.id))?,
            ),
        };
        let status = GroupStatus::parse(&self.status)
            .ok_or_else(|| format!("group {}: unknown status {}", self.id, self.status))?;

        let model_routing: HashMap<String, Vec<i64>> = serde_json::from_str(&self.model_routing)
            .unwrap_or_default();

        Ok(Group {
            id: self.id,
            name: self.name,
            platform,
            status,
            hydrated: true,
            claude_code_only: self.claude_code_only,
            fallback_group_id: self.fallback_group_id,
            model_routing_enabled: self.model_routing_enabled,
            model_routing,
            account_ids,
        })
    }
}
