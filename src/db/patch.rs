use chrono::{DateTime, Utc};

/// Partial update for one account row. Outer `None` = leave the column
/// alone; inner `None` (for nullable columns) = set NULL.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub status: Option<String>,
    pub error_message: Option<Option<String>>,
    pub schedulable: Option<bool>,
    pub rate_limit_reset_at: Option<Option<DateTime<Utc>>>,
    pub overload_until: Option<Option<DateTime<Utc>>>,
    pub temp_unschedulable_until: Option<Option<DateTime<Utc>>>,
    /// JSON object scope → RFC3339, replacing the whole column.
    pub scoped_rate_limits: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// JSON object replacing the credentials column; always paired with a
    /// generation bump.
    pub credentials: Option<String>,
    pub credential_generation: Option<i64>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.error_message.is_none()
            && self.schedulable.is_none()
            && self.rate_limit_reset_at.is_none()
            && self.overload_until.is_none()
            && self.temp_unschedulable_until.is_none()
            && self.scoped_rate_limits.is_none()
            && self.last_used_at.is_none()
            && self.credentials.is_none()
            && self.credential_generation.is_none()
    }
}
