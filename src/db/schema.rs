//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema includes:
/// - `accounts` table (one upstream credential holder per row)
/// - `groups` table (routing policy shared by a subset of accounts)
/// - `account_groups` join table (membership)
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Accounts
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    platform TEXT NOT NULL,              -- anthropic | openai | gemini | antigravity | sora
    kind TEXT NOT NULL,                  -- oauth | apikey | setup_token
    priority INTEGER NOT NULL DEFAULT 50,
    schedulable INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'active',
    error_message TEXT NULL,
    concurrency INTEGER NOT NULL DEFAULT 3,
    credentials TEXT NOT NULL DEFAULT '{}',       -- JSON object
    credential_generation INTEGER NOT NULL DEFAULT 0,
    extra TEXT NOT NULL DEFAULT '{}',             -- JSON object
    last_used_at TEXT NULL,              -- RFC3339
    rate_limit_reset_at TEXT NULL,       -- RFC3339
    overload_until TEXT NULL,            -- RFC3339
    temp_unschedulable_until TEXT NULL,  -- RFC3339
    scoped_rate_limits TEXT NOT NULL DEFAULT '{}', -- JSON scope -> RFC3339
    created_at TEXT NOT NULL,            -- RFC3339
    updated_at TEXT NOT NULL             -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_accounts_platform ON accounts(platform);
CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts(status);

-- ---------------------------------------------------------------------------
-- Groups
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    platform TEXT NULL,                  -- NULL for multi-platform groups
    status TEXT NOT NULL DEFAULT 'active',
    claude_code_only INTEGER NOT NULL DEFAULT 0,
    fallback_group_id INTEGER NULL,
    model_routing_enabled INTEGER NOT NULL DEFAULT 0,
    model_routing TEXT NOT NULL DEFAULT '{}',     -- JSON model -> [account ids]
    created_at TEXT NOT NULL,            -- RFC3339
    updated_at TEXT NOT NULL             -- RFC3339
);

-- ---------------------------------------------------------------------------
-- Membership
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS account_groups (
    account_id INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    PRIMARY KEY (account_id, group_id)
);

CREATE INDEX IF NOT EXISTS idx_account_groups_group ON account_groups(group_id);
"#;
