//! Account domain model and the read-mostly store actor.
//!
//! The store owns the in-memory account/group maps; every status mutation is
//! serialized through its actor and persisted write-behind. Eligibility is
//! always recomputed from the stored fields by callers.

pub mod cooldown;
pub mod model;
pub mod store;

pub use cooldown::TestCooldown;
pub use model::{
    ANTIGRAVITY_MODELS, Account, AccountKind, AccountStatus, Credential, Group, GroupStatus,
    Platform, TempUnschedulableRule,
};
pub use store::{AccountStoreHandle, AccountStoreMessage};
