//! Database module: models and schema for persistent storage.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `patch.rs`: partial-update types applied by the actor

pub mod actor;
pub mod models;
pub mod patch;
pub mod schema;

pub use actor::{DbActorHandle, spawn};
pub use patch::AccountPatch;
pub use schema::SQLITE_INIT;
