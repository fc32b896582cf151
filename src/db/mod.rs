//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions that read and upsert them.
//!
//! External modules should import from `meetup_sync::db`; the repository API
//! and the models are re-exported here.

pub mod model;
pub mod repo;

pub use model::{Credential, GroupFilter, SyncTarget};
pub use repo::*;
