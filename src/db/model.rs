//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// The OAuth credential singleton row.
#[derive(Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A stored discovery query joined with its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct GroupFilter {
    pub id: i64,
    pub category_id: i64,
    pub category_name: Option<String>,
    pub country: String,
    pub location: String,
    pub active: bool,
}

impl fmt::Display for GroupFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = self.category_name.as_deref().unwrap_or("category");
        write!(f, "{} ({}) in {}, {}", category, self.category_id, self.location, self.country)?;
        if !self.active {
            write!(f, " (inactive)")?;
        }
        Ok(())
    }
}

/// Group slice used by the member scheduler.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SyncTarget {
    pub urlname: String,
    pub name: Option<String>,
    pub next_update: DateTime<Utc>,
}
