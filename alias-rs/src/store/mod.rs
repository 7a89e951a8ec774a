//! Persistence port
//!
//! The routing pipeline only talks to storage through [`AliasStore`]. Each
//! method is one atomic unit: counter and bandwidth updates are single
//! row-level statements, alias creation runs in its own write transaction.
//!
//! - [`sqlite`]: SQLite adapter used in production and tests

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{
    Alias, AliasCounter, BandwidthUsage, Domain, NewAlias, Recipient, User, UserTotals,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use uuid::Uuid;

/// Per-user cap on new aliases inside a trailing window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationLimit {
    pub max_per_window: u32,
    pub window: Duration,
}

impl Default for CreationLimit {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window: Duration::hours(1),
        }
    }
}

/// Result of an idempotent lookup-or-create
#[derive(Debug, Clone, PartialEq)]
pub enum AliasCreation {
    Existing(Alias),
    Created(Alias),
    /// Nothing was written
    RateLimited,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AliasStore: Send + Sync {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Usernames are matched case-insensitively
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Custom domain lookup; unverified or inactive domains are not returned
    async fn find_verified_domain(&self, domain: &str) -> Result<Option<Domain>>;

    async fn find_alias(
        &self,
        user_id: Uuid,
        local_part: &str,
        domain: &str,
    ) -> Result<Option<Alias>>;

    async fn find_alias_by_id(&self, id: Uuid) -> Result<Option<Alias>>;

    /// Return the alias for `(user_id, local_part, domain)`, creating it if
    /// absent and the user is under `limit`. Safe under concurrent first
    /// contact: the unique key decides the winner and the loser reads it back.
    async fn create_alias_if_absent(
        &self,
        alias: NewAlias,
        limit: CreationLimit,
        now: DateTime<Utc>,
    ) -> Result<AliasCreation>;

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>>;

    /// Explicit override set of an alias (may contain unverified recipients)
    async fn alias_recipients(&self, alias_id: Uuid) -> Result<Vec<Recipient>>;

    async fn find_verified_recipient_by_email(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> Result<Option<Recipient>>;

    async fn increment_counter(&self, alias_id: Uuid, counter: AliasCounter) -> Result<()>;

    /// Returns false when the alias was already inactive or does not exist
    async fn deactivate_alias(&self, alias_id: Uuid) -> Result<bool>;

    async fn add_bandwidth(&self, user_id: Uuid, bytes: u64) -> Result<BandwidthUsage>;

    async fn user_totals(&self, user_id: Uuid) -> Result<UserTotals>;
}

/// Open a SQLite pool for `database_url`
///
/// In-memory databases live and die with their connection, so they are
/// pinned to a single connection that is never recycled.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    Ok(pool)
}
