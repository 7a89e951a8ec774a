//! SQLite implementation of [`AliasStore`]

use super::{AliasCreation, AliasStore, CreationLimit};
use crate::error::{AliasError, Result};
use crate::model::{
    Alias, AliasCounter, BandwidthUsage, Domain, NewAlias, Recipient, User, UserTotals,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

const ALIAS_COLUMNS: &str = "id, user_id, domain_id, local_part, domain, active, \
     emails_forwarded, emails_blocked, emails_replied, created_at, updated_at";

const USER_COLUMNS: &str =
    "id, username, default_recipient_id, bandwidth, bandwidth_limit, created_at";

const RECIPIENT_COLUMNS: &str = "id, user_id, email, email_verified_at";

/// Alias store backed by SQLite
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Initialize database tables
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                default_recipient_id TEXT,
                bandwidth INTEGER NOT NULL DEFAULT 0,
                bandwidth_limit INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                email TEXT NOT NULL,
                email_verified_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                domain TEXT NOT NULL UNIQUE,
                active INTEGER NOT NULL DEFAULT 1,
                verified_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aliases (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                domain_id TEXT,
                local_part TEXT NOT NULL,
                domain TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                emails_forwarded INTEGER NOT NULL DEFAULT 0,
                emails_blocked INTEGER NOT NULL DEFAULT 0,
                emails_replied INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, local_part, domain),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        // Rate limiting counts recent creations per user
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_aliases_user_created
            ON aliases(user_id, created_at)
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alias_recipients (
                alias_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (alias_id, recipient_id),
                FOREIGN KEY (alias_id) REFERENCES aliases(id) ON DELETE CASCADE,
                FOREIGN KEY (recipient_id) REFERENCES recipients(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Create a user with no default recipient yet
    pub async fn insert_user(&self, username: &str, bandwidth_limit: u64) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_lowercase(),
            default_recipient_id: None,
            bandwidth: 0,
            bandwidth_limit,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO users (id, username, bandwidth, bandwidth_limit, created_at)
            VALUES (?, ?, 0, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(to_db_int(bandwidth_limit))
        .bind(timestamp(user.created_at))
        .execute(&self.db)
        .await?;

        Ok(user)
    }

    pub async fn insert_recipient(
        &self,
        user_id: Uuid,
        email: &str,
        verified: bool,
    ) -> Result<Recipient> {
        let recipient = Recipient {
            id: Uuid::new_v4(),
            user_id,
            email: email.to_string(),
            email_verified_at: verified.then(Utc::now),
        };

        sqlx::query(
            r#"
            INSERT INTO recipients (id, user_id, email, email_verified_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(recipient.id.to_string())
        .bind(user_id.to_string())
        .bind(&recipient.email)
        .bind(recipient.email_verified_at.map(timestamp))
        .bind(timestamp(Utc::now()))
        .execute(&self.db)
        .await?;

        Ok(recipient)
    }

    pub async fn set_default_recipient(&self, user_id: Uuid, recipient_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET default_recipient_id = ? WHERE id = ?")
            .bind(recipient_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Mark a recipient verified (`true`) or clear its verification (`false`)
    pub async fn set_recipient_verified(&self, recipient_id: Uuid, verified: bool) -> Result<()> {
        sqlx::query("UPDATE recipients SET email_verified_at = ? WHERE id = ?")
            .bind(verified.then(|| timestamp(Utc::now())))
            .bind(recipient_id.to_string())
            .execute(&self.db)
            .await?;

        Ok(())
    }

    pub async fn insert_domain(&self, user_id: Uuid, domain: &str, verified: bool) -> Result<Domain> {
        let record = Domain {
            id: Uuid::new_v4(),
            user_id,
            domain: domain.to_lowercase(),
            active: true,
            verified_at: verified.then(Utc::now),
        };

        sqlx::query(
            r#"
            INSERT INTO domains (id, user_id, domain, active, verified_at, created_at)
            VALUES (?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(user_id.to_string())
        .bind(&record.domain)
        .bind(record.verified_at.map(timestamp))
        .bind(timestamp(Utc::now()))
        .execute(&self.db)
        .await?;

        Ok(record)
    }

    /// Insert an alias directly, bypassing rate limiting
    pub async fn insert_alias(
        &self,
        alias: NewAlias,
        id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Result<Alias> {
        let id = id.unwrap_or_else(Uuid::new_v4);

        sqlx::query(
            r#"
            INSERT INTO aliases (id, user_id, domain_id, local_part, domain, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(alias.user_id.to_string())
        .bind(alias.domain_id.map(|d| d.to_string()))
        .bind(&alias.local_part)
        .bind(&alias.domain)
        .bind(timestamp(created_at))
        .bind(timestamp(created_at))
        .execute(&self.db)
        .await?;

        self.find_alias_by_id(id)
            .await?
            .ok_or_else(|| AliasError::NotFound(format!("alias {} after insert", id)))
    }

    pub async fn attach_recipient(&self, alias_id: Uuid, recipient_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alias_recipients (alias_id, recipient_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(alias_id, recipient_id) DO NOTHING
            "#,
        )
        .bind(alias_id.to_string())
        .bind(recipient_id.to_string())
        .bind(timestamp(Utc::now()))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn set_bandwidth(&self, user_id: Uuid, bytes: u64) -> Result<()> {
        sqlx::query("UPDATE users SET bandwidth = ? WHERE id = ?")
            .bind(to_db_int(bytes))
            .bind(user_id.to_string())
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Aliases owned by a user, oldest first
    pub async fn list_aliases(&self, user_id: Uuid) -> Result<Vec<Alias>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM aliases WHERE user_id = ? ORDER BY created_at ASC",
            ALIAS_COLUMNS
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_alias).collect()
    }

    async fn find_alias_on(
        conn: &mut SqliteConnection,
        alias: &NewAlias,
    ) -> Result<Option<Alias>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM aliases WHERE user_id = ? AND local_part = ? AND domain = ?",
            ALIAS_COLUMNS
        ))
        .bind(alias.user_id.to_string())
        .bind(&alias.local_part)
        .bind(&alias.domain)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_alias).transpose()
    }
}

#[async_trait]
impl AliasStore for SqliteStore {
    async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE username = ?",
            USER_COLUMNS
        ))
        .bind(username.to_lowercase())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn find_verified_domain(&self, domain: &str) -> Result<Option<Domain>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, domain, active, verified_at
            FROM domains
            WHERE domain = ? AND active = 1 AND verified_at IS NOT NULL
            "#,
        )
        .bind(domain.to_lowercase())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_domain).transpose()
    }

    async fn find_alias(
        &self,
        user_id: Uuid,
        local_part: &str,
        domain: &str,
    ) -> Result<Option<Alias>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM aliases WHERE user_id = ? AND local_part = ? AND domain = ?",
            ALIAS_COLUMNS
        ))
        .bind(user_id.to_string())
        .bind(local_part.to_lowercase())
        .bind(domain.to_lowercase())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_alias).transpose()
    }

    async fn find_alias_by_id(&self, id: Uuid) -> Result<Option<Alias>> {
        let row = sqlx::query(&format!("SELECT {} FROM aliases WHERE id = ?", ALIAS_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(row_to_alias).transpose()
    }

    async fn create_alias_if_absent(
        &self,
        alias: NewAlias,
        limit: CreationLimit,
        now: DateTime<Utc>,
    ) -> Result<AliasCreation> {
        let cutoff = now - limit.window;
        let mut tx = self.db.begin().await?;

        // The insert is the first statement so the transaction takes the
        // write lock before reading anything. The window count and the
        // unique key are checked inside that one statement.
        let inserted = sqlx::query(
            r#"
            INSERT INTO aliases (id, user_id, domain_id, local_part, domain, created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM aliases WHERE user_id = ? AND created_at >= ?) < ?
            ON CONFLICT(user_id, local_part, domain) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(alias.user_id.to_string())
        .bind(alias.domain_id.map(|d| d.to_string()))
        .bind(&alias.local_part)
        .bind(&alias.domain)
        .bind(timestamp(now))
        .bind(timestamp(now))
        .bind(alias.user_id.to_string())
        .bind(timestamp(cutoff))
        .bind(i64::from(limit.max_per_window))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let stored = Self::find_alias_on(&mut *tx, &alias).await?;
        tx.commit().await?;

        match stored {
            Some(stored) if inserted == 1 => Ok(AliasCreation::Created(stored)),
            Some(stored) => Ok(AliasCreation::Existing(stored)),
            None => {
                debug!(
                    "User {} reached the alias limit since {}, refusing {}@{}",
                    alias.user_id, cutoff, alias.local_part, alias.domain
                );
                Ok(AliasCreation::RateLimited)
            }
        }
    }

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recipients WHERE id = ?",
            RECIPIENT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_recipient).transpose()
    }

    async fn alias_recipients(&self, alias_id: Uuid) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.user_id, r.email, r.email_verified_at
            FROM alias_recipients ar
            JOIN recipients r ON r.id = ar.recipient_id
            WHERE ar.alias_id = ?
            ORDER BY ar.created_at ASC, r.email ASC
            "#,
        )
        .bind(alias_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_recipient).collect()
    }

    async fn find_verified_recipient_by_email(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> Result<Option<Recipient>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recipients \
             WHERE user_id = ? AND lower(email) = lower(?) AND email_verified_at IS NOT NULL \
             LIMIT 1",
            RECIPIENT_COLUMNS
        ))
        .bind(user_id.to_string())
        .bind(email)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_recipient).transpose()
    }

    async fn increment_counter(&self, alias_id: Uuid, counter: AliasCounter) -> Result<()> {
        let column = counter.column();

        sqlx::query(&format!(
            "UPDATE aliases SET {column} = {column} + 1, updated_at = ? WHERE id = ?"
        ))
        .bind(timestamp(Utc::now()))
        .bind(alias_id.to_string())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn deactivate_alias(&self, alias_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("UPDATE aliases SET active = 0, updated_at = ? WHERE id = ? AND active = 1")
                .bind(timestamp(Utc::now()))
                .bind(alias_id.to_string())
                .execute(&self.db)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_bandwidth(&self, user_id: Uuid, bytes: u64) -> Result<BandwidthUsage> {
        let row = sqlx::query(
            r#"
            UPDATE users
            SET bandwidth = bandwidth + ?
            WHERE id = ?
            RETURNING bandwidth, bandwidth_limit
            "#,
        )
        .bind(to_db_int(bytes))
        .bind(user_id.to_string())
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AliasError::NotFound(format!("user {}", user_id)))?;

        let after = from_db_int(row.try_get("bandwidth")?);
        let limit = from_db_int(row.try_get("bandwidth_limit")?);

        Ok(BandwidthUsage {
            before: after.saturating_sub(bytes),
            after,
            limit,
        })
    }

    async fn user_totals(&self, user_id: Uuid) -> Result<UserTotals> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(emails_forwarded), 0) AS forwarded,
                   COALESCE(SUM(emails_blocked), 0) AS blocked,
                   COALESCE(SUM(emails_replied), 0) AS replied
            FROM aliases
            WHERE user_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .fetch_one(&self.db)
        .await?;

        Ok(UserTotals {
            emails_forwarded: row.try_get("forwarded")?,
            emails_blocked: row.try_get("blocked")?,
            emails_replied: row.try_get("replied")?,
        })
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AliasError::Parse(format!("bad timestamp {:?}: {}", value, e)))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| AliasError::Parse(format!("bad id {:?}: {}", value, e)))
}

// SQLite integers are signed; byte counters never get near i64::MAX
fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    let id: String = row.try_get("id")?;
    let default_recipient_id: Option<String> = row.try_get("default_recipient_id")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(User {
        id: parse_uuid(&id)?,
        username: row.try_get("username")?,
        default_recipient_id: default_recipient_id.as_deref().map(parse_uuid).transpose()?,
        bandwidth: from_db_int(row.try_get("bandwidth")?),
        bandwidth_limit: from_db_int(row.try_get("bandwidth_limit")?),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_recipient(row: &SqliteRow) -> Result<Recipient> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let verified_at: Option<String> = row.try_get("email_verified_at")?;

    Ok(Recipient {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        email: row.try_get("email")?,
        email_verified_at: verified_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn row_to_domain(row: &SqliteRow) -> Result<Domain> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let verified_at: Option<String> = row.try_get("verified_at")?;

    Ok(Domain {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        domain: row.try_get("domain")?,
        active: row.try_get("active")?,
        verified_at: verified_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn row_to_alias(row: &SqliteRow) -> Result<Alias> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let domain_id: Option<String> = row.try_get("domain_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Alias {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        domain_id: domain_id.as_deref().map(parse_uuid).transpose()?,
        local_part: row.try_get("local_part")?,
        domain: row.try_get("domain")?,
        active: row.try_get("active")?,
        emails_forwarded: row.try_get("emails_forwarded")?,
        emails_blocked: row.try_get("emails_blocked")?,
        emails_replied: row.try_get("emails_replied")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
