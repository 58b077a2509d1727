//! Durable per-user quota counters and the session log
//!
//! Backed by SQLite through sqlx. Every operation is independently
//! atomic at the database; the accounting flush pair
//! ([`add_session_bytes`] + [`add_user_allowance_used`]) is deliberately
//! not wrapped in a transaction, so the session row and the user counter
//! may diverge by at most one unflushed batch after a crash.
//!
//! [`add_session_bytes`]: QuotaStore::add_session_bytes
//! [`add_user_allowance_used`]: QuotaStore::add_user_allowance_used

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Months, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

const USERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        max_conn INTEGER NOT NULL DEFAULT 0,
        allowance INTEGER NOT NULL DEFAULT 0,
        end_date TEXT NOT NULL,
        allowance_used INTEGER NOT NULL DEFAULT 0,
        period INTEGER NOT NULL DEFAULT 1,
        conn_used INTEGER NOT NULL DEFAULT 0
    )";

const SESSIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        bytes INTEGER NOT NULL DEFAULT 0,
        conn_time TEXT NOT NULL
    )";

/// A user record as stored
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Opaque credential: plaintext or a hash, depending on the
    /// configured password scheme
    pub password: String,
    pub max_conn: i64,
    /// Byte allowance per period; 0 means unlimited
    pub allowance: i64,
    /// When `allowance_used` becomes eligible for reset
    pub end_date: DateTime<Utc>,
    pub allowance_used: i64,
    /// Renewal period in months
    pub period: i64,
    /// Frontend sessions currently held by this user
    pub conn_used: i64,
}

/// One row of the session log
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: i64,
    pub user_id: i64,
    pub bytes: i64,
    pub conn_time: DateTime<Utc>,
}

/// Parameters for provisioning a new user
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub max_conn: i64,
    pub allowance: i64,
    pub period: i64,
}

/// Handle to the durable quota store
#[derive(Clone)]
pub struct QuotaStore {
    pool: SqlitePool,
}

impl QuotaStore {
    /// Open (and initialize if needed) the store at the given URL
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid quota store URL '{}'", url))?
            .create_if_missing(true);

        // A single connection keeps every operation serialized; SQLite
        // only admits one writer anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open quota store '{}'", url))?;

        sqlx::query(USERS_TABLE)
            .execute(&pool)
            .await
            .context("failed to create users table")?;
        sqlx::query(SESSIONS_TABLE)
            .execute(&pool)
            .await
            .context("failed to create sessions table")?;

        Ok(Self { pool })
    }

    /// Provision a user; the first period starts now
    pub async fn create_user(&self, user: &NewUser<'_>) -> Result<i64> {
        let end_date = Utc::now()
            .checked_add_months(Months::new(user.period.max(0) as u32))
            .unwrap_or_else(Utc::now);
        let result = sqlx::query(
            "INSERT INTO users (username, password, max_conn, allowance, end_date, period)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user.username)
        .bind(user.password)
        .bind(user.max_conn)
        .bind(user.allowance)
        .bind(end_date)
        .bind(user.period)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create user '{}'", user.username))?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to look up user '{}'", username))?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    pub async fn get_user_by_id(&self, id: i64) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to look up user id {}", id))?
            .ok_or_else(|| anyhow!("no user with id {}", id))?;
        row_to_user(&row)
    }

    /// Append a session-log row, returning its id
    pub async fn insert_session(&self, user_id: i64) -> Result<i64> {
        let result = sqlx::query("INSERT INTO sessions (user_id, bytes, conn_time) VALUES (?, 0, ?)")
            .bind(user_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to insert session row")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn add_session_bytes(&self, session_id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET bytes = bytes + ? WHERE id = ?")
            .bind(delta)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("failed to update session bytes")?;
        Ok(())
    }

    pub async fn add_user_allowance_used(&self, user_id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE users SET allowance_used = allowance_used + ? WHERE id = ?")
            .bind(delta)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to update allowance usage")?;
        Ok(())
    }

    /// Adjust the connection-occupancy counter by ±1
    pub async fn adjust_conn_used(&self, user_id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE users SET conn_used = conn_used + ? WHERE id = ?")
            .bind(delta)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to update connection count")?;
        Ok(())
    }

    /// Start a fresh allowance period
    ///
    /// Clears `allowance_used` and advances `end_date` by the user's
    /// renewal period.
    pub async fn reset_allowance(&self, user_id: i64) -> Result<()> {
        let user = self.get_user_by_id(user_id).await?;
        let renewed = user
            .end_date
            .checked_add_months(Months::new(user.period.max(0) as u32))
            .unwrap_or(user.end_date);
        sqlx::query("UPDATE users SET allowance_used = 0, end_date = ? WHERE id = ?")
            .bind(renewed)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to reset allowance")?;
        Ok(())
    }

    /// Administrative override of a user's renewal date
    pub async fn set_end_date(&self, user_id: i64, end_date: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET end_date = ? WHERE id = ?")
            .bind(end_date)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to set renewal date")?;
        Ok(())
    }

    /// Clear every occupancy counter
    ///
    /// Run once at startup: no frontend session survives a proxy
    /// restart, so any nonzero counter is stale.
    pub async fn reset_all_conn_used(&self) -> Result<()> {
        sqlx::query("UPDATE users SET conn_used = 0")
            .execute(&self.pool)
            .await
            .context("failed to reset connection counters")?;
        Ok(())
    }

    /// Session-log rows for one user, oldest first
    pub async fn sessions_for_user(&self, user_id: i64) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list sessions")?;
        rows.iter()
            .map(|row| {
                Ok(SessionRow {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    bytes: row.try_get("bytes")?,
                    conn_time: row.try_get("conn_time")?,
                })
            })
            .collect()
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        max_conn: row.try_get("max_conn")?,
        allowance: row.try_get("allowance")?,
        end_date: row.try_get("end_date")?,
        allowance_used: row.try_get("allowance_used")?,
        period: row.try_get("period")?,
        conn_used: row.try_get("conn_used")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn memory_store() -> QuotaStore {
        QuotaStore::new("sqlite::memory:").await.unwrap()
    }

    fn alice() -> NewUser<'static> {
        NewUser {
            username: "alice",
            password: "secret",
            max_conn: 2,
            allowance: 0,
            period: 1,
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_user() {
        let store = memory_store().await;
        let id = store.create_user(&alice()).await.unwrap();

        let user = store.get_user_by_name("alice").await.unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.password, "secret");
        assert_eq!(user.max_conn, 2);
        assert_eq!(user.conn_used, 0);
        assert_eq!(user.allowance_used, 0);

        let by_id = store.get_user_by_id(id).await.unwrap();
        assert_eq!(by_id, user);
    }

    #[tokio::test]
    async fn test_unknown_user_is_none() {
        let store = memory_store().await;
        assert!(store.get_user_by_name("nobody").await.unwrap().is_none());
        assert!(store.get_user_by_id(42).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let store = memory_store().await;
        store.create_user(&alice()).await.unwrap();
        assert!(store.create_user(&alice()).await.is_err());
    }

    #[tokio::test]
    async fn test_session_log_accumulates() {
        let store = memory_store().await;
        let user_id = store.create_user(&alice()).await.unwrap();

        let session_id = store.insert_session(user_id).await.unwrap();
        store.add_session_bytes(session_id, 100).await.unwrap();
        store.add_session_bytes(session_id, 50).await.unwrap();

        let sessions = store.sessions_for_user(user_id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session_id);
        assert_eq!(sessions[0].bytes, 150);
    }

    #[tokio::test]
    async fn test_flush_pair_matches() {
        let store = memory_store().await;
        let user_id = store.create_user(&alice()).await.unwrap();
        let session_id = store.insert_session(user_id).await.unwrap();

        store.add_session_bytes(session_id, 4096).await.unwrap();
        store.add_user_allowance_used(user_id, 4096).await.unwrap();

        let user = store.get_user_by_id(user_id).await.unwrap();
        let sessions = store.sessions_for_user(user_id).await.unwrap();
        assert_eq!(user.allowance_used, sessions[0].bytes);
    }

    #[tokio::test]
    async fn test_conn_used_round_trip() {
        let store = memory_store().await;
        let user_id = store.create_user(&alice()).await.unwrap();

        store.adjust_conn_used(user_id, 1).await.unwrap();
        assert_eq!(store.get_user_by_id(user_id).await.unwrap().conn_used, 1);

        store.adjust_conn_used(user_id, -1).await.unwrap();
        assert_eq!(store.get_user_by_id(user_id).await.unwrap().conn_used, 0);
    }

    #[tokio::test]
    async fn test_reset_allowance_advances_period() {
        let store = memory_store().await;
        let user_id = store.create_user(&alice()).await.unwrap();
        store.add_user_allowance_used(user_id, 1500).await.unwrap();

        let before = store.get_user_by_id(user_id).await.unwrap();
        store.reset_allowance(user_id).await.unwrap();
        let after = store.get_user_by_id(user_id).await.unwrap();

        assert_eq!(after.allowance_used, 0);
        assert_eq!(
            after.end_date,
            before.end_date.checked_add_months(Months::new(1)).unwrap()
        );
    }

    #[tokio::test]
    async fn test_reset_all_conn_used() {
        let store = memory_store().await;
        let a = store.create_user(&alice()).await.unwrap();
        let b = store
            .create_user(&NewUser {
                username: "bob",
                ..alice()
            })
            .await
            .unwrap();
        store.adjust_conn_used(a, 1).await.unwrap();
        store.adjust_conn_used(b, 1).await.unwrap();

        store.reset_all_conn_used().await.unwrap();

        assert_eq!(store.get_user_by_id(a).await.unwrap().conn_used, 0);
        assert_eq!(store.get_user_by_id(b).await.unwrap().conn_used, 0);
    }

    #[tokio::test]
    async fn test_set_end_date() {
        let store = memory_store().await;
        let user_id = store.create_user(&alice()).await.unwrap();

        let yesterday = Utc::now() - Duration::days(1);
        store.set_end_date(user_id, yesterday).await.unwrap();

        let user = store.get_user_by_id(user_id).await.unwrap();
        assert!(user.end_date < Utc::now());
    }
}
