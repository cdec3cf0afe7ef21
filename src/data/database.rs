//! SQLite database operations
//!
//! All membership registry access goes through this module.
//! Each mutation runs in its own transaction so the subscriber and
//! follower collections never both hold the same domain.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

fn subscriber_from_row(row: &SqliteRow) -> Result<Subscriber, AppError> {
    let state: String = row.try_get("state")?;
    let state = MembershipState::parse(&state).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown subscriber state in store: {state}"))
    })?;

    Ok(Subscriber {
        domain: row.try_get("domain")?,
        activity_id: row.try_get("activity_id")?,
        actor_id: row.try_get("actor_id")?,
        inbox_url: row.try_get("inbox_url")?,
        state,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn follower_from_row(row: &SqliteRow) -> Result<Follower, AppError> {
    Ok(Follower {
        domain: row.try_get("domain")?,
        activity_id: row.try_get("activity_id")?,
        actor_id: row.try_get("actor_id")?,
        inbox_url: row.try_get("inbox_url")?,
        mutual: row.try_get::<bool, _>("mutual")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn get_subscriber(&self, domain: &str) -> Result<Option<Subscriber>, AppError> {
        let row = sqlx::query("SELECT * FROM subscribers WHERE domain = ?")
            .bind(normalize_domain(domain))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    pub async fn get_follower(&self, domain: &str) -> Result<Option<Follower>, AppError> {
        let row = sqlx::query("SELECT * FROM followers WHERE domain = ?")
            .bind(normalize_domain(domain))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(follower_from_row).transpose()
    }

    /// Find the record for a domain in whichever collection holds it.
    pub async fn find_member(&self, domain: &str) -> Result<Option<Member>, AppError> {
        if let Some(subscriber) = self.get_subscriber(domain).await? {
            return Ok(Some(Member::Subscriber(subscriber)));
        }
        Ok(self.get_follower(domain).await?.map(Member::Follower))
    }

    /// List subscribers, optionally restricted to one state.
    pub async fn list_subscribers(
        &self,
        state: Option<MembershipState>,
    ) -> Result<Vec<Subscriber>, AppError> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM subscribers WHERE state = ? ORDER BY domain")
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM subscribers ORDER BY domain")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(subscriber_from_row).collect()
    }

    pub async fn list_followers(&self) -> Result<Vec<Follower>, AppError> {
        let rows = sqlx::query("SELECT * FROM followers ORDER BY domain")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(follower_from_row).collect()
    }

    /// Snapshot of every follower inbox URL, for addressing classification.
    pub async fn follower_inboxes(&self) -> Result<HashSet<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>("SELECT inbox_url FROM followers")
            .fetch_all(&self.pool)
            .await?;
        Ok(inboxes.into_iter().collect())
    }

    /// Read-consistent fan-out destination snapshot.
    ///
    /// Active subscribers are always included; followers only when
    /// `include_followers` is set. Both collections are read inside one
    /// transaction.
    pub async fn delivery_targets(
        &self,
        include_followers: bool,
    ) -> Result<Vec<DeliveryTarget>, AppError> {
        let mut tx = self.pool.begin().await?;

        let mut targets: Vec<DeliveryTarget> = sqlx::query_as::<_, (String, String)>(
            "SELECT domain, inbox_url FROM subscribers WHERE state = 'active' ORDER BY domain",
        )
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|(domain, inbox_url)| DeliveryTarget { domain, inbox_url })
        .collect();

        if include_followers {
            let followers = sqlx::query_as::<_, (String, String)>(
                "SELECT domain, inbox_url FROM followers ORDER BY domain",
            )
            .fetch_all(&mut *tx)
            .await?;
            targets.extend(
                followers
                    .into_iter()
                    .map(|(domain, inbox_url)| DeliveryTarget { domain, inbox_url }),
            );
        }

        tx.commit().await?;
        Ok(targets)
    }

    pub async fn membership_counts(&self) -> Result<MembershipCounts, AppError> {
        let (active_subscribers, pending_subscribers): (i64, i64) = sqlx::query_as(
            "SELECT \
                COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0) \
             FROM subscribers",
        )
        .fetch_one(&self.pool)
        .await?;
        let followers = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM followers")
            .fetch_one(&self.pool)
            .await?;

        Ok(MembershipCounts {
            active_subscribers,
            pending_subscribers,
            followers,
        })
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Create or replace a subscriber, evicting any follower record for the
    /// same domain.
    pub async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<(), AppError> {
        let domain = normalize_domain(&subscriber.domain);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM followers WHERE domain = ?")
            .bind(&domain)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO subscribers (domain, activity_id, actor_id, inbox_url, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                activity_id = excluded.activity_id,
                actor_id = excluded.actor_id,
                inbox_url = excluded.inbox_url,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&domain)
        .bind(&subscriber.activity_id)
        .bind(&subscriber.actor_id)
        .bind(&subscriber.inbox_url)
        .bind(subscriber.state.as_str())
        .bind(subscriber.created_at)
        .bind(subscriber.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Create or replace a follower, evicting any subscriber record for the
    /// same domain.
    pub async fn upsert_follower(&self, follower: &Follower) -> Result<(), AppError> {
        let domain = normalize_domain(&follower.domain);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM subscribers WHERE domain = ?")
            .bind(&domain)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO followers (domain, activity_id, actor_id, inbox_url, mutual, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                activity_id = excluded.activity_id,
                actor_id = excluded.actor_id,
                inbox_url = excluded.inbox_url,
                mutual = excluded.mutual,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&domain)
        .bind(&follower.activity_id)
        .bind(&follower.actor_id)
        .bind(&follower.inbox_url)
        .bind(follower.mutual)
        .bind(follower.created_at)
        .bind(follower.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move a pending subscriber to active. Returns false if there was no
    /// pending subscriber for the domain.
    pub async fn activate_subscriber(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE subscribers SET state = 'active', updated_at = ? WHERE domain = ? AND state = 'pending'",
        )
        .bind(Utc::now())
        .bind(normalize_domain(domain))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that a follower accepted the relay's follow-back.
    pub async fn mark_follower_mutual(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE followers SET mutual = 1, updated_at = ? WHERE domain = ? AND mutual = 0",
        )
        .bind(Utc::now())
        .bind(normalize_domain(domain))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_subscriber(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM subscribers WHERE domain = ?")
            .bind(normalize_domain(domain))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_follower(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM followers WHERE domain = ?")
            .bind(normalize_domain(domain))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the domain's record from whichever collection holds it and
    /// return what was removed.
    pub async fn delete_member(&self, domain: &str) -> Result<Option<Member>, AppError> {
        let domain = normalize_domain(domain);
        let mut tx = self.pool.begin().await?;

        let subscriber = sqlx::query("DELETE FROM subscribers WHERE domain = ? RETURNING *")
            .bind(&domain)
            .fetch_optional(&mut *tx)
            .await?;
        let removed = match subscriber {
            Some(row) => Some(Member::Subscriber(subscriber_from_row(&row)?)),
            None => {
                let follower = sqlx::query("DELETE FROM followers WHERE domain = ? RETURNING *")
                    .bind(&domain)
                    .fetch_optional(&mut *tx)
                    .await?;
                follower
                    .as_ref()
                    .map(follower_from_row)
                    .transpose()?
                    .map(Member::Follower)
            }
        };

        tx.commit().await?;
        Ok(removed)
    }

    // =========================================================================
    // Domain Blocks
    // =========================================================================

    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM domain_blocks WHERE domain = ?")
            .bind(normalize_domain(domain))
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn insert_domain_block(&self, domain: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO domain_blocks (domain, created_at) VALUES (?, ?) ON CONFLICT(domain) DO NOTHING",
        )
        .bind(normalize_domain(domain))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_domain_block(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM domain_blocks WHERE domain = ?")
            .bind(normalize_domain(domain))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_domain_blocks(&self) -> Result<Vec<String>, AppError> {
        let domains =
            sqlx::query_scalar::<_, String>("SELECT domain FROM domain_blocks ORDER BY domain")
                .fetch_all(&self.pool)
                .await?;
        Ok(domains)
    }

    // =========================================================================
    // Relay Key
    // =========================================================================

    pub async fn get_relay_key(&self) -> Result<Option<RelayKey>, AppError> {
        let row = sqlx::query(
            "SELECT private_key_pem, public_key_pem, created_at FROM relay_keys WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<RelayKey, AppError> {
            Ok(RelayKey {
                private_key_pem: row.try_get("private_key_pem")?,
                public_key_pem: row.try_get("public_key_pem")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            })
        })
        .transpose()
    }

    /// Store the relay key unless one already exists. Returns whether the
    /// key was inserted.
    pub async fn insert_relay_key_if_absent(&self, key: &RelayKey) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO relay_keys (id, private_key_pem, public_key_pem, created_at) VALUES (1, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&key.private_key_pem)
        .bind(&key.public_key_pem)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
