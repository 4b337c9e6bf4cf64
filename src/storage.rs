//! Storage layer for the allow-list and prepaid balances
//!
//! Provides a PostgreSQL implementation of [`AccountStore`]. Every mutation is a
//! single SQL statement, so concurrent requests for the same user never
//! observe a half-applied debit.

use crate::config::DatabaseSettings;
use async_trait::async_trait;
use deadpool_postgres::{Pool, Runtime};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::{error, info};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Could not obtain a connection from the pool
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    /// Could not build the connection pool
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::CreatePoolError),
    /// Query failed on the server
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result of a conditional balance debit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// Balance decremented and usage counter incremented together
    Applied,
    /// No balance account exists for the user
    NotFound,
    /// The account exists but holds less than the requested amount
    Insufficient,
}

/// Result of an allow-list mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowListChange {
    /// The entry was inserted or removed
    Changed,
    /// Nothing to do, the allow-list already had the requested shape
    Unchanged,
}

/// Result of setting a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceChange {
    /// The balance account was created or overwritten
    Updated,
    /// The user is not in the allow-list, nothing was written
    NotAllowed,
}

/// One row of the administrative account listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    /// Telegram user ID
    pub user_id: i64,
    /// Current balance, absent if no balance row exists yet
    pub balance: Option<Decimal>,
    /// Number of images charged so far
    pub images_generated: Option<i64>,
}

/// Interface for the account store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Check whether the user is present in the allow-list
    async fn is_allowed(&self, user_id: i64) -> Result<bool, StorageError>;
    /// Get the user's balance, `None` if no balance account exists
    async fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>, StorageError>;
    /// Atomically subtract `amount` and count one generated image
    async fn atomic_debit(&self, user_id: i64, amount: Decimal)
        -> Result<DebitOutcome, StorageError>;
    /// Add the user to the allow-list
    async fn allow_user(&self, user_id: i64) -> Result<AllowListChange, StorageError>;
    /// Remove the user from the allow-list
    async fn disable_user(&self, user_id: i64) -> Result<AllowListChange, StorageError>;
    /// Set the balance of an allowed user, creating the account if needed
    async fn set_balance(&self, user_id: i64, balance: Decimal)
        -> Result<BalanceChange, StorageError>;
    /// List allowed users with their balances
    async fn list_accounts(&self) -> Result<Vec<AccountSummary>, StorageError>;
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), StorageError>;
}

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS allowed_users (
        user_id BIGINT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS user_balances (
        user_id BIGINT PRIMARY KEY,
        balance NUMERIC(12, 2) NOT NULL DEFAULT 0,
        images_generated BIGINT NOT NULL DEFAULT 0
    );
";

/// PostgreSQL-backed account store
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store with a connection pool built from settings
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub fn new(settings: &DatabaseSettings) -> Result<Self, StorageError> {
        let pool = settings
            .pool_config()
            .create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(Self { pool })
    }

    /// Create the tables if they do not exist yet
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL cannot be executed.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        info!("Account schema is ready.");
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn is_allowed(&self, user_id: i64) -> Result<bool, StorageError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT user_id FROM allowed_users WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>, StorageError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT balance FROM user_balances WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, Decimal>(0)))
    }

    async fn atomic_debit(
        &self,
        user_id: i64,
        amount: Decimal,
    ) -> Result<DebitOutcome, StorageError> {
        let conn = self.pool.get().await?;
        // The balance guard lives in the WHERE clause so two concurrent debits
        // cannot both pass it.
        let updated = conn
            .execute(
                "UPDATE user_balances \
                 SET balance = balance - $1, images_generated = images_generated + 1 \
                 WHERE user_id = $2 AND balance >= $1",
                &[&amount, &user_id],
            )
            .await?;
        if updated > 0 {
            return Ok(DebitOutcome::Applied);
        }

        let exists = conn
            .query_opt(
                "SELECT 1 FROM user_balances WHERE user_id = $1",
                &[&user_id],
            )
            .await?
            .is_some();
        Ok(if exists {
            DebitOutcome::Insufficient
        } else {
            DebitOutcome::NotFound
        })
    }

    async fn allow_user(&self, user_id: i64) -> Result<AllowListChange, StorageError> {
        let conn = self.pool.get().await?;
        let inserted = conn
            .execute(
                "INSERT INTO allowed_users (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
                &[&user_id],
            )
            .await?;
        Ok(if inserted > 0 {
            AllowListChange::Changed
        } else {
            AllowListChange::Unchanged
        })
    }

    async fn disable_user(&self, user_id: i64) -> Result<AllowListChange, StorageError> {
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute("DELETE FROM allowed_users WHERE user_id = $1", &[&user_id])
            .await?;
        Ok(if deleted > 0 {
            AllowListChange::Changed
        } else {
            AllowListChange::Unchanged
        })
    }

    async fn set_balance(
        &self,
        user_id: i64,
        balance: Decimal,
    ) -> Result<BalanceChange, StorageError> {
        if !self.is_allowed(user_id).await? {
            return Ok(BalanceChange::NotAllowed);
        }
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO user_balances (user_id, balance, images_generated) \
             VALUES ($1, $2, 0) \
             ON CONFLICT (user_id) DO UPDATE SET balance = EXCLUDED.balance",
            &[&user_id, &balance],
        )
        .await?;
        Ok(BalanceChange::Updated)
    }

    async fn list_accounts(&self) -> Result<Vec<AccountSummary>, StorageError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT au.user_id, ub.balance, ub.images_generated \
                 FROM allowed_users au \
                 LEFT JOIN user_balances ub ON au.user_id = ub.user_id \
                 ORDER BY au.user_id",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| AccountSummary {
                user_id: row.get(0),
                balance: row.get(1),
                images_generated: row.get(2),
            })
            .collect())
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        let conn = self.pool.get().await?;
        match conn.execute("SELECT 1", &[]).await {
            Ok(_) => {
                info!("Database connection OK.");
                Ok(())
            }
            Err(e) => {
                error!("Database connection check failed: {}", e);
                Err(e.into())
            }
        }
    }
}
