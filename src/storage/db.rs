//! Connection pool and transaction handles.
//!
//! The only place that dispatches over the concrete sqlx drivers. Callers
//! pass portable sea-query statements; rows decode into `sqlx::FromRow`
//! structs that are valid for both drivers.

use sea_query_binder::SqlxBinder;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{FromRow, Postgres, Sqlite};
use std::str::FromStr;
use tracing::{debug, warn};

use super::dialect::{Dialect, Sql};
use crate::config::DatabaseConfig;
use crate::error::{Result, StorageError};

/// Row types decodable from either driver.
pub trait AnyRow:
    for<'r> FromRow<'r, PgRow> + for<'r> FromRow<'r, SqliteRow> + Send + Unpin
{
}

impl<T> AnyRow for T where
    T: for<'r> FromRow<'r, PgRow> + for<'r> FromRow<'r, SqliteRow> + Send + Unpin
{
}

/// A connection pool for one of the supported drivers.
#[derive(Clone, Debug)]
pub enum DbPool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    /// Connect using the configured URL.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let dialect = Dialect::from_url(&config.url)?;
        debug!(driver = dialect.name(), "connecting to database");
        let pool = match dialect {
            Dialect::Postgres => DbPool::Postgres(
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.url)
                    .await?,
            ),
            Dialect::Sqlite => {
                let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
                let mut pool_options =
                    SqlitePoolOptions::new().max_connections(config.max_connections);
                // An in-memory database lives and dies with its connection.
                if config.url.contains(":memory:") {
                    pool_options = pool_options
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None);
                }
                DbPool::Sqlite(pool_options.connect_with(options).await?)
            }
        };
        Ok(pool)
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DbPool::Postgres(_) => Dialect::Postgres,
            DbPool::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// The Postgres pool, when running on Postgres.
    pub fn as_postgres(&self) -> Option<&PgPool> {
        match self {
            DbPool::Postgres(pool) => Some(pool),
            DbPool::Sqlite(_) => None,
        }
    }

    /// Open a write transaction.
    pub async fn begin(&self) -> Result<Tx> {
        match self {
            DbPool::Postgres(pool) => Ok(Tx::Postgres(pool.begin().await?)),
            DbPool::Sqlite(pool) => {
                let mut conn = pool.acquire().await?;
                sqlx::query(Dialect::Sqlite.begin_statement())
                    .execute(&mut *conn)
                    .await?;
                Ok(Tx::Sqlite(SqliteTx { conn: Some(conn) }))
            }
        }
    }

    /// Execute raw SQL without arguments (DDL, pings).
    pub async fn execute_raw(&self, sql: &str) -> Result<u64> {
        let affected = match self {
            DbPool::Postgres(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
            DbPool::Sqlite(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
        };
        Ok(affected)
    }

    pub async fn execute<S: SqlxBinder>(&self, stmt: &S) -> Result<u64> {
        let Sql { text, values } = self.dialect().build(stmt);
        let affected = match self {
            DbPool::Postgres(pool) => sqlx::query_with(&text, values)
                .execute(pool)
                .await?
                .rows_affected(),
            DbPool::Sqlite(pool) => sqlx::query_with(&text, values)
                .execute(pool)
                .await?
                .rows_affected(),
        };
        Ok(affected)
    }

    pub async fn fetch_all<T: AnyRow, S: SqlxBinder>(&self, stmt: &S) -> Result<Vec<T>> {
        let Sql { text, values } = self.dialect().build(stmt);
        let rows = match self {
            DbPool::Postgres(pool) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_all(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(rows)
    }

    pub async fn fetch_optional<T: AnyRow, S: SqlxBinder>(&self, stmt: &S) -> Result<Option<T>> {
        let Sql { text, values } = self.dialect().build(stmt);
        let row = match self {
            DbPool::Postgres(pool) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_optional(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_optional(pool)
                    .await?
            }
        };
        Ok(row)
    }

    pub async fn close(&self) {
        match self {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }
}

/// SQLite write transaction on a dedicated pooled connection.
///
/// Opened with `BEGIN IMMEDIATE` so concurrent writers queue on the database
/// lock instead of failing on upgrade. The connection is released once the
/// transaction ends.
pub struct SqliteTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteTx {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| StorageError::BackendUnavailable("transaction already ended".into()))
    }

    async fn end(mut self, statement: &'static str) -> Result<()> {
        sqlx::query(statement).execute(self.conn()?).await?;
        self.conn = None;
        Ok(())
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        // Roll back before the connection goes back to the pool. Closing it
        // instead would discard an in-memory database.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        warn!(error = %e, "rollback of abandoned transaction failed");
                        conn.close_on_drop();
                    }
                });
            }
            Err(_) => conn.close_on_drop(),
        }
    }
}

/// An open write transaction.
pub enum Tx {
    Postgres(sqlx::Transaction<'static, Postgres>),
    Sqlite(SqliteTx),
}

impl Tx {
    pub fn dialect(&self) -> Dialect {
        match self {
            Tx::Postgres(_) => Dialect::Postgres,
            Tx::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn execute<S: SqlxBinder>(&mut self, stmt: &S) -> Result<u64> {
        let Sql { text, values } = self.dialect().build(stmt);
        let affected = match self {
            Tx::Postgres(tx) => sqlx::query_with(&text, values)
                .execute(&mut **tx)
                .await?
                .rows_affected(),
            Tx::Sqlite(tx) => sqlx::query_with(&text, values)
                .execute(tx.conn()?)
                .await?
                .rows_affected(),
        };
        Ok(affected)
    }

    pub async fn fetch_all<T: AnyRow, S: SqlxBinder>(&mut self, stmt: &S) -> Result<Vec<T>> {
        let Sql { text, values } = self.dialect().build(stmt);
        let rows = match self {
            Tx::Postgres(tx) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_all(&mut **tx)
                    .await?
            }
            Tx::Sqlite(tx) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_all(tx.conn()?)
                    .await?
            }
        };
        Ok(rows)
    }

    pub async fn fetch_optional<T: AnyRow, S: SqlxBinder>(
        &mut self,
        stmt: &S,
    ) -> Result<Option<T>> {
        let Sql { text, values } = self.dialect().build(stmt);
        let row = match self {
            Tx::Postgres(tx) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_optional(&mut **tx)
                    .await?
            }
            Tx::Sqlite(tx) => {
                sqlx::query_as_with::<_, T, _>(&text, values)
                    .fetch_optional(tx.conn()?)
                    .await?
            }
        };
        Ok(row)
    }

    pub async fn commit(self) -> Result<()> {
        match self {
            Tx::Postgres(tx) => tx.commit().await?,
            Tx::Sqlite(tx) => tx.end("COMMIT").await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        match self {
            Tx::Postgres(tx) => tx.rollback().await?,
            Tx::Sqlite(tx) => tx.end("ROLLBACK").await?,
        }
        Ok(())
    }

    /// Commit on success, roll back on failure, and hand back the result.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }
}
