//! SQL dialect differences between the supported drivers.
//!
//! Selected once from the connection URL. Business logic builds portable
//! sea-query statements and lets the dialect render them.

use sea_query::{
    LockType, PostgresQueryBuilder, SchemaStatementBuilder, SelectStatement, SqliteQueryBuilder,
};
use sea_query_binder::{SqlxBinder, SqlxValues};

use crate::error::{Result, StorageError};

/// Rendered statement text plus its bound arguments.
pub struct Sql {
    pub text: String,
    pub values: SqlxValues,
}

/// Supported database flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Pick the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            "mysql" => Err(StorageError::BadRequest(
                "mysql is not supported by this build".to_string(),
            )),
            other => Err(StorageError::BadRequest(format!(
                "unknown database scheme: {other:?}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Row-locking clause for a locked read, if the flavor has one.
    ///
    /// SQLite serializes writers with `BEGIN IMMEDIATE` instead.
    pub fn row_lock(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("FOR UPDATE"),
            Dialect::Sqlite => None,
        }
    }

    /// Apply the row lock to a select statement.
    pub fn lock_for_update(&self, stmt: &mut SelectStatement) {
        if self.row_lock().is_some() {
            stmt.lock(LockType::Update);
        }
    }

    /// Statement that opens a write transaction on a raw connection.
    pub fn begin_statement(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BEGIN",
            Dialect::Sqlite => "BEGIN IMMEDIATE",
        }
    }

    /// Render a DML statement with bound arguments.
    pub fn build<S: SqlxBinder>(&self, stmt: &S) -> Sql {
        let (text, values) = match self {
            Dialect::Postgres => stmt.build_sqlx(PostgresQueryBuilder),
            Dialect::Sqlite => stmt.build_sqlx(SqliteQueryBuilder),
        };
        Sql { text, values }
    }

    /// Render a DDL statement.
    pub fn build_schema<S: SchemaStatementBuilder>(&self, stmt: &S) -> String {
        match self {
            Dialect::Postgres => stmt.to_string(PostgresQueryBuilder),
            Dialect::Sqlite => stmt.to_string(SqliteQueryBuilder),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::{Alias, Expr, Query};

    #[test]
    fn test_from_url() {
        assert_eq!(
            Dialect::from_url("postgres://u@localhost/db").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("postgresql://localhost").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert!(Dialect::from_url("mysql://localhost").is_err());
        assert!(Dialect::from_url("redis://localhost").is_err());
    }

    #[test]
    fn test_lock_only_on_postgres() {
        let base = Query::select()
            .column(Alias::new("resource_version"))
            .from(Alias::new("kind_version"))
            .and_where(Expr::col(Alias::new("group")).eq("g"))
            .to_owned();

        let mut pg = base.clone();
        Dialect::Postgres.lock_for_update(&mut pg);
        let sql = Dialect::Postgres.build(&pg);
        assert!(sql.text.ends_with("FOR UPDATE"), "{}", sql.text);
        assert!(sql.text.contains("$1"));

        let mut lite = base;
        Dialect::Sqlite.lock_for_update(&mut lite);
        let sql = Dialect::Sqlite.build(&lite);
        assert!(!sql.text.contains("FOR UPDATE"));
        assert!(sql.text.contains('?'));
    }
}
