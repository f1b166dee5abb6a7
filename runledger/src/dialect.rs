//! Backend-specific behavior behind one call site.
//!
//! SQLite serializes writers on a file lock and reports contention as
//! `SQLITE_BUSY`/`SQLITE_LOCKED`; PostgreSQL locks rows under MVCC and
//! reports serialization failures and deadlocks through SQLSTATE codes. The
//! ledger issues the same statements against both and asks the [`Dialect`]
//! how to tune sessions, render placeholders and classify failures.

use serde::{Deserialize, Serialize};
use sqlx::error::ErrorKind;

use crate::config::PersistenceConfig;
use crate::error::LedgerError;

/// SQLite primary and extended result codes that indicate lock contention.
const SQLITE_RETRYABLE_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// SQLite constraint codes for primary-key and unique violations.
const SQLITE_UNIQUE_CODES: &[&str] = &["1555", "2067"];

/// PostgreSQL SQLSTATEs: serialization_failure, deadlock_detected,
/// lock_not_available, query_canceled (statement/lock timeout).
const POSTGRES_RETRYABLE_CODES: &[&str] = &["40001", "40P01", "55P03", "57014"];

const POSTGRES_UNIQUE_CODE: &str = "23505";

/// Supported storage engines.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Infer the backend from a connection string.
    pub fn from_url(url: &str) -> Result<Self, LedgerError> {
        if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else {
            Err(LedgerError::Validation(format!(
                "unsupported connection string scheme: {url}"
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    /// Directives issued on every new connection.
    pub fn session_directives(&self, config: &PersistenceConfig) -> Vec<String> {
        match self {
            Dialect::Sqlite => vec![
                "PRAGMA journal_mode = WAL".to_string(),
                "PRAGMA synchronous = NORMAL".to_string(),
                format!("PRAGMA busy_timeout = {}", config.busy_timeout_ms),
                "PRAGMA foreign_keys = ON".to_string(),
            ],
            Dialect::Postgres => vec![
                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ COMMITTED"
                    .to_string(),
                format!("SET lock_timeout = {}", config.busy_timeout_ms),
                format!("SET statement_timeout = {}", config.statement_timeout_ms),
            ],
        }
    }

    /// Upper bound on pooled connections.
    ///
    /// SQLite admits one writer per file, so a larger pool only moves the
    /// queueing from the pool into `busy_timeout`.
    pub fn max_pool_size(&self, config: &PersistenceConfig) -> u32 {
        match self {
            Dialect::Sqlite => 1,
            Dialect::Postgres => config.pool_size + config.max_overflow,
        }
    }

    /// Connections kept warm.
    pub fn min_pool_size(&self, config: &PersistenceConfig) -> u32 {
        match self {
            Dialect::Sqlite => 1,
            Dialect::Postgres => config.pool_size.min(self.max_pool_size(config)),
        }
    }

    /// Render `?` placeholders in the backend's syntax.
    pub fn sql(&self, query: &str) -> String {
        match self {
            Dialect::Sqlite => query.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(query.len() + 16);
                let mut n = 0;
                for c in query.chars() {
                    if c == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }

    /// Query returning one row when `table` exists.
    pub fn table_exists_query(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            Dialect::Postgres => {
                "SELECT table_name::text AS name FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
        }
    }

    /// Query listing the column names of `table` in a `name` column.
    pub fn columns_query(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT name FROM pragma_table_info(?)",
            Dialect::Postgres => {
                "SELECT column_name::text AS name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
        }
    }

    /// Whether the failure is transient lock contention worth retrying.
    pub fn is_retryable(&self, err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db_err) => {
                let code = db_err.code();
                let code = code.as_deref();
                match self {
                    Dialect::Sqlite => {
                        code.is_some_and(|c| SQLITE_RETRYABLE_CODES.contains(&c)) || {
                            let message = db_err.message().to_ascii_lowercase();
                            message.contains("database is locked")
                                || message.contains("database table is locked")
                                || message.contains("database is busy")
                        }
                    }
                    Dialect::Postgres => {
                        code.is_some_and(|c| POSTGRES_RETRYABLE_CODES.contains(&c))
                    }
                }
            }
            _ => false,
        }
    }

    /// Whether the failure is a primary-key or unique-index violation.
    pub fn is_unique_violation(&self, err: &sqlx::Error) -> bool {
        let sqlx::Error::Database(db_err) = err else {
            return false;
        };
        if matches!(db_err.kind(), ErrorKind::UniqueViolation) {
            return true;
        }
        let code = db_err.code();
        match self {
            Dialect::Sqlite => code
                .as_deref()
                .is_some_and(|c| SQLITE_UNIQUE_CODES.contains(&c)),
            Dialect::Postgres => code.as_deref() == Some(POSTGRES_UNIQUE_CODE),
        }
    }

    /// Map a driver error into the ledger taxonomy.
    ///
    /// Unique violations are reported by the caller, which knows the id.
    pub fn classify(&self, err: sqlx::Error) -> LedgerError {
        if self.is_retryable(&err) {
            LedgerError::Contention(err.to_string())
        } else {
            match err {
                sqlx::Error::ColumnNotFound(column) => {
                    LedgerError::Schema(format!("missing column {column}"))
                }
                sqlx::Error::ColumnDecode { index, source } => {
                    LedgerError::Schema(format!("cannot decode column {index}: {source}"))
                }
                other => LedgerError::Database(other),
            }
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::error::DatabaseError;
    use std::borrow::Cow;
    use std::error::Error as StdError;

    /// Minimal driver error carrying a code and message.
    #[derive(Debug)]
    pub(crate) struct FakeDbError {
        pub code: &'static str,
        pub message: &'static str,
    }

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{} ({})", self.message, self.code)
        }
    }

    impl StdError for FakeDbError {}

    impl DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            self.message
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    pub(crate) fn db_error(code: &'static str, message: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(FakeDbError { code, message }))
    }

    #[test]
    fn test_from_url() {
        assert_eq!(Dialect::from_url("sqlite://ledger.db").unwrap(), Dialect::Sqlite);
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert_eq!(
            Dialect::from_url("postgres://localhost/runs").unwrap(),
            Dialect::Postgres
        );
        assert!(Dialect::from_url("mysql://localhost/runs").is_err());
    }

    #[test]
    fn test_placeholder_rendering() {
        let query = "UPDATE t SET a = ?, b = ? WHERE id = ?";
        assert_eq!(Dialect::Sqlite.sql(query), query);
        assert_eq!(
            Dialect::Postgres.sql(query),
            "UPDATE t SET a = $1, b = $2 WHERE id = $3"
        );
    }

    #[test]
    fn test_sqlite_busy_is_retryable() {
        let dialect = Dialect::Sqlite;
        assert!(dialect.is_retryable(&db_error("5", "database is locked")));
        assert!(dialect.is_retryable(&db_error("517", "busy snapshot")));
        assert!(dialect.is_retryable(&db_error("1", "database is locked")));
        assert!(!dialect.is_retryable(&db_error("1", "no such table: ledger_jobs")));
        assert!(dialect.is_retryable(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_postgres_serialization_is_retryable() {
        let dialect = Dialect::Postgres;
        assert!(dialect.is_retryable(&db_error("40001", "could not serialize access")));
        assert!(dialect.is_retryable(&db_error("40P01", "deadlock detected")));
        assert!(dialect.is_retryable(&db_error("55P03", "lock not available")));
        assert!(!dialect.is_retryable(&db_error("42P01", "relation does not exist")));
        // SQLite's message heuristics do not apply to PostgreSQL.
        assert!(!dialect.is_retryable(&db_error("XX000", "database is locked")));
    }

    #[test]
    fn test_unique_violation() {
        assert!(Dialect::Sqlite.is_unique_violation(&db_error("1555", "UNIQUE constraint failed")));
        assert!(Dialect::Postgres.is_unique_violation(&db_error("23505", "duplicate key")));
        assert!(!Dialect::Postgres.is_unique_violation(&db_error("40001", "serialize")));
        assert!(!Dialect::Sqlite.is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_classify() {
        let dialect = Dialect::Postgres;
        assert!(dialect
            .classify(db_error("40001", "could not serialize access"))
            .is_retryable());
        assert!(matches!(
            dialect.classify(db_error("42P01", "relation does not exist")),
            LedgerError::Database(_)
        ));
        assert!(matches!(
            dialect.classify(sqlx::Error::ColumnNotFound("status".into())),
            LedgerError::Schema(_)
        ));
    }

    #[test]
    fn test_pool_sizes() {
        let config = PersistenceConfig {
            pool_size: 5,
            max_overflow: 10,
            ..Default::default()
        };
        assert_eq!(Dialect::Sqlite.max_pool_size(&config), 1);
        assert_eq!(Dialect::Postgres.max_pool_size(&config), 15);
        assert_eq!(Dialect::Postgres.min_pool_size(&config), 5);
    }
}
