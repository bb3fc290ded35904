//! Statement execution engine.
//!
//! Runs parameterized single and batch statements against a borrowed
//! pooled connection and produces typed records through row-mapper
//! closures. Positional parameter counts are verified against the
//! statement's placeholders before anything is sent to the database.
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in
//! submodules (`mysql`, `postgres`, `sqlite`), each providing identical
//! functionality adapted to the backend's type system. The code structure
//! is intentionally parallel to make differences obvious.

use crate::config::DatabaseType;
use crate::db::factory::DbConnection;
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::pool::PooledConnection;
use crate::db::row::RowView;
use crate::error::{DbError, DbResult};
use crate::models::SqlParam;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt, stream};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Default per-statement timeout in seconds.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;

/// Executes parameterized statements against borrowed connections.
pub struct StatementExecutor {
    default_timeout: Duration,
}

impl StatementExecutor {
    /// Create an executor with default settings.
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_STATEMENT_TIMEOUT_SECS),
        }
    }

    /// Create an executor with a custom statement timeout.
    pub fn with_timeout(statement_timeout: Duration) -> Self {
        Self {
            default_timeout: statement_timeout,
        }
    }

    /// Execute a single statement and return the affected row count.
    ///
    /// Parameters bind positionally, in order. A placeholder/parameter
    /// count mismatch fails with [`DbError::ParamBinding`] before any
    /// statement is sent. A failure that indicates a broken connection
    /// marks the guard so the pool closes it instead of recycling.
    pub async fn execute(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        self.check_bindings(conn.db_type(), sql, params.len())?;
        debug!(sql = %sql, params = params.len(), "executing statement");

        let result = self.execute_raw(conn.connection_mut(), sql, params).await;
        if let Err(ref err) = result {
            if err.indicates_broken_connection() {
                conn.mark_broken();
            }
        }
        result
    }

    /// Execute one statement once per parameter set, returning the
    /// affected-row count of each set in order.
    ///
    /// Sets run sequentially in autocommit mode - that is the batching
    /// facility this driver stack provides for raw connections. On a
    /// failure at set `i` the error is [`DbError::Batch`] carrying `i` and
    /// the counts of the sets already committed; wrap the call in a caller
    /// transaction if all-or-nothing is required.
    pub async fn execute_batch(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        param_sets: &[Vec<SqlParam>],
    ) -> DbResult<Vec<u64>> {
        let db_type = conn.db_type();
        for set in param_sets {
            self.check_bindings(db_type, sql, set.len())?;
        }
        debug!(sql = %sql, sets = param_sets.len(), "executing batch");

        let mut completed = Vec::with_capacity(param_sets.len());
        for (index, set) in param_sets.iter().enumerate() {
            match self.execute_raw(conn.connection_mut(), sql, set).await {
                Ok(count) => completed.push(count),
                Err(cause) => {
                    if cause.indicates_broken_connection() {
                        conn.mark_broken();
                    }
                    return Err(DbError::batch(index, completed, cause));
                }
            }
        }
        Ok(completed)
    }

    /// Run a query and map rows lazily, one at a time.
    ///
    /// The mapper is a pure function over a borrowed [`RowView`]; the view
    /// cannot be retained past the invocation. No timeout applies - the
    /// caller drives the stream. Use [`StatementExecutor::query_all`] for
    /// a materialized result under the executor's timeout.
    pub fn query<'e, T, F>(
        &self,
        conn: &'e mut PooledConnection,
        sql: &'e str,
        params: &'e [SqlParam],
        mapper: F,
    ) -> BoxStream<'e, DbResult<T>>
    where
        T: Send + 'e,
        F: Fn(&RowView<'_>) -> DbResult<T> + Send + 'e,
    {
        if let Err(err) = self.check_bindings(conn.db_type(), sql, params.len()) {
            return stream::once(async move { Err(err) }).boxed();
        }
        debug!(sql = %sql, params = params.len(), "streaming query");

        match conn.connection_mut() {
            DbConnection::MySql(c) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                query
                    .fetch(c)
                    .map(move |res| {
                        res.map_err(DbError::from)
                            .and_then(|row| mapper(&RowView::MySql(&row)))
                    })
                    .boxed()
            }
            DbConnection::Postgres(c) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                query
                    .fetch(c)
                    .map(move |res| {
                        res.map_err(DbError::from)
                            .and_then(|row| mapper(&RowView::Postgres(&row)))
                    })
                    .boxed()
            }
            DbConnection::SQLite(c) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                query
                    .fetch(c)
                    .map(move |res| {
                        res.map_err(DbError::from)
                            .and_then(|row| mapper(&RowView::SQLite(&row)))
                    })
                    .boxed()
            }
        }
    }

    /// Run a query and materialize every mapped row, under the executor's
    /// timeout.
    pub async fn query_all<T, F>(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        params: &[SqlParam],
        mapper: F,
    ) -> DbResult<Vec<T>>
    where
        T: Send,
        F: Fn(&RowView<'_>) -> DbResult<T> + Send,
    {
        let result = match timeout(
            self.default_timeout,
            self.query(conn, sql, params, mapper).try_collect::<Vec<T>>(),
        )
        .await
        {
            Ok(rows) => rows,
            Err(_) => Err(DbError::timeout("query execution", self.default_timeout)),
        };
        if let Err(ref err) = result {
            if err.indicates_broken_connection() {
                conn.mark_broken();
            }
        }
        result
    }

    /// Run one statement against the raw connection under the timeout.
    async fn execute_raw(
        &self,
        conn: &mut DbConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        let fut = async {
            match conn {
                DbConnection::MySql(c) => mysql::execute(c, sql, params).await,
                DbConnection::Postgres(c) => postgres::execute(c, sql, params).await,
                DbConnection::SQLite(c) => sqlite::execute(c, sql, params).await,
            }
        };
        match timeout(self.default_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(
                "statement execution",
                self.default_timeout,
            )),
        }
    }

    /// Verify the supplied parameter count against the statement's
    /// placeholders, before anything goes over the wire.
    fn check_bindings(&self, db_type: DatabaseType, sql: &str, supplied: usize) -> DbResult<()> {
        let expected = count_placeholders(sql, db_type);
        if expected != supplied {
            return Err(DbError::param_binding(expected, supplied));
        }
        Ok(())
    }
}

impl Default for StatementExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Count the positional placeholders in a statement: `?` for MySQL and
/// SQLite, the highest `$n` index for PostgreSQL.
///
/// String literals (single, double and backtick quoted, with doubled-quote
/// escapes), `--` and `#` line comments, and `/* */` block comments are
/// skipped. PostgreSQL dollar-quoted string bodies are not recognized and
/// are scanned as plain text.
pub(crate) fn count_placeholders(sql: &str, db_type: DatabaseType) -> usize {
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut question_marks = 0usize;
    let mut max_dollar = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // A doubled quote is an escape inside the literal.
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'#' if db_type == DatabaseType::MySQL => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b'?' => question_marks += 1,
            b'$' => {
                let mut j = i + 1;
                let mut n = 0usize;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    n = n * 10 + (bytes[j] - b'0') as usize;
                    j += 1;
                }
                if j > i + 1 {
                    max_dollar = max_dollar.max(n);
                    i = j - 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    match db_type {
        DatabaseType::PostgreSQL => max_dollar,
        DatabaseType::MySQL | DatabaseType::SQLite => question_marks,
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database
// type.

mod mysql {
    use super::*;
    use sqlx::MySqlConnection;

    pub(super) async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        // When params is empty, run the raw SQL directly - some statements
        // (CREATE PROCEDURE and friends) don't support prepared execution.
        if params.is_empty() {
            use sqlx::Executor;
            return conn
                .execute(sql)
                .await
                .map(|r| r.rows_affected())
                .map_err(DbError::from);
        }
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql_param(query, param);
        }
        Ok(query
            .execute(conn)
            .await
            .map_err(DbError::from)?
            .rows_affected())
    }
}

mod postgres {
    use super::*;
    use sqlx::PgConnection;

    pub(super) async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        if params.is_empty() {
            use sqlx::Executor;
            return conn
                .execute(sql)
                .await
                .map(|r| r.rows_affected())
                .map_err(DbError::from);
        }
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        Ok(query
            .execute(conn)
            .await
            .map_err(DbError::from)?
            .rows_affected())
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqliteConnection;

    pub(super) async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        if params.is_empty() {
            use sqlx::Executor;
            return conn
                .execute(sql)
                .await
                .map(|r| r.rows_affected())
                .map_err(DbError::from);
        }
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }
        Ok(query
            .execute(conn)
            .await
            .map_err(DbError::from)?
            .rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_defaults() {
        let executor = StatementExecutor::new();
        assert_eq!(
            executor.default_timeout,
            Duration::from_secs(DEFAULT_STATEMENT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_executor_custom_timeout() {
        let executor = StatementExecutor::with_timeout(Duration::from_secs(5));
        assert_eq!(executor.default_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_count_question_marks() {
        assert_eq!(
            count_placeholders(
                "INSERT INTO example (id, name) VALUES (?, ?)",
                DatabaseType::SQLite
            ),
            2
        );
        assert_eq!(
            count_placeholders("SELECT * FROM example", DatabaseType::SQLite),
            0
        );
    }

    #[test]
    fn test_placeholders_inside_literals_ignored() {
        assert_eq!(
            count_placeholders(
                "INSERT INTO t (a, b) VALUES ('?', ?)",
                DatabaseType::SQLite
            ),
            1
        );
        assert_eq!(
            count_placeholders("SELECT \"a?b\" FROM t WHERE x = ?", DatabaseType::MySQL),
            1
        );
        // Doubled quote escape keeps the literal open.
        assert_eq!(
            count_placeholders("SELECT 'it''s a ?' , ?", DatabaseType::SQLite),
            1
        );
    }

    #[test]
    fn test_placeholders_inside_comments_ignored() {
        assert_eq!(
            count_placeholders(
                "SELECT ? -- trailing ? comment\nFROM t",
                DatabaseType::SQLite
            ),
            1
        );
        assert_eq!(
            count_placeholders("SELECT /* ? ? */ ? FROM t", DatabaseType::SQLite),
            1
        );
        assert_eq!(
            count_placeholders("SELECT ? # mysql ? comment", DatabaseType::MySQL),
            1
        );
        // '#' is not a comment leader outside MySQL.
        assert_eq!(
            count_placeholders("SELECT ? # not a comment ?", DatabaseType::SQLite),
            2
        );
    }

    #[test]
    fn test_dollar_placeholders() {
        assert_eq!(
            count_placeholders(
                "INSERT INTO t (a, b) VALUES ($1, $2)",
                DatabaseType::PostgreSQL
            ),
            2
        );
        // Repeated index counts once - the arity is the highest index.
        assert_eq!(
            count_placeholders(
                "SELECT * FROM t WHERE a = $1 OR b = $1",
                DatabaseType::PostgreSQL
            ),
            1
        );
        assert_eq!(
            count_placeholders("SELECT $2 + $1", DatabaseType::PostgreSQL),
            2
        );
        // A bare '$' is not a placeholder.
        assert_eq!(
            count_placeholders("SELECT price$ FROM t", DatabaseType::PostgreSQL),
            0
        );
    }

    #[test]
    fn test_unterminated_literal_does_not_panic() {
        assert_eq!(count_placeholders("SELECT '? unclosed", DatabaseType::SQLite), 0);
        assert_eq!(
            count_placeholders("SELECT /* unclosed ?", DatabaseType::SQLite),
            0
        );
    }
}
