//! Ordered schema migration with a persisted ledger.
//!
//! A [`ChangeSet`] is an atomic, identified unit of schema change applied
//! at most once. Applied change-sets are recorded in a ledger table
//! (`schema_ledger` by default) keyed by change-set id, together with the
//! checksum of the statements at apply time. Rerunning with a tampered
//! change-set fails with a checksum mismatch instead of silently
//! reapplying.
//!
//! Per change-set, the statements and the ledger insert commit in one
//! transaction; a partial failure rolls everything back and aborts the
//! run. (MySQL DDL commits implicitly, so the rollback guarantee there
//! covers DML statements only.)
//!
//! Concurrent runs: `run` calls through one runner are serialized with an
//! async mutex. Across processes the ledger's primary key arbitrates - the
//! loser of an insert race re-reads the entry and treats a matching
//! checksum as already applied. Running more than one migration deployment
//! against the same ledger is still best avoided.

use crate::config::DatabaseType;
use crate::db::factory::DbConnection;
use crate::db::pool::{Pool, PooledConnection};
use crate::db::row::RowView;
use crate::error::{DbError, DbResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Default name of the ledger table.
pub const DEFAULT_LEDGER_TABLE: &str = "schema_ledger";

/// An atomic, identified unit of schema change.
///
/// Ids must be unique and are applied in the order the caller supplies
/// them. The checksum covers the id and every statement; change-sets are
/// immutable once authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub description: String,
    pub statements: Vec<String>,
    pub checksum: String,
}

impl ChangeSet {
    /// Create a change-set, computing its checksum from the id and
    /// statements.
    pub fn new<S: Into<String>>(
        id: impl Into<String>,
        description: impl Into<String>,
        statements: Vec<S>,
    ) -> Self {
        let id = id.into();
        let statements: Vec<String> = statements.into_iter().map(Into::into).collect();
        let checksum = Self::compute_checksum(&id, &statements);
        Self {
            id,
            description: description.into(),
            statements,
            checksum,
        }
    }

    /// Override the checksum with an externally-authored value.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    /// SHA-256 over the id and statements, as lowercase hex.
    pub fn compute_checksum(id: &str, statements: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        for statement in statements {
            // Separator byte keeps ["ab","c"] and ["a","bc"] distinct.
            hasher.update([0u8]);
            hasher.update(statement.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Lifecycle of one change-set within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl std::fmt::Display for ChangeSetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applying => write!(f, "applying"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One row of the ledger table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedChange {
    pub change_set_id: String,
    /// RFC-3339 timestamp recorded at apply time.
    pub applied_at: String,
    pub checksum: String,
}

/// Outcome of a successful migration run.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Change-sets applied by this run, in order.
    pub applied: Vec<String>,
    /// Change-sets skipped because the ledger already records them with a
    /// matching checksum.
    pub skipped: Vec<String>,
}

impl MigrationReport {
    /// Number of change-sets this run applied.
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Number of change-sets skipped as already applied.
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Applies ordered change-sets exactly once, tracked via the ledger table.
pub struct MigrationRunner {
    ledger_table: String,
    /// Serializes concurrent `run` calls through this runner.
    run_lock: Mutex<()>,
}

impl MigrationRunner {
    /// Create a runner using the default ledger table name.
    pub fn new() -> Self {
        Self {
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            run_lock: Mutex::new(()),
        }
    }

    /// Create a runner with a custom ledger table name.
    ///
    /// The name is interpolated into DDL, so it is restricted to
    /// identifier characters.
    pub fn with_ledger_table(name: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && !name.as_bytes()[0].is_ascii_digit()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(DbError::config(format!(
                "ledger table name must be a plain SQL identifier, got '{}'",
                name
            )));
        }
        Ok(Self {
            ledger_table: name,
            run_lock: Mutex::new(()),
        })
    }

    /// Get the ledger table name.
    pub fn ledger_table(&self) -> &str {
        &self.ledger_table
    }

    /// Apply `change_sets` in order against the pool's endpoint.
    ///
    /// One connection is held for the whole run so the ledger reads and
    /// the changes share a session. Already-applied change-sets (matching
    /// checksum) are skipped; a mismatched checksum aborts with
    /// [`DbError::ChecksumMismatch`]; any other failure rolls back the
    /// current change-set and aborts with [`DbError::MigrationFailed`] -
    /// later change-sets are not attempted, prior ones stay committed.
    pub async fn run(&self, pool: &Pool, change_sets: &[ChangeSet]) -> DbResult<MigrationReport> {
        let _serial = self.run_lock.lock().await;
        let mut conn = pool.acquire().await?;

        info!(
            ledger_table = %self.ledger_table,
            change_sets = change_sets.len(),
            "starting migration run"
        );
        let result = self.run_on(&mut conn, change_sets).await;

        if let Err(ref err) = result {
            if err.indicates_broken_connection() {
                conn.mark_broken();
            }
        }
        conn.release().await;

        match &result {
            Ok(report) => info!(
                applied = report.applied_count(),
                skipped = report.skipped_count(),
                "migration run complete"
            ),
            Err(err) => error!(error = %err, "migration run aborted"),
        }
        result
    }

    /// List the ledger, creating the table first if it does not exist.
    pub async fn ledger(&self, pool: &Pool) -> DbResult<Vec<AppliedChange>> {
        let mut conn = pool.acquire().await?;
        let result = async {
            ops::ensure_ledger(conn.connection_mut(), &self.ledger_table).await?;
            ops::list_entries(conn.connection_mut(), &self.ledger_table).await
        }
        .await;
        conn.release().await;
        result
    }

    async fn run_on(
        &self,
        conn: &mut PooledConnection,
        change_sets: &[ChangeSet],
    ) -> DbResult<MigrationReport> {
        ops::ensure_ledger(conn.connection_mut(), &self.ledger_table).await?;

        let mut report = MigrationReport::default();
        for change_set in change_sets {
            debug!(
                change_set_id = %change_set.id,
                state = %ChangeSetState::Pending,
                "inspecting change-set"
            );

            if let Some(entry) =
                ops::find_entry(conn.connection_mut(), &self.ledger_table, &change_set.id).await?
            {
                if entry.checksum == change_set.checksum {
                    debug!(change_set_id = %change_set.id, "already applied, skipping");
                    report.skipped.push(change_set.id.clone());
                    continue;
                }
                return Err(DbError::checksum_mismatch(
                    &change_set.id,
                    entry.checksum,
                    &change_set.checksum,
                ));
            }

            info!(
                change_set_id = %change_set.id,
                description = %change_set.description,
                state = %ChangeSetState::Applying,
                "applying change-set"
            );
            match ops::apply_change_set(conn.connection_mut(), &self.ledger_table, change_set)
                .await
            {
                Ok(()) => {
                    info!(
                        change_set_id = %change_set.id,
                        state = %ChangeSetState::Applied,
                        "change-set applied"
                    );
                    report.applied.push(change_set.id.clone());
                }
                Err(err) if err.is_unique_violation() => {
                    // A concurrent runner won the insert race. First commit
                    // wins: a matching entry means already applied.
                    let entry = ops::find_entry(
                        conn.connection_mut(),
                        &self.ledger_table,
                        &change_set.id,
                    )
                    .await?;
                    match entry {
                        Some(entry) if entry.checksum == change_set.checksum => {
                            info!(
                                change_set_id = %change_set.id,
                                "concurrent runner applied this change-set first"
                            );
                            report.skipped.push(change_set.id.clone());
                        }
                        Some(entry) => {
                            return Err(DbError::checksum_mismatch(
                                &change_set.id,
                                entry.checksum,
                                &change_set.checksum,
                            ));
                        }
                        None => {
                            return Err(DbError::migration_failed(&change_set.id, err));
                        }
                    }
                }
                Err(err) => {
                    error!(
                        change_set_id = %change_set.id,
                        state = %ChangeSetState::Failed,
                        error = %err,
                        "change-set failed, rolled back"
                    );
                    return Err(DbError::migration_failed(&change_set.id, err));
                }
            }
        }
        Ok(report)
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Ledger operations
// =============================================================================

mod ops {
    use super::*;
    use crate::for_each_backend;
    use sqlx::Connection;

    /// Create the ledger table if it does not exist. Idempotent.
    pub(super) async fn ensure_ledger(conn: &mut DbConnection, table: &str) -> DbResult<()> {
        let ddl = match conn.db_type() {
            DatabaseType::MySQL => format!(
                "CREATE TABLE IF NOT EXISTS {} (change_set_id VARCHAR(255) PRIMARY KEY, applied_at VARCHAR(64) NOT NULL, checksum VARCHAR(64) NOT NULL)",
                table
            ),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => format!(
                "CREATE TABLE IF NOT EXISTS {} (change_set_id TEXT PRIMARY KEY, applied_at TEXT NOT NULL, checksum TEXT NOT NULL)",
                table
            ),
        };
        for_each_backend!(conn, c => {
            use sqlx::Executor;
            c.execute(ddl.as_str()).await.map(|_| ()).map_err(DbError::from)
        })
    }

    /// Look up one ledger entry by change-set id.
    pub(super) async fn find_entry(
        conn: &mut DbConnection,
        table: &str,
        id: &str,
    ) -> DbResult<Option<AppliedChange>> {
        match conn {
            DbConnection::MySql(c) => {
                let sql = format!(
                    "SELECT change_set_id, applied_at, checksum FROM {} WHERE change_set_id = ?",
                    table
                );
                let row = sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(&mut *c)
                    .await
                    .map_err(DbError::from)?;
                row.map(|r| decode_entry(&RowView::MySql(&r))).transpose()
            }
            DbConnection::Postgres(c) => {
                let sql = format!(
                    "SELECT change_set_id, applied_at, checksum FROM {} WHERE change_set_id = $1",
                    table
                );
                let row = sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(&mut *c)
                    .await
                    .map_err(DbError::from)?;
                row.map(|r| decode_entry(&RowView::Postgres(&r))).transpose()
            }
            DbConnection::SQLite(c) => {
                let sql = format!(
                    "SELECT change_set_id, applied_at, checksum FROM {} WHERE change_set_id = ?",
                    table
                );
                let row = sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(&mut *c)
                    .await
                    .map_err(DbError::from)?;
                row.map(|r| decode_entry(&RowView::SQLite(&r))).transpose()
            }
        }
    }

    /// List every ledger entry, ordered by change-set id.
    pub(super) async fn list_entries(
        conn: &mut DbConnection,
        table: &str,
    ) -> DbResult<Vec<AppliedChange>> {
        let sql = format!(
            "SELECT change_set_id, applied_at, checksum FROM {} ORDER BY change_set_id",
            table
        );
        match conn {
            DbConnection::MySql(c) => {
                let rows = sqlx::query(&sql)
                    .fetch_all(&mut *c)
                    .await
                    .map_err(DbError::from)?;
                rows.iter()
                    .map(|r| decode_entry(&RowView::MySql(r)))
                    .collect()
            }
            DbConnection::Postgres(c) => {
                let rows = sqlx::query(&sql)
                    .fetch_all(&mut *c)
                    .await
                    .map_err(DbError::from)?;
                rows.iter()
                    .map(|r| decode_entry(&RowView::Postgres(r)))
                    .collect()
            }
            DbConnection::SQLite(c) => {
                let rows = sqlx::query(&sql)
                    .fetch_all(&mut *c)
                    .await
                    .map_err(DbError::from)?;
                rows.iter()
                    .map(|r| decode_entry(&RowView::SQLite(r)))
                    .collect()
            }
        }
    }

    /// Execute a change-set's statements and its ledger insert in one
    /// transaction. A failure rolls the whole unit back.
    pub(super) async fn apply_change_set(
        conn: &mut DbConnection,
        table: &str,
        change_set: &ChangeSet,
    ) -> DbResult<()> {
        let applied_at = Utc::now().to_rfc3339();
        match conn {
            DbConnection::MySql(c) => {
                let mut tx = c.begin().await.map_err(DbError::from)?;
                for statement in &change_set.statements {
                    use sqlx::Executor;
                    (&mut *tx)
                        .execute(statement.as_str())
                        .await
                        .map_err(DbError::from)?;
                }
                let insert = format!(
                    "INSERT INTO {} (change_set_id, applied_at, checksum) VALUES (?, ?, ?)",
                    table
                );
                sqlx::query(&insert)
                    .bind(&change_set.id)
                    .bind(&applied_at)
                    .bind(&change_set.checksum)
                    .execute(&mut *tx)
                    .await
                    .map_err(DbError::from)?;
                tx.commit().await.map_err(DbError::from)
            }
            DbConnection::Postgres(c) => {
                let mut tx = c.begin().await.map_err(DbError::from)?;
                for statement in &change_set.statements {
                    use sqlx::Executor;
                    (&mut *tx)
                        .execute(statement.as_str())
                        .await
                        .map_err(DbError::from)?;
                }
                let insert = format!(
                    "INSERT INTO {} (change_set_id, applied_at, checksum) VALUES ($1, $2, $3)",
                    table
                );
                sqlx::query(&insert)
                    .bind(&change_set.id)
                    .bind(&applied_at)
                    .bind(&change_set.checksum)
                    .execute(&mut *tx)
                    .await
                    .map_err(DbError::from)?;
                tx.commit().await.map_err(DbError::from)
            }
            DbConnection::SQLite(c) => {
                let mut tx = c.begin().await.map_err(DbError::from)?;
                for statement in &change_set.statements {
                    use sqlx::Executor;
                    (&mut *tx)
                        .execute(statement.as_str())
                        .await
                        .map_err(DbError::from)?;
                }
                let insert = format!(
                    "INSERT INTO {} (change_set_id, applied_at, checksum) VALUES (?, ?, ?)",
                    table
                );
                sqlx::query(&insert)
                    .bind(&change_set.id)
                    .bind(&applied_at)
                    .bind(&change_set.checksum)
                    .execute(&mut *tx)
                    .await
                    .map_err(DbError::from)?;
                tx.commit().await.map_err(DbError::from)
            }
        }
    }

    fn decode_entry(view: &RowView<'_>) -> DbResult<AppliedChange> {
        Ok(AppliedChange {
            change_set_id: view.get_string(0)?,
            applied_at: view.get_string(1)?,
            checksum: view.get_string(2)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        let a = ChangeSet::new("001", "first", vec!["CREATE TABLE t (id INTEGER)"]);
        let b = ChangeSet::new("001", "first", vec!["CREATE TABLE t (id INTEGER)"]);
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.checksum.len(), 64);
        assert!(a.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checksum_covers_statements_and_id() {
        let base = ChangeSet::new("001", "d", vec!["CREATE TABLE t (id INTEGER)"]);
        let other_stmt = ChangeSet::new("001", "d", vec!["CREATE TABLE t (id BIGINT)"]);
        let other_id = ChangeSet::new("002", "d", vec!["CREATE TABLE t (id INTEGER)"]);
        assert_ne!(base.checksum, other_stmt.checksum);
        assert_ne!(base.checksum, other_id.checksum);
    }

    #[test]
    fn test_checksum_statement_boundaries_matter() {
        let joined = ChangeSet::new("001", "d", vec!["ab", "c"]);
        let split = ChangeSet::new("001", "d", vec!["a", "bc"]);
        assert_ne!(joined.checksum, split.checksum);
    }

    #[test]
    fn test_description_not_part_of_checksum() {
        let a = ChangeSet::new("001", "original wording", vec!["SELECT 1"]);
        let b = ChangeSet::new("001", "reworded", vec!["SELECT 1"]);
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_with_checksum_override() {
        let cs = ChangeSet::new("001", "d", vec!["SELECT 1"]).with_checksum("abc123");
        assert_eq!(cs.checksum, "abc123");
    }

    #[test]
    fn test_change_set_serde_roundtrip() {
        let cs = ChangeSet::new("001-create", "create table", vec!["CREATE TABLE t (id INTEGER)"]);
        let json = serde_json::to_string(&cs).unwrap();
        let back: ChangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cs);
    }

    #[test]
    fn test_ledger_table_name_validation() {
        assert!(MigrationRunner::with_ledger_table("schema_ledger").is_ok());
        assert!(MigrationRunner::with_ledger_table("Ledger2").is_ok());
        assert!(MigrationRunner::with_ledger_table("").is_err());
        assert!(MigrationRunner::with_ledger_table("2fast").is_err());
        assert!(MigrationRunner::with_ledger_table("bad-name").is_err());
        assert!(MigrationRunner::with_ledger_table("t; DROP TABLE x").is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ChangeSetState::Pending.to_string(), "pending");
        assert_eq!(ChangeSetState::Applying.to_string(), "applying");
        assert_eq!(ChangeSetState::Applied.to_string(), "applied");
        assert_eq!(ChangeSetState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_report_counts() {
        let report = MigrationReport {
            applied: vec!["001".into()],
            skipped: vec!["000".into(), "00a".into()],
        };
        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.skipped_count(), 2);
    }
}
