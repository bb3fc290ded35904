//! Typed row access for row mappers.
//!
//! A [`RowView`] is the borrowed, positional view of one result row handed
//! to row-mapper closures. Mappers decode the columns they care about into
//! a caller-defined record type; the view cannot outlive the mapper call,
//! so rows are never retained past their invocation.

use crate::error::{DbError, DbResult};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Row};

/// Borrowed view of one result row.
///
/// Columns are addressed by zero-based position (`usize`) or by name
/// (`&str`).
pub enum RowView<'r> {
    MySql(&'r MySqlRow),
    Postgres(&'r PgRow),
    SQLite(&'r SqliteRow),
}

macro_rules! typed_getters {
    ($($name:ident / $opt_name:ident => $ty:ty),+ $(,)?) => {
        $(
            /// Decode the column at `index` (position or name).
            pub fn $name<I>(&self, index: I) -> DbResult<$ty>
            where
                I: ColumnIndex<MySqlRow> + ColumnIndex<PgRow> + ColumnIndex<SqliteRow>,
            {
                match self {
                    Self::MySql(row) => row.try_get::<$ty, _>(index).map_err(DbError::from),
                    Self::Postgres(row) => row.try_get::<$ty, _>(index).map_err(DbError::from),
                    Self::SQLite(row) => row.try_get::<$ty, _>(index).map_err(DbError::from),
                }
            }

            /// Decode a nullable column at `index` (position or name).
            pub fn $opt_name<I>(&self, index: I) -> DbResult<Option<$ty>>
            where
                I: ColumnIndex<MySqlRow> + ColumnIndex<PgRow> + ColumnIndex<SqliteRow>,
            {
                match self {
                    Self::MySql(row) => {
                        row.try_get::<Option<$ty>, _>(index).map_err(DbError::from)
                    }
                    Self::Postgres(row) => {
                        row.try_get::<Option<$ty>, _>(index).map_err(DbError::from)
                    }
                    Self::SQLite(row) => {
                        row.try_get::<Option<$ty>, _>(index).map_err(DbError::from)
                    }
                }
            }
        )+
    };
}

impl<'r> RowView<'r> {
    typed_getters! {
        get_i64 / get_opt_i64 => i64,
        get_f64 / get_opt_f64 => f64,
        get_bool / get_opt_bool => bool,
        get_string / get_opt_string => String,
        get_bytes / get_opt_bytes => Vec<u8>,
    }

    /// Number of columns in the row.
    pub fn column_count(&self) -> usize {
        match self {
            Self::MySql(row) => row.columns().len(),
            Self::Postgres(row) => row.columns().len(),
            Self::SQLite(row) => row.columns().len(),
        }
    }

    /// Name of the column at `index`, if it exists.
    pub fn column_name(&self, index: usize) -> Option<&str> {
        match self {
            Self::MySql(row) => row.columns().get(index).map(|c| c.name()),
            Self::Postgres(row) => row.columns().get(index).map(|c| c.name()),
            Self::SQLite(row) => row.columns().get(index).map(|c| c.name()),
        }
    }
}

impl std::fmt::Debug for RowView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowView")
            .field("columns", &self.column_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::ConnectOptions;
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_positional_and_named_access() {
        let mut conn = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .unwrap();

        let row = sqlx::query("SELECT 42 AS id, 'hello' AS label, NULL AS note")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        let view = RowView::SQLite(&row);

        assert_eq!(view.column_count(), 3);
        assert_eq!(view.column_name(1), Some("label"));
        assert_eq!(view.get_i64(0).unwrap(), 42);
        assert_eq!(view.get_string("label").unwrap(), "hello");
        assert_eq!(view.get_opt_string("note").unwrap(), None);
        assert!(view.get_i64(9).is_err());
    }
}
