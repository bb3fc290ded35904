//! Backend dispatch macros for reducing code duplication.
//!
//! Match arms over [`DbConnection`](crate::db::factory::DbConnection) are
//! structurally identical for operations the `sqlx` `Connection` trait
//! already unifies; this macro generates them at compile time with zero
//! runtime overhead.

/// Macro for generating backend dispatch match arms.
///
/// # Example
///
/// ```ignore
/// for_each_backend!(conn, c => c.ping().await.map_err(DbError::from))
/// ```
#[macro_export]
macro_rules! for_each_backend {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            $crate::db::factory::DbConnection::MySql($c) => $body,
            $crate::db::factory::DbConnection::Postgres($c) => $body,
            $crate::db::factory::DbConnection::SQLite($c) => $body,
        }
    };
}

pub use for_each_backend;
