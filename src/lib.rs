//! dbkit - embedded connection-pooled SQL access layer.
//!
//! Safe, efficient reuse of database connections across sequential and
//! concurrent callers, coupled with ordered schema migration and typed row
//! mapping. One [`Pool`] serves one logical database endpoint (MySQL,
//! PostgreSQL or SQLite); the [`MigrationRunner`] and
//! [`StatementExecutor`] borrow connections from it and never own any
//! themselves.

pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;

pub use config::{DatabaseType, EndpointConfig, PoolSettings};
pub use db::{ConnectionFactory, DbConnection, Pool, PooledConnection, RowView, StatementExecutor};
pub use error::{DbError, DbResult};
pub use migrate::{AppliedChange, ChangeSet, ChangeSetState, MigrationReport, MigrationRunner};
pub use models::SqlParam;
