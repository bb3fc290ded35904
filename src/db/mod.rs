//! Database access layer.
//!
//! This module provides the moving parts of the access layer:
//! - Physical connection factory
//! - Bounded connection pool
//! - Statement execution with typed row mapping
//! - Parameter binding helpers
//! - Backend dispatch macros for reducing code duplication

pub mod executor;
pub mod factory;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod row;

pub use executor::{DEFAULT_STATEMENT_TIMEOUT_SECS, StatementExecutor};
pub use factory::{ConnectionFactory, DbConnection};
pub use pool::{Pool, PooledConnection};
pub use row::RowView;
