//! dbkit demo - end-to-end walk through the access layer.
//!
//! Connects to a database, runs a small migration, then exercises
//! parameterized, batch and mapped-query execution against the migrated
//! table.

use clap::Parser;
use dbkit::{ChangeSet, EndpointConfig, MigrationRunner, Pool, SqlParam, StatementExecutor};
use dbkit::{ConnectionFactory, DatabaseType};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbkit-demo",
    about = "Demo for the dbkit connection-pooled SQL access layer",
    version,
    author
)]
struct DemoConfig {
    /// Database connection URL.
    /// Pool knobs ride along as query parameters, e.g.
    /// sqlite:demo.db?max_size=5&min_idle=2
    #[arg(short = 'd', long = "database", value_name = "URL", env = "DBKIT_DATABASE")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBKIT_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBKIT_JSON_LOGS")]
    json_logs: bool,
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &DemoConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[derive(Debug)]
struct Person {
    id: i64,
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let demo = DemoConfig::parse();
    init_tracing(&demo);

    let config = EndpointConfig::parse(&demo.database)?;
    info!(
        endpoint = %config.masked_url(),
        db_type = %config.db_type,
        "starting dbkit demo v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = Pool::connect(config.clone()).await?;

    {
        let factory = ConnectionFactory::new(config.clone());
        let mut conn = pool.acquire().await?;
        if let Some(version) = factory.server_version(conn.connection_mut()).await {
            info!(server_version = %version, "connected");
        }
        conn.release().await;
    }

    let change_sets = vec![ChangeSet::new(
        "001-create-example",
        "example table for the demo",
        vec!["CREATE TABLE example (id BIGINT PRIMARY KEY, name VARCHAR(255) NOT NULL)"],
    )];
    let runner = MigrationRunner::new();
    let report = runner.run(&pool, &change_sets).await?;
    info!(
        applied = report.applied_count(),
        skipped = report.skipped_count(),
        "migration finished"
    );

    let insert_sql = match config.db_type {
        DatabaseType::PostgreSQL => "INSERT INTO example (id, name) VALUES ($1, $2)",
        _ => "INSERT INTO example (id, name) VALUES (?, ?)",
    };

    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await?;

    for (id, name) in [(1i64, "One"), (2, "Two")] {
        let affected = executor
            .execute(
                &mut conn,
                insert_sql,
                &[SqlParam::Int(id), SqlParam::from(name)],
            )
            .await?;
        info!(id, name, affected, "inserted row");
    }

    let to_insert = [(100i64, "100"), (200, "200")];
    let counts = executor
        .execute_batch(
            &mut conn,
            insert_sql,
            &to_insert
                .iter()
                .map(|(id, name)| vec![SqlParam::Int(*id), SqlParam::from(*name)])
                .collect::<Vec<_>>(),
        )
        .await?;
    info!(sets = counts.len(), ?counts, "batch insert finished");

    let people = executor
        .query_all(
            &mut conn,
            "SELECT id, name FROM example ORDER BY id",
            &[],
            |row| {
                Ok(Person {
                    id: row.get_i64(0)?,
                    name: row.get_string(1)?,
                })
            },
        )
        .await?;
    for person in &people {
        info!(id = person.id, name = %person.name, "row");
    }

    conn.release().await;
    pool.shutdown(Duration::from_secs(5)).await;
    info!("demo complete");
    Ok(())
}
