use dbkit::{
    ChangeSet, DbError, EndpointConfig, MigrationRunner, Pool, SqlParam, StatementExecutor,
};
use futures_util::StreamExt;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Pool with the demo `example` table migrated in.
async fn example_pool(temp: &NamedTempFile) -> Pool {
    let url = format!("sqlite:{}", temp.path().display());
    let pool = Pool::connect(EndpointConfig::parse(&url).unwrap())
        .await
        .unwrap();
    let change_sets = vec![ChangeSet::new(
        "001-create-example",
        "example table",
        vec!["CREATE TABLE example (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"],
    )];
    MigrationRunner::new()
        .run(&pool, &change_sets)
        .await
        .unwrap();
    pool
}

const INSERT: &str = "INSERT INTO example (id, name) VALUES (?, ?)";

#[tokio::test]
async fn test_execute_returns_affected_count() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    let affected = executor
        .execute(
            &mut conn,
            INSERT,
            &[SqlParam::Int(1), SqlParam::from("One")],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let affected = executor
        .execute(
            &mut conn,
            "UPDATE example SET name = ? WHERE id = ?",
            &[SqlParam::from("nobody"), SqlParam::Int(999)],
        )
        .await
        .unwrap();
    assert_eq!(affected, 0);

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_param_count_mismatch_fails_before_sending() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    // The target table does not exist. A ParamBinding error (not a
    // statement error) proves nothing reached the database.
    let err = executor
        .execute(
            &mut conn,
            "INSERT INTO missing_table (a, b) VALUES (?, ?)",
            &[SqlParam::Int(1)],
        )
        .await
        .unwrap_err();
    let DbError::ParamBinding { expected, supplied } = err else {
        panic!("expected ParamBinding, got {err:?}");
    };
    assert_eq!(expected, 2);
    assert_eq!(supplied, 1);

    // The connection is still usable afterwards.
    let affected = executor
        .execute(
            &mut conn,
            INSERT,
            &[SqlParam::Int(1), SqlParam::from("One")],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_batch_insert_and_query_in_insertion_order() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    let counts = executor
        .execute_batch(
            &mut conn,
            INSERT,
            &[
                vec![SqlParam::Int(1), SqlParam::from("One")],
                vec![SqlParam::Int(2), SqlParam::from("Two")],
            ],
        )
        .await
        .unwrap();
    assert_eq!(counts, vec![1, 1]);

    let rows = executor
        .query_all(
            &mut conn,
            "SELECT id, name FROM example",
            &[],
            |row| Ok((row.get_i64(0)?, row.get_string(1)?)),
        )
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![(1, "One".to_string()), (2, "Two".to_string())]
    );

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_batch_partial_failure_reports_index_and_prefix() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    executor
        .execute(
            &mut conn,
            INSERT,
            &[SqlParam::Int(1), SqlParam::from("One")],
        )
        .await
        .unwrap();

    // Second set collides with the existing primary key.
    let err = executor
        .execute_batch(
            &mut conn,
            INSERT,
            &[
                vec![SqlParam::Int(2), SqlParam::from("Two")],
                vec![SqlParam::Int(1), SqlParam::from("dup")],
                vec![SqlParam::Int(3), SqlParam::from("Three")],
            ],
        )
        .await
        .unwrap_err();
    let DbError::Batch {
        index, completed, ..
    } = err
    else {
        panic!("expected Batch, got {err:?}");
    };
    assert_eq!(index, 1);
    assert_eq!(completed, vec![1]);

    // Autocommit batch: the prefix is committed, nothing after the
    // failure ran.
    let ids = executor
        .query_all(&mut conn, "SELECT id FROM example", &[], |row| {
            row.get_i64(0)
        })
        .await
        .unwrap();
    assert_eq!(ids, vec![1, 2]);

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_query_streams_rows_lazily() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    for (id, name) in [(1i64, "One"), (2, "Two"), (3, "Three")] {
        executor
            .execute(&mut conn, INSERT, &[SqlParam::Int(id), SqlParam::from(name)])
            .await
            .unwrap();
    }

    {
        let mut stream = executor.query(
            &mut conn,
            "SELECT id, name FROM example ORDER BY id",
            &[],
            |row| Ok((row.get_i64(0)?, row.get_string(1)?)),
        );
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, (1, "One".to_string()));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second, (2, "Two".to_string()));
        // Dropped here without draining - the remaining row is never
        // materialized.
    }

    // The connection keeps working after an abandoned stream.
    let count = executor
        .query_all(&mut conn, "SELECT COUNT(*) FROM example", &[], |row| {
            row.get_i64(0)
        })
        .await
        .unwrap();
    assert_eq!(count, vec![3]);

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_query_with_positional_params() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    for (id, name) in [(1i64, "One"), (2, "Two"), (3, "Three")] {
        executor
            .execute(&mut conn, INSERT, &[SqlParam::Int(id), SqlParam::from(name)])
            .await
            .unwrap();
    }

    let names = executor
        .query_all(
            &mut conn,
            "SELECT name FROM example WHERE id > ? ORDER BY id",
            &[SqlParam::Int(1)],
            |row| row.get_string(0),
        )
        .await
        .unwrap();
    assert_eq!(names, vec!["Two", "Three"]);

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_mapper_errors_surface_per_row() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    executor
        .execute(
            &mut conn,
            INSERT,
            &[SqlParam::Int(1), SqlParam::from("One")],
        )
        .await
        .unwrap();

    // The mapper asks for a column that does not exist.
    let result = executor
        .query_all(&mut conn, "SELECT id FROM example", &[], |row| {
            row.get_string(5)
        })
        .await;
    assert!(result.is_err());

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_null_columns_map_to_none() {
    let temp = NamedTempFile::new().unwrap();
    let pool = example_pool(&temp).await;
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire().await.unwrap();

    let values = executor
        .query_all(&mut conn, "SELECT NULL", &[], |row| row.get_opt_string(0))
        .await
        .unwrap();
    assert_eq!(values, vec![None]);

    conn.release().await;
    pool.shutdown(Duration::from_secs(1)).await;
}
