//! Version-tracked schema migrations for the task table.
//!
//! The table name is configurable, so migration SQL uses a `{table}`
//! placeholder and versions are tracked per table in `_migrations`.
//! A task table that already exists without any recorded version (created
//! by an older deployment, lacking the `owner` column) is adopted: the
//! column is added and V1 is seeded without re-creating the table.

use libsql::{Connection, params};

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                timeout INTEGER NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER,
                resource TEXT,
                max_running INTEGER,
                owner TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_timeout ON {table}(timeout);
        "#,
    },
    Migration {
        version: 2,
        name: "resource_and_owner_indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_{table}_resource ON {table}(resource, timeout);
            CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner);
        "#,
    },
];

/// Bring the task table up to the latest schema version.
pub async fn run_migrations(conn: &Connection, table: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            table_name TEXT NOT NULL,
            version INTEGER NOT NULL,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (table_name, version)
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let mut current_version = get_current_version(conn, table).await?;

    if current_version == 0 && table_exists(conn, table).await? {
        // Ignore the error when the column is already there.
        let _ = conn
            .execute(&format!("ALTER TABLE {table} ADD COLUMN owner TEXT"), ())
            .await;
        seed_version(conn, table, 1, "initial_schema").await?;
        current_version = 1;
        tracing::info!(table, "Existing task table adopted, seeded migration V1");
    }

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                table,
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(&migration.sql.replace("{table}", table))
                .await
                .map_err(|e| {
                    DatabaseError::Migration(format!(
                        "Migration V{} ({}) failed: {e}",
                        migration.version, migration.name
                    ))
                })?;
            seed_version(conn, table, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn, table).await?;
    tracing::debug!(table, version, "Database migrations complete");
    Ok(())
}

/// Latest known schema version.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Get the highest applied migration version for `table`, or 0 if none.
pub async fn get_current_version(conn: &Connection, table: &str) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations WHERE table_name = ?1",
            params![table],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn table_exists(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            params![table],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to check for table: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
        Ok(None) => Ok(false),
        Err(e) => Err(DatabaseError::Migration(format!("Failed to check for table: {e}"))),
    }
}

async fn seed_version(
    conn: &Connection,
    table: &str,
    version: i64,
    name: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (table_name, version, name) VALUES (?1, ?2, ?3)",
        params![table, version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut rows = conn
            .query(&format!("PRAGMA table_info({table})"), ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(1).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn migrations_create_task_table() {
        let conn = test_conn().await;
        run_migrations(&conn, "tasks").await.unwrap();

        let cols = column_names(&conn, "tasks").await;
        for expected in ["id", "timeout", "data", "created_at", "resource", "max_running", "owner"] {
            assert!(cols.iter().any(|c| c == expected), "missing column {expected}");
        }
        assert_eq!(get_current_version(&conn, "tasks").await.unwrap(), latest_version());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn, "tasks").await.unwrap();
        run_migrations(&conn, "tasks").await.unwrap();
        assert_eq!(get_current_version(&conn, "tasks").await.unwrap(), latest_version());
    }

    #[tokio::test]
    async fn versions_tracked_per_table() {
        let conn = test_conn().await;
        run_migrations(&conn, "jobs_a").await.unwrap();
        assert_eq!(get_current_version(&conn, "jobs_b").await.unwrap(), 0);
        run_migrations(&conn, "jobs_b").await.unwrap();
        assert_eq!(get_current_version(&conn, "jobs_b").await.unwrap(), latest_version());
    }

    #[tokio::test]
    async fn existing_table_without_owner_is_adopted() {
        let conn = test_conn().await;
        conn.execute_batch(
            "CREATE TABLE legacy (
                id TEXT PRIMARY KEY,
                timeout INTEGER NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER,
                resource TEXT,
                max_running INTEGER
            );
            INSERT INTO legacy (id, timeout, data, created_at) VALUES ('t1', 100, '{}', 100);",
        )
        .await
        .unwrap();

        run_migrations(&conn, "legacy").await.unwrap();

        assert!(column_names(&conn, "legacy").await.contains(&"owner".to_string()));
        let mut rows = conn.query("SELECT COUNT(*) FROM legacy", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }
}
