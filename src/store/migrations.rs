//! Version-tracked Ledger migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

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
        name: "initial_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS ledger (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                attachment_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                received_at TEXT NOT NULL,
                attachment_name TEXT NOT NULL,
                stored_path TEXT NOT NULL UNIQUE,
                content_hash TEXT NOT NULL UNIQUE,
                message_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'discovered',
                error_detail TEXT,
                discovered_at TEXT,
                downloaded_at TEXT,
                extracted_at TEXT,
                converted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (source_id, attachment_id)
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger(status);
            CREATE INDEX IF NOT EXISTS idx_ledger_thread ON ledger(thread_id);
        "#,
    },
    Migration {
        version: 2,
        name: "failure_tracking",
        sql: r#"
            ALTER TABLE ledger ADD COLUMN failed_from TEXT;
            ALTER TABLE ledger ADD COLUMN failure_kind TEXT;
            ALTER TABLE ledger ADD COLUMN retryable INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE ledger ADD COLUMN failed_at TEXT;
            CREATE INDEX IF NOT EXISTS idx_ledger_failed_from ON ledger(failed_from);
        "#,
    },
    Migration {
        version: 3,
        name: "stage_artifacts",
        sql: r#"
            ALTER TABLE ledger ADD COLUMN text_path TEXT;
            ALTER TABLE ledger ADD COLUMN result_path TEXT;
            ALTER TABLE ledger ADD COLUMN schema_id TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Ledger migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
