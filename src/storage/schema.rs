//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            ts_ms INTEGER NOT NULL,
            entity TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            ingested_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            rule_id TEXT NOT NULL,
            entity TEXT NOT NULL,
            severity TEXT NOT NULL,
            channel TEXT NOT NULL,
            message TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            fired_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_alerts_fired ON alerts(fired_at);
        CREATE INDEX IF NOT EXISTS idx_alerts_rule_entity ON alerts(rule_id, entity);",
    )?;

    // Migration: record the resource id column for journal-side lookups
    let has_resource: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('events') WHERE name='resource_id'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_resource == 0 {
        conn.execute(
            "ALTER TABLE events ADD COLUMN resource_id TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
