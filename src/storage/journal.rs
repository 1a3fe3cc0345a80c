//! SQLite journal backing the in-memory event index.
//!
//! Every accepted event is written here before the append is acknowledged.
//! On startup the journal is replayed to rebuild the shards.

use rusqlite::params;
use tracing::{debug, error};

use crate::error::EngineResult;
use crate::event::Event;
use crate::storage::Pool;

#[derive(Clone)]
pub struct Journal {
    pool: Pool,
}

impl Journal {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Persist one event under its sequence id.
    pub fn insert(&self, event: &Event) -> EngineResult<()> {
        let conn = self.pool.get()?;
        let payload = serde_json::to_string(event)?;
        conn.execute(
            "INSERT INTO events (id, ts_ms, entity, resource_id, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id as i64,
                event.timestamp_ms(),
                event.entity,
                event.resource_id,
                payload
            ],
        )?;
        Ok(())
    }

    /// Load every journaled event at or after `horizon_ms`, in ingestion order.
    pub fn replay(&self, horizon_ms: i64) -> EngineResult<Vec<Event>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, payload_json FROM events WHERE ts_ms >= ?1 ORDER BY id ASC",
        )?;

        let rows: Vec<(i64, String)> = stmt
            .query_map(params![horizon_ms], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, json) in rows {
            match serde_json::from_str::<Event>(&json) {
                Ok(mut event) => {
                    event.id = id as u64;
                    events.push(event);
                }
                Err(e) => {
                    // Skip the row so one corrupt record cannot block recovery
                    error!(id, error = %e, "failed to parse journaled event");
                }
            }
        }
        debug!(count = events.len(), "replayed journal");
        Ok(events)
    }

    /// Highest sequence id ever journaled, including purged ranges' successors.
    pub fn max_id(&self) -> EngineResult<u64> {
        let conn = self.pool.get()?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM events", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    /// Delete events strictly older than `horizon_ms`.
    pub fn purge_before(&self, horizon_ms: i64) -> EngineResult<usize> {
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM events WHERE ts_ms < ?1", params![horizon_ms])?;
        Ok(deleted)
    }
}
