use anyhow::Result;
use rusqlite::params;

use crate::alert::AlertEvent;
use crate::storage::Pool;

/// Fired alerts persisted to the `alerts` table.
#[derive(Clone)]
pub struct AlertHistory {
    pool: Pool,
}

impl AlertHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn record(&self, event: &AlertEvent) -> Result<()> {
        let conn = self.pool.get()?;
        let payload = serde_json::to_string(event)?;

        conn.execute(
            "INSERT INTO alerts (id, rule_id, entity, severity, channel, message, payload_json, fired_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.to_string(),
                event.rule_id,
                event.entity,
                event.severity.as_str(),
                event.channel,
                event.message,
                payload,
                event.timestamp.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Most recent first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<AlertEvent>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT payload_json FROM alerts ORDER BY fired_at DESC, rowid DESC LIMIT ?1")?;

        let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;

        let mut alerts = Vec::new();
        for r in rows {
            alerts.push(serde_json::from_str(&r?)?);
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_record_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(dir.path().join("a.db").to_str().unwrap()).unwrap();
        let history = AlertHistory::new(pool);

        for minute in [0, 10, 5] {
            let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, minute, 0).unwrap();
            history
                .record(&AlertEvent {
                    id: uuid::Uuid::new_v4(),
                    rule_id: "spike".into(),
                    entity: "F2".into(),
                    timestamp: ts,
                    window_start: ts,
                    message: format!("at {minute}"),
                    severity: Severity::Error,
                    channel: "ops".into(),
                    score: Some(9.9),
                    observed: Some(6.0),
                })
                .unwrap();
        }

        let recent = history.list_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "at 10");
        assert_eq!(recent[1].message, "at 5");
        assert_eq!(recent[0].score, Some(9.9));
    }
}
