use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::event::IndexedEvent;
use crate::index::FailedEvent;
use crate::pipeline::{DocumentOutcome, DocumentStatus};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Events the backend did not accept, waiting for resubmission
        CREATE TABLE IF NOT EXISTS spill_queue (
            id          INTEGER PRIMARY KEY,
            index_name  TEXT NOT NULL,
            event_id    TEXT NOT NULL,
            body        TEXT NOT NULL,
            reason      TEXT,
            spilled_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(index_name, event_id)
        );
        CREATE INDEX IF NOT EXISTS idx_spill_index ON spill_queue(index_name);

        CREATE TABLE IF NOT EXISTS document_runs (
            id            INTEGER PRIMARY KEY,
            run_id        TEXT NOT NULL,
            source        TEXT NOT NULL,
            hostname      TEXT,
            status        TEXT NOT NULL CHECK(status IN ('succeeded','skipped')),
            reason        TEXT,
            verdicts      INTEGER NOT NULL DEFAULT 0,
            non_compliant INTEGER NOT NULL DEFAULT 0,
            processed_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_runs_run ON document_runs(run_id);
        ",
    )?;
    Ok(())
}

// ── Spill queue ──

/// Upsert undelivered events; re-spilling an event refreshes its reason.
pub fn spill_events(conn: &Connection, index: &str, failed: &[FailedEvent]) -> Result<usize> {
    if failed.is_empty() {
        return Ok(0);
    }
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO spill_queue (index_name, event_id, body, reason)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(index_name, event_id) DO UPDATE SET
                body = excluded.body,
                reason = excluded.reason,
                spilled_at = datetime('now')",
        )?;
        for f in failed {
            let body = serde_json::to_string(&f.event)?;
            count += stmt.execute(params![index, f.event.id(), body, f.reason])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Remove delivered events from the queue. Ids that are not queued are ignored.
pub fn clear_spilled(conn: &Connection, index: &str, event_ids: &[String]) -> Result<usize> {
    if event_ids.is_empty() {
        return Ok(0);
    }
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt =
            tx.prepare("DELETE FROM spill_queue WHERE index_name = ?1 AND event_id = ?2")?;
        for id in event_ids {
            count += stmt.execute(params![index, id])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub struct SpilledEvent {
    pub index: String,
    pub event: IndexedEvent,
}

pub fn fetch_spilled(conn: &Connection, limit: Option<usize>) -> Result<Vec<SpilledEvent>> {
    let sql = format!(
        "SELECT index_name, body FROM spill_queue ORDER BY id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(index, body)| {
            let event = serde_json::from_str(&body)
                .with_context(|| format!("Corrupt spilled event in {}", index))?;
            Ok(SpilledEvent { index, event })
        })
        .collect()
}

pub fn spill_count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM spill_queue", [], |row| row.get(0))?;
    Ok(n as usize)
}

// ── Runs ──

pub fn save_document_runs(conn: &Connection, run_id: &str, outcomes: &[DocumentOutcome]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO document_runs (run_id, source, hostname, status, reason, verdicts, non_compliant)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for o in outcomes {
            let (hostname, status, reason) = match &o.status {
                DocumentStatus::Succeeded { hostname, .. } => (Some(hostname.as_str()), "succeeded", None),
                DocumentStatus::Skipped { reason } => (None, "skipped", Some(reason.as_str())),
            };
            count += stmt.execute(params![
                run_id,
                o.source,
                hostname,
                status,
                reason,
                o.verdicts.len() as i64,
                o.non_compliant() as i64,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub struct DocumentRunRow {
    pub run_id: String,
    pub source: String,
    pub hostname: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub verdicts: i64,
    pub non_compliant: i64,
}

pub fn fetch_last_run(conn: &Connection) -> Result<Vec<DocumentRunRow>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, source, hostname, status, reason, verdicts, non_compliant
         FROM document_runs
         WHERE run_id = (SELECT run_id FROM document_runs ORDER BY id DESC LIMIT 1)
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(DocumentRunRow {
                run_id: row.get(0)?,
                source: row.get(1)?,
                hostname: row.get(2)?,
                status: row.get(3)?,
                reason: row.get(4)?,
                verdicts: row.get(5)?,
                non_compliant: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Tests ──
