//! Sqlite-backed request log
//!
//! Inserts are handed to a dedicated writer thread over a channel so the
//! forwarder never waits on sqlite; losing queued records on crash is
//! acceptable. Reads come straight from the shared connection.

use chrono::{DateTime, Utc};
use paf_core::{Error, LogStats, RequestLogReader, RequestRecord, RequestSink, Result, UsageMetrics};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Persistent request log with a background writer
pub struct SqliteRequestLogger {
    db: Arc<Mutex<Connection>>,
    tx: mpsc::Sender<RequestRecord>,
}

impl SqliteRequestLogger {
    /// Open (or create) the database and start the writer thread
    pub fn new(db_path: &Path, max_logs: usize) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| Error::internal(format!("open {}: {e}", db_path.display())))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                service TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                config_name TEXT,
                target_url TEXT,
                stripped_blocks INTEGER NOT NULL DEFAULT 0,
                request_body TEXT,
                response_body TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                cache_creation_input_tokens INTEGER,
                cache_read_input_tokens INTEGER,
                model TEXT
            )",
            [],
        )
        .map_err(sql_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_timestamp ON request_logs(timestamp DESC)",
            [],
        )
        .map_err(sql_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_service ON request_logs(service)",
            [],
        )
        .map_err(sql_err)?;

        info!("Request logger initialized with database: {}", db_path.display());

        let db = Arc::new(Mutex::new(conn));
        let (tx, rx) = mpsc::channel::<RequestRecord>();

        let writer_db = db.clone();
        std::thread::Builder::new()
            .name("paf-request-log".to_string())
            .spawn(move || {
                while let Ok(record) = rx.recv() {
                    if let Err(err) = insert(&writer_db, &record, max_logs) {
                        warn!("Failed to write request log {}: {err}", record.id);
                    }
                }
                debug!("Request log writer shutting down");
            })
            .map_err(|e| Error::internal(format!("spawn log writer: {e}")))?;

        Ok(Self { db, tx })
    }
}

impl RequestSink for SqliteRequestLogger {
    fn record(&self, record: RequestRecord) {
        // Receiver only goes away on shutdown; drop the record then.
        let _ = self.tx.send(record);
    }
}

fn insert(db: &Arc<Mutex<Connection>>, record: &RequestRecord, max_logs: usize) -> Result<()> {
    let conn = db.lock().unwrap();
    conn.execute(
        "INSERT OR REPLACE INTO request_logs (
            id, timestamp, service, method, path, status_code, duration_ms,
            success, error_message, config_name, target_url, stripped_blocks,
            request_body, response_body,
            prompt_tokens, completion_tokens, total_tokens,
            cache_creation_input_tokens, cache_read_input_tokens, model
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                  ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            record.id,
            record.timestamp.to_rfc3339(),
            record.service,
            record.method,
            record.path,
            record.status_code as i64,
            record.duration_ms as i64,
            record.success,
            record.error_message,
            record.config_name,
            record.target_url,
            record.stripped_blocks as i64,
            record.request_body,
            record.response_body,
            record.usage.as_ref().map(|u| u.prompt_tokens as i64),
            record.usage.as_ref().map(|u| u.completion_tokens as i64),
            record.usage.as_ref().map(|u| u.total_tokens as i64),
            record.usage.as_ref().and_then(|u| u.cache_creation_input_tokens.map(|v| v as i64)),
            record.usage.as_ref().and_then(|u| u.cache_read_input_tokens.map(|v| v as i64)),
            record.usage.as_ref().map(|u| u.model.clone()),
        ],
    )
    .map_err(sql_err)?;

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM request_logs", [], |row| row.get(0))
        .map_err(sql_err)?;
    if count > max_logs as i64 {
        let excess = count - max_logs as i64;
        conn.execute(
            "DELETE FROM request_logs WHERE id IN (
                SELECT id FROM request_logs ORDER BY timestamp ASC LIMIT ?1
            )",
            params![excess],
        )
        .map_err(sql_err)?;
        debug!("Pruned {excess} old request log entries");
    }

    Ok(())
}

impl RequestLogReader for SqliteRequestLogger {
    fn logs(&self, limit: usize, offset: usize, service: Option<&str>) -> Result<Vec<RequestRecord>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, service, method, path, status_code, duration_ms,
                        success, error_message, config_name, target_url, stripped_blocks,
                        request_body, response_body,
                        prompt_tokens, completion_tokens, total_tokens,
                        cache_creation_input_tokens, cache_read_input_tokens, model
                 FROM request_logs
                 WHERE ?3 IS NULL OR service = ?3
                 ORDER BY timestamp DESC
                 LIMIT ?1 OFFSET ?2",
            )
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![limit as i64, offset as i64, service], row_to_record)
            .map_err(sql_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(rows)
    }

    fn log_by_id(&self, id: &str) -> Result<Option<RequestRecord>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, service, method, path, status_code, duration_ms,
                        success, error_message, config_name, target_url, stripped_blocks,
                        request_body, response_body,
                        prompt_tokens, completion_tokens, total_tokens,
                        cache_creation_input_tokens, cache_read_input_tokens, model
                 FROM request_logs
                 WHERE id = ?1",
            )
            .map_err(sql_err)?;
        stmt.query_row(params![id], row_to_record)
            .optional()
            .map_err(sql_err)
    }

    fn clear(&self) -> Result<()> {
        let conn = self.db.lock().unwrap();
        conn.execute("DELETE FROM request_logs", []).map_err(sql_err)?;
        Ok(())
    }

    fn stats(&self) -> Result<LogStats> {
        let conn = self.db.lock().unwrap();
        let (total, success, avg_duration, prompt, completion, total_tokens): (
            i64,
            i64,
            f64,
            i64,
            i64,
            i64,
        ) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(success), 0),
                        COALESCE(AVG(duration_ms), 0),
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        COALESCE(SUM(total_tokens), 0)
                 FROM request_logs",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .map_err(sql_err)?;

        let mut per_service = std::collections::HashMap::new();
        let mut stmt = conn
            .prepare("SELECT service, COUNT(*) FROM request_logs GROUP BY service")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(sql_err)?;
        for row in rows {
            let (service, count) = row.map_err(sql_err)?;
            per_service.insert(service, count as u64);
        }

        Ok(LogStats {
            total_requests: total as u64,
            success_count: success as u64,
            failure_count: (total - success) as u64,
            avg_duration_ms: avg_duration.round() as u64,
            per_service,
            total_prompt_tokens: prompt as u64,
            total_completion_tokens: completion as u64,
            total_tokens: total_tokens as u64,
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRecord> {
    let timestamp_str: String = row.get(1)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let usage = match (
        row.get::<_, Option<i64>>(14)?,
        row.get::<_, Option<i64>>(15)?,
        row.get::<_, Option<i64>>(16)?,
        row.get::<_, Option<String>>(19)?,
    ) {
        (Some(prompt), Some(completion), Some(total), model) => Some(UsageMetrics {
            prompt_tokens: prompt as u64,
            completion_tokens: completion as u64,
            total_tokens: total as u64,
            cache_creation_input_tokens: row.get::<_, Option<i64>>(17)?.map(|v| v as u64),
            cache_read_input_tokens: row.get::<_, Option<i64>>(18)?.map(|v| v as u64),
            model: model.unwrap_or_default(),
        }),
        _ => None,
    };

    Ok(RequestRecord {
        id: row.get(0)?,
        timestamp,
        service: row.get(2)?,
        method: row.get(3)?,
        path: row.get(4)?,
        status_code: row.get::<_, i64>(5)? as u16,
        duration_ms: row.get::<_, i64>(6)? as u64,
        success: row.get(7)?,
        error_message: row.get(8)?,
        config_name: row.get(9)?,
        target_url: row.get(10)?,
        stripped_blocks: row.get::<_, i64>(11)? as u32,
        request_body: row.get(12)?,
        response_body: row.get(13)?,
        usage,
    })
}

fn sql_err(err: rusqlite::Error) -> Error {
    Error::internal(format!("sqlite error: {err}"))
}
