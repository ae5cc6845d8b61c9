//! SQLite-backed history of completed attempts.
//! Each attempt is written once at completion; events are stored alongside.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use pacer_core::{
    AssignedParams, Attempt, AttemptState, Channel, HistorySink, PacerError, RecordingEntry, Result,
    Role, TranscriptEvent, apply_recording,
};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

/// One row of the history listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub sid: String,
    pub channel: Channel,
    pub destination: String,
    pub state: AttemptState,
    pub provider_status: Option<String>,
    pub placed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub event_count: u32,
}

/// Aggregates over a channel's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryMetrics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_duration_secs: u64,
    pub avg_duration_secs: f64,
}

/// SQLite persistence store for attempt history.
pub struct HistoryDb {
    conn: Mutex<rusqlite::Connection>,
}

impl HistoryDb {
    /// Open or create the history database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| PacerError::Storage(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| PacerError::Storage(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS attempts (
                sid TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                destination TEXT,
                origin TEXT,
                state TEXT NOT NULL,
                provider_status TEXT,
                placed_at TEXT,
                completed_at TEXT,
                duration_secs INTEGER,
                params_json TEXT,
                recordings_json TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attempt_events (
                sid TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                is_final INTEGER NOT NULL,
                at TEXT NOT NULL,
                PRIMARY KEY (sid, seq),
                FOREIGN KEY (sid) REFERENCES attempts(sid) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_channel
                ON attempts(channel, completed_at);

            CREATE TABLE IF NOT EXISTS operator_messages (
                position INTEGER PRIMARY KEY,
                text TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| PacerError::Storage(format!("Migration: {e}")))?;
        self.add_column_if_missing("attempts", "recordings_json", "TEXT")
    }

    /// Databases created before a column existed get it added in place.
    fn add_column_if_missing(&self, table: &str, column: &str, decl: &str) -> Result<()> {
        let conn = self.conn();
        let present: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?1"),
                params![column],
                |row| row.get(0),
            )
            .map_err(|e| PacerError::Storage(format!("Migration: {e}")))?;
        if present == 0 {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])
                .map_err(|e| PacerError::Storage(format!("Migration: {e}")))?;
            tracing::info!("💾 History DB: added {table}.{column}");
        }
        Ok(())
    }

    /// Upsert an attempt and its events. Existing non-null columns keep their value,
    /// except the terminal fields which always take the newest write.
    pub fn save(&self, attempt: &Attempt) -> Result<()> {
        let params_json = attempt
            .params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let recordings_json = if attempt.recordings.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&attempt.recordings)?)
        };
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| PacerError::Storage(format!("Begin: {e}")))?;
        tx.execute(
            "INSERT INTO attempts
                 (sid, channel, destination, origin, state, provider_status, placed_at,
                  completed_at, duration_secs, params_json, recordings_json, created_at)
             VALUES (?1, ?2, NULLIF(?3, ''), NULLIF(?4, ''), ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(sid) DO UPDATE SET
                 destination = COALESCE(attempts.destination, excluded.destination),
                 origin = COALESCE(attempts.origin, excluded.origin),
                 placed_at = COALESCE(attempts.placed_at, excluded.placed_at),
                 params_json = COALESCE(attempts.params_json, excluded.params_json),
                 recordings_json = COALESCE(excluded.recordings_json, attempts.recordings_json),
                 duration_secs = COALESCE(excluded.duration_secs, attempts.duration_secs),
                 state = excluded.state,
                 provider_status = COALESCE(excluded.provider_status, attempts.provider_status),
                 completed_at = COALESCE(excluded.completed_at, attempts.completed_at)",
            params![
                attempt.sid,
                attempt.channel.as_str(),
                attempt.destination,
                attempt.origin,
                attempt.state.as_str(),
                attempt.provider_status,
                attempt.placed_at.map(|t| t.to_rfc3339()),
                attempt.completed_at.map(|t| t.to_rfc3339()),
                attempt.duration_secs.map(|d| d as i64),
                params_json,
                recordings_json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| PacerError::Storage(format!("Save attempt: {e}")))?;

        for event in &attempt.events {
            tx.execute(
                "INSERT OR REPLACE INTO attempt_events (sid, seq, role, text, is_final, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attempt.sid,
                    event.seq as i64,
                    event.role.as_str(),
                    event.text,
                    event.is_final as i32,
                    event.at.to_rfc3339(),
                ],
            )
            .map_err(|e| PacerError::Storage(format!("Save event: {e}")))?;
        }
        tx.commit()
            .map_err(|e| PacerError::Storage(format!("Commit: {e}")))?;
        Ok(())
    }

    /// Load one attempt with its events.
    pub fn load(&self, sid: &str) -> Result<Option<Attempt>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT sid, channel, destination, origin, state, provider_status, placed_at,
                        completed_at, duration_secs, params_json, recordings_json
                 FROM attempts WHERE sid = ?1",
                params![sid],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| PacerError::Storage(format!("Load attempt: {e}")))?;

        let Some((sid, channel, dest, origin, state, status, placed, completed, dur, pjson, rjson)) =
            row
        else {
            return Ok(None);
        };

        let params: Option<AssignedParams> = match pjson {
            Some(j) => Some(serde_json::from_str(&j)?),
            None => None,
        };
        let recordings: Vec<RecordingEntry> = match rjson {
            Some(j) => serde_json::from_str(&j)?,
            None => Vec::new(),
        };

        let mut stmt = conn
            .prepare(
                "SELECT seq, role, text, is_final, at FROM attempt_events
                 WHERE sid = ?1 ORDER BY seq",
            )
            .map_err(|e| PacerError::Storage(format!("Prepare: {e}")))?;
        let events = stmt
            .query_map(params![sid], |row| {
                Ok(TranscriptEvent {
                    seq: row.get::<_, i64>(0)? as u64,
                    role: Role::parse(&row.get::<_, String>(1)?),
                    text: row.get(2)?,
                    is_final: row.get::<_, i32>(3)? != 0,
                    at: parse_ts(Some(row.get::<_, String>(4)?)).unwrap_or_default(),
                })
            })
            .map_err(|e| PacerError::Storage(format!("Query events: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(Attempt {
            channel: channel.parse()?,
            sid,
            destination: dest.unwrap_or_default(),
            origin: origin.unwrap_or_default(),
            state: parse_state(&state),
            placed_at: parse_ts(placed),
            completed_at: parse_ts(completed),
            duration_secs: dur.map(|d| d.max(0) as u64),
            provider_status: status,
            params,
            events,
            recordings,
        }))
    }

    /// Merge a recording status into a stored attempt.
    pub fn note_recording(
        &self,
        sid: &str,
        recording_sid: &str,
        status: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        let stored = conn
            .query_row(
                "SELECT recordings_json FROM attempts WHERE sid = ?1",
                params![sid],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(|e| PacerError::Storage(format!("Load recordings: {e}")))?;
        let Some(raw) = stored else {
            return Ok(false);
        };
        let mut recordings: Vec<RecordingEntry> = match raw {
            Some(j) => serde_json::from_str(&j)?,
            None => Vec::new(),
        };
        if !apply_recording(&mut recordings, recording_sid, status, at) {
            return Ok(false);
        }
        conn.execute(
            "UPDATE attempts SET recordings_json = ?2 WHERE sid = ?1",
            params![sid, serde_json::to_string(&recordings)?],
        )
        .map_err(|e| PacerError::Storage(format!("Save recordings: {e}")))?;
        Ok(true)
    }

    /// Operator message pool, in stored order.
    pub fn load_messages(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT text FROM operator_messages ORDER BY position")
            .map_err(|e| PacerError::Storage(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| PacerError::Storage(format!("Query messages: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Replace the stored message pool.
    pub fn save_messages(&self, messages: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| PacerError::Storage(format!("Begin: {e}")))?;
        tx.execute("DELETE FROM operator_messages", [])
            .map_err(|e| PacerError::Storage(format!("Clear messages: {e}")))?;
        for (i, text) in messages.iter().enumerate() {
            tx.execute(
                "INSERT INTO operator_messages (position, text) VALUES (?1, ?2)",
                params![i as i64, text],
            )
            .map_err(|e| PacerError::Storage(format!("Save message: {e}")))?;
        }
        tx.commit()
            .map_err(|e| PacerError::Storage(format!("Commit: {e}")))?;
        Ok(())
    }

    /// Most recent attempts for a channel, newest first.
    pub fn list(&self, channel: Channel, limit: usize) -> Result<Vec<AttemptSummary>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT a.sid, a.destination, a.state, a.provider_status, a.placed_at,
                        a.completed_at, a.duration_secs,
                        (SELECT COUNT(*) FROM attempt_events e WHERE e.sid = a.sid)
                 FROM attempts a
                 WHERE a.channel = ?1
                 ORDER BY COALESCE(a.completed_at, a.created_at) DESC
                 LIMIT ?2",
            )
            .map_err(|e| PacerError::Storage(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![channel.as_str(), limit as i64], |row| {
                Ok(AttemptSummary {
                    sid: row.get(0)?,
                    channel,
                    destination: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    state: parse_state(&row.get::<_, String>(2)?),
                    provider_status: row.get(3)?,
                    placed_at: parse_ts(row.get(4)?),
                    completed_at: parse_ts(row.get(5)?),
                    duration_secs: row.get::<_, Option<i64>>(6)?.map(|d| d.max(0) as u64),
                    event_count: row.get::<_, i64>(7)? as u32,
                })
            })
            .map_err(|e| PacerError::Storage(format!("Query: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Totals and average duration for a channel.
    pub fn metrics(&self, channel: Channel) -> Result<HistoryMetrics> {
        let conn = self.conn();
        let (total, completed, failed, duration, timed) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(state = 'completed'), 0),
                        COALESCE(SUM(state = 'failed'), 0),
                        COALESCE(SUM(duration_secs), 0),
                        COUNT(duration_secs)
                 FROM attempts WHERE channel = ?1",
                params![channel.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .map_err(|e| PacerError::Storage(format!("Metrics: {e}")))?;
        let avg = if timed > 0 { duration as f64 / timed as f64 } else { 0.0 };
        Ok(HistoryMetrics {
            total: total as u64,
            completed: completed as u64,
            failed: failed as u64,
            total_duration_secs: duration as u64,
            avg_duration_secs: (avg * 10.0).round() / 10.0,
        })
    }
}

impl HistorySink for HistoryDb {
    fn persist(&self, attempt: &Attempt) -> Result<()> {
        self.save(attempt)
    }

    fn persist_recording(
        &self,
        sid: &str,
        recording_sid: &str,
        status: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.note_recording(sid, recording_sid, status, at)
    }
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn parse_state(s: &str) -> AttemptState {
    match s {
        "pending_placement" => AttemptState::PendingPlacement,
        "in_flight" => AttemptState::InFlight,
        "completed" => AttemptState::Completed,
        _ => AttemptState::Failed,
    }
}
