// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Database module for persistent storage

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{DatabaseConfig, MachineConfig};
use crate::core::{MachineState, StoreSnapshot, TransitionCommit, TransitionStore, UsageSession};
use crate::sensors::SensorSample;

/// Fixed-width RFC 3339 so text ordering matches time ordering. Full
/// nanoseconds, since stored durations are derived from these instants.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp {:?} in database", value))?
        .with_timezone(&Utc))
}

/// Database manager
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)
            .with_context(|| format!("opening database {:?}", config.path))?;

        // Configure SQLite for performance
        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        "#)?;

        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.create_tables()?;

        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self { conn: Arc::new(Mutex::new(Connection::open_in_memory()?)) };
        db.create_tables()?;
        Ok(db)
    }

    /// Create database tables
    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS machines (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                is_running INTEGER NOT NULL DEFAULT 0,
                last_transition_at TEXT
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY,
                machine_id INTEGER NOT NULL REFERENCES machines(id),
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_machine ON sessions(machine_id, start_time);
            CREATE INDEX IF NOT EXISTS idx_sessions_end ON sessions(end_time);

            -- Raw sample audit trail
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                ax REAL NOT NULL,
                ay REAL NOT NULL,
                az REAL NOT NULL,
                magnitude REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(timestamp);
        "#)?;

        Ok(())
    }

    /// Insert rows for configured machines that have none yet. Existing rows
    /// keep their state.
    pub fn ensure_machines(&self, config: &MachineConfig) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for id in 1..=config.count {
            tx.execute(
                "INSERT OR IGNORE INTO machines (id, name, is_running) VALUES (?1, ?2, 0)",
                params![id as i64, format!("{} {}", config.name_prefix, id)],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Every machine and every stored session, for rebuilding the engine
    pub fn load_snapshot(&self) -> Result<StoreSnapshot> {
        let machines = self.load_machines()?;
        let sessions = self.query_sessions(None)?;

        debug!("Loaded {} machines and {} sessions", machines.len(), sessions.len());
        Ok(StoreSnapshot { machines, sessions })
    }

    pub fn load_machines(&self) -> Result<Vec<MachineState>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, name, is_running, last_transition_at FROM machines ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut machines = Vec::new();
        for row in rows {
            let (id, name, is_running, last) = row?;
            machines.push(MachineState {
                machine_id: id as u32,
                name,
                is_running,
                last_transition_at: last.as_deref().map(parse_ts).transpose()?,
            });
        }

        Ok(machines)
    }

    /// Sessions that started at or after `since` (all of them for `None`),
    /// oldest first
    pub fn query_sessions(&self, since: Option<DateTime<Utc>>) -> Result<Vec<UsageSession>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"SELECT id, machine_id, start_time, end_time, duration FROM sessions
               WHERE ?1 IS NULL OR start_time >= ?1
               ORDER BY start_time, id"#,
        )?;
        let rows = stmt.query_map(params![since.map(ts)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, machine_id, start, end, duration) = row?;
            sessions.push(UsageSession {
                id: id as u64,
                machine_id: machine_id as u32,
                start_time: parse_ts(&start)?,
                end_time: end.as_deref().map(parse_ts).transpose()?,
                duration_secs: duration,
            });
        }

        Ok(sessions)
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.conn.lock();

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let size_bytes: i64 = conn.query_row(
            "SELECT page_count * page_size as size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        ).unwrap_or(0);

        Ok(DatabaseStats {
            machine_count: count("SELECT COUNT(*) FROM machines")?,
            session_count: count("SELECT COUNT(*) FROM sessions")?,
            open_session_count: count("SELECT COUNT(*) FROM sessions WHERE end_time IS NULL")?,
            reading_count: count("SELECT COUNT(*) FROM readings")?,
            size_bytes: size_bytes as u64,
        })
    }

    /// Delete closed sessions and readings older than the retention window.
    /// Open sessions are never removed.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        self.cleanup_before(cutoff)
    }

    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();

        let deleted_sessions = conn.execute(
            "DELETE FROM sessions WHERE end_time IS NOT NULL AND end_time < ?1",
            params![ts(cutoff)],
        )?;

        let deleted_readings = conn.execute(
            "DELETE FROM readings WHERE timestamp < ?1",
            params![ts(cutoff)],
        )?;

        if deleted_sessions + deleted_readings > 0 {
            // Vacuum to reclaim space
            conn.execute("VACUUM", [])?;
        }

        info!("Cleaned up {} sessions and {} readings older than {}",
            deleted_sessions, deleted_readings, cutoff);

        Ok(deleted_sessions + deleted_readings)
    }
}

impl TransitionStore for Database {
    fn persist(&self, commit: &TransitionCommit) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for session in commit.closed.iter().chain(commit.opened.iter()) {
            tx.execute(
                r#"INSERT INTO sessions (id, machine_id, start_time, end_time, duration)
                   VALUES (?1, ?2, ?3, ?4, ?5)
                   ON CONFLICT(id) DO UPDATE SET end_time = excluded.end_time, duration = excluded.duration"#,
                params![
                    session.id as i64,
                    session.machine_id as i64,
                    ts(session.start_time),
                    session.end_time.map(ts),
                    session.duration_secs,
                ],
            )?;
        }

        let machine = &commit.machine;
        tx.execute(
            r#"INSERT INTO machines (id, name, is_running, last_transition_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(id) DO UPDATE SET
                   is_running = excluded.is_running,
                   last_transition_at = excluded.last_transition_at"#,
            params![
                machine.machine_id as i64,
                machine.name,
                machine.is_running,
                machine.last_transition_at.map(ts),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn record_reading(&self, sample: &SensorSample, magnitude: f64) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO readings (machine_id, timestamp, ax, ay, az, magnitude) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.machine_id as i64,
                ts(sample.observed_at),
                sample.ax,
                sample.ay,
                sample.az,
                magnitude
            ],
        )?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub machine_count: usize,
    pub session_count: usize,
    pub open_session_count: usize,
    pub reading_count: usize,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventBus, TransitionEngine, TransitionResult};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn machines() -> MachineConfig {
        MachineConfig::default()
    }

    fn running(id: u32, since: i64) -> MachineState {
        MachineState {
            machine_id: id,
            name: format!("Machine {}", id),
            is_running: true,
            last_transition_at: Some(at(since)),
        }
    }

    #[test]
    fn test_ensure_machines_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_machines(&machines()).unwrap();

        db.persist(&TransitionCommit {
            machine: running(2, 0),
            closed: None,
            opened: Some(UsageSession::opened(1, 2, at(0))),
        })
        .unwrap();
        db.ensure_machines(&machines()).unwrap();

        let snapshot = db.load_snapshot().unwrap();
        assert_eq!(snapshot.machines.len(), 4);
        assert_eq!(snapshot.machines[0].name, "Machine 1");
        assert!(snapshot.machines[1].is_running);
        assert_eq!(snapshot.machines[1].last_transition_at, Some(at(0)));
    }

    #[test]
    fn test_persist_open_then_close() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_machines(&machines()).unwrap();

        let opened = UsageSession::opened(7, 3, at(0));
        db.persist(&TransitionCommit {
            machine: running(3, 0),
            closed: None,
            opened: Some(opened.clone()),
        })
        .unwrap();
        assert_eq!(db.query_sessions(None).unwrap(), vec![opened.clone()]);

        let closed = opened.closed_at(at(1800)).session;
        let mut idle = running(3, 1800);
        idle.is_running = false;
        db.persist(&TransitionCommit {
            machine: idle,
            closed: Some(closed.clone()),
            opened: None,
        })
        .unwrap();

        let snapshot = db.load_snapshot().unwrap();
        assert_eq!(snapshot.sessions, vec![closed]);
        assert!(!snapshot.machines[2].is_running);

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.session_count, 1);
        assert_eq!(stats.open_session_count, 0);
    }

    #[test]
    fn test_restart_restores_engine_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("spinwatch.db"),
            ..DatabaseConfig::default()
        };

        let open_id = {
            let db = Arc::new(Database::open(&config).unwrap());
            db.ensure_machines(&machines()).unwrap();
            let engine = TransitionEngine::restore(
                &machines(),
                db.clone(),
                Arc::new(EventBus::default()),
                db.load_snapshot().unwrap(),
            )
            .unwrap();

            engine.ingest(SensorSample::new(1, 3000.0, 0.0, 0.0, at(0))).unwrap();
            engine.ingest(SensorSample::new(1, 0.0, 0.0, 0.0, at(600))).unwrap();
            let report = engine.ingest(SensorSample::new(2, 0.0, 3000.0, 0.0, at(700))).unwrap();
            match report.outcome {
                TransitionResult::StartedSession(session) => session.id,
                other => panic!("expected start, got {:?}", other),
            }
        };

        let db = Arc::new(Database::open(&config).unwrap());
        let engine = TransitionEngine::restore(
            &machines(),
            db.clone(),
            Arc::new(EventBus::default()),
            db.load_snapshot().unwrap(),
        )
        .unwrap();

        assert!(!engine.current_state(1).unwrap().is_running);
        assert!(engine.current_state(2).unwrap().is_running);
        assert_eq!(engine.session_history(1, None).unwrap()[0].duration_secs, Some(600));

        let open = engine.open_sessions_snapshot();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, open_id);

        // New sessions never reuse a stored id
        let report = engine.ingest(SensorSample::new(3, 3000.0, 0.0, 0.0, at(800))).unwrap();
        match report.outcome {
            TransitionResult::StartedSession(session) => assert!(session.id > open_id),
            other => panic!("expected start, got {:?}", other),
        }

        // Stopping the restored session closes the stored row
        engine.ingest(SensorSample::new(2, 0.0, 0.0, 0.0, at(1000))).unwrap();
        let stored = db.query_sessions(Some(at(700))).unwrap();
        assert_eq!(stored[0].id, open_id);
        assert_eq!(stored[0].duration_secs, Some(300));
    }

    #[test]
    fn test_cleanup_keeps_open_sessions() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_machines(&machines()).unwrap();

        let old = UsageSession::opened(1, 1, at(0)).closed_at(at(60)).session;
        let mut idle = running(1, 60);
        idle.is_running = false;
        db.persist(&TransitionCommit { machine: idle, closed: Some(old), opened: None }).unwrap();
        db.persist(&TransitionCommit {
            machine: running(2, 10),
            closed: None,
            opened: Some(UsageSession::opened(2, 2, at(10))),
        })
        .unwrap();
        db.record_reading(&SensorSample::new(1, 1.0, 2.0, 2.0, at(5)), 3.0).unwrap();

        let deleted = db.cleanup_before(at(1000)).unwrap();
        assert_eq!(deleted, 2);

        let snapshot = db.load_snapshot().unwrap();
        assert_eq!(snapshot.sessions.len(), 1);
        assert!(snapshot.sessions[0].is_open());
        assert_eq!(db.get_stats().unwrap().reading_count, 0);
    }

    #[test]
    fn test_query_sessions_since() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_machines(&machines()).unwrap();

        for (id, start) in [(1u64, 0i64), (2, 5000), (3, 9000)] {
            let session = UsageSession::opened(id, 1, at(start)).closed_at(at(start + 100)).session;
            let mut idle = running(1, start + 100);
            idle.is_running = false;
            db.persist(&TransitionCommit { machine: idle, closed: Some(session), opened: None }).unwrap();
        }

        let recent = db.query_sessions(Some(at(4000))).unwrap();
        let ids: Vec<u64> = recent.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_sub_millisecond_instants_keep_duration_exact() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.ensure_machines(&machines()).unwrap();
        let engine = TransitionEngine::restore(
            &machines(),
            db.clone(),
            Arc::new(EventBus::default()),
            db.load_snapshot().unwrap(),
        )
        .unwrap();

        let start = at(10) + chrono::Duration::nanoseconds(999_600_000);
        let end = at(20) + chrono::Duration::nanoseconds(999_000_200);
        engine.ingest(SensorSample::new(1, 3000.0, 0.0, 0.0, start)).unwrap();
        engine.ingest(SensorSample::new(1, 0.0, 0.0, 0.0, end)).unwrap();

        let snapshot = db.load_snapshot().unwrap();
        let stored = &snapshot.sessions[0];
        assert_eq!(stored.start_time, start);
        assert_eq!(stored.end_time, Some(end));
        assert_eq!(stored.duration_secs, Some((end - start).num_seconds()));
        assert_eq!(snapshot.machines[0].last_transition_at, Some(end));

        // A restarted engine still pins samples against the exact instant
        let restored = TransitionEngine::restore(
            &machines(),
            db.clone(),
            Arc::new(EventBus::default()),
            snapshot,
        )
        .unwrap();
        let report = restored
            .ingest(SensorSample::new(1, 3000.0, 0.0, 0.0, end - chrono::Duration::nanoseconds(100)))
            .unwrap();
        match report.outcome {
            TransitionResult::StartedSession(session) => assert_eq!(session.start_time, end),
            other => panic!("expected start, got {:?}", other),
        }
    }
}
