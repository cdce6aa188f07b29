use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pipeline::EngineEvent;
use crate::presence::PresenceInterval;
use crate::validation::Observation;

/// Durable observation log and presence history
pub struct Database {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct DeviceLog {
    pub id: i64,
    pub device_address: String,
    pub anchor_id: String,
    pub rssi: i32,
    pub timestamp: i64,
    pub is_asset: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub log_count: usize,
    pub device_count: usize,
    pub asset_log_count: usize,
    pub presence_count: usize,
    pub open_presence_count: usize,
    pub first_log: Option<i64>,
    pub last_log: Option<i64>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database: {:?}", path.as_ref()))?;

        let db = Database { conn };
        db.initialize()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS device_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_address TEXT NOT NULL,
                anchor_id TEXT NOT NULL,
                rssi INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                is_asset INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS presences (
                id INTEGER PRIMARY KEY,
                asset_id INTEGER NOT NULL,
                room_id INTEGER NOT NULL,
                entered_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                exited_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_device_logs_address ON device_logs(device_address);
            CREATE INDEX IF NOT EXISTS idx_device_logs_timestamp ON device_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_presences_asset ON presences(asset_id);
            CREATE INDEX IF NOT EXISTS idx_presences_open ON presences(exited_at);
            "#,
        )?;

        Ok(())
    }

    pub fn insert_observation(&self, observation: &Observation, is_asset: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO device_logs (device_address, anchor_id, rssi, timestamp, is_asset)
             VALUES (?, ?, ?, ?, ?)",
            params![
                &observation.device_address,
                &observation.anchor_id,
                observation.signal_strength,
                observation.timestamp.timestamp_millis(),
                is_asset,
            ],
        )?;
        Ok(())
    }

    /// Insert or overwrite an interval, keyed by its tracker id
    pub fn upsert_presence(&self, interval: &PresenceInterval) -> Result<()> {
        self.conn.execute(
            "INSERT INTO presences (id, asset_id, room_id, entered_at, last_seen_at, exited_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                entered_at = excluded.entered_at,
                last_seen_at = excluded.last_seen_at,
                exited_at = excluded.exited_at",
            params![
                interval.id as i64,
                interval.asset_id,
                interval.room_id,
                interval.entered_at.timestamp_millis(),
                interval.last_seen_at.timestamp_millis(),
                interval.exited_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// Persist the parts of an engine event that belong in the log store
    pub fn record(&self, event: &EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Observed {
                observation,
                is_asset,
            } => self.insert_observation(observation, *is_asset),
            EngineEvent::PresenceOpened(interval)
            | EngineEvent::PresenceUpdated(interval)
            | EngineEvent::PresenceClosed(interval) => self.upsert_presence(interval),
            EngineEvent::PresenceConflict { .. } | EngineEvent::PositionUpdated(_) => Ok(()),
        }
    }

    pub fn get_presence(&self, id: u64) -> Result<Option<PresenceInterval>> {
        let interval = self
            .conn
            .query_row(
                "SELECT id, asset_id, room_id, entered_at, last_seen_at, exited_at
                 FROM presences WHERE id = ?",
                params![id as i64],
                row_to_presence,
            )
            .optional()?;
        Ok(interval)
    }

    pub fn get_open_presences(&self) -> Result<Vec<PresenceInterval>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, asset_id, room_id, entered_at, last_seen_at, exited_at
             FROM presences WHERE exited_at IS NULL
             ORDER BY asset_id, room_id",
        )?;

        let intervals = stmt
            .query_map([], row_to_presence)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(intervals)
    }

    pub fn get_presences_in_time_range(&self, start: i64, end: i64) -> Result<Vec<PresenceInterval>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, asset_id, room_id, entered_at, last_seen_at, exited_at
             FROM presences WHERE last_seen_at >= ? AND entered_at <= ?
             ORDER BY entered_at DESC",
        )?;

        let intervals = stmt
            .query_map(params![start, end], row_to_presence)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(intervals)
    }

    pub fn get_logs_for_device(&self, device_address: &str, limit: usize) -> Result<Vec<DeviceLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_address, anchor_id, rssi, timestamp, is_asset
             FROM device_logs WHERE device_address = ?
             ORDER BY timestamp DESC LIMIT ?",
        )?;

        let logs = stmt
            .query_map(params![device_address, limit as i64], |row| {
                Ok(DeviceLog {
                    id: row.get(0)?,
                    device_address: row.get(1)?,
                    anchor_id: row.get(2)?,
                    rssi: row.get(3)?,
                    timestamp: row.get(4)?,
                    is_asset: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(logs)
    }

    pub fn stats(&self) -> Result<LogStats> {
        let (log_count, device_count, asset_log_count, first_log, last_log): (
            i64,
            i64,
            i64,
            Option<i64>,
            Option<i64>,
        ) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT device_address), COALESCE(SUM(is_asset), 0),
                    MIN(timestamp), MAX(timestamp)
             FROM device_logs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let (presence_count, open_presence_count): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(*) - COUNT(exited_at) FROM presences",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(LogStats {
            log_count: log_count as usize,
            device_count: device_count as usize,
            asset_log_count: asset_log_count as usize,
            presence_count: presence_count as usize,
            open_presence_count: open_presence_count as usize,
            first_log,
            last_log,
        })
    }
}

fn row_to_presence(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresenceInterval> {
    let id: i64 = row.get(0)?;
    let exited_at: Option<i64> = row.get(5)?;
    Ok(PresenceInterval {
        id: id as u64,
        asset_id: row.get(1)?,
        room_id: row.get(2)?,
        entered_at: millis_to_datetime(row.get(3)?),
        last_seen_at: millis_to_datetime(row.get(4)?),
        exited_at: exited_at.map(millis_to_datetime),
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Drains engine events into the log store off the ingestion path
pub struct LogWriter;

impl LogWriter {
    /// Spawn a blocking task that owns `db` and records every event received
    /// on `rx` until the channel closes. Returns the number of events written.
    pub fn spawn(db: Database, mut rx: mpsc::Receiver<EngineEvent>) -> JoinHandle<usize> {
        tokio::task::spawn_blocking(move || {
            info!("Log writer started");
            let mut written = 0usize;

            while let Some(event) = rx.blocking_recv() {
                match db.record(&event) {
                    Ok(()) => written += 1,
                    Err(e) => error!("Failed to persist event: {}", e),
                }
            }

            debug!("Log writer channel closed");
            info!("Log writer stopped after {} events", written);
            written
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() + Duration::seconds(secs)
    }

    fn interval(exited_at: Option<DateTime<Utc>>) -> PresenceInterval {
        PresenceInterval {
            id: 7,
            asset_id: 1,
            room_id: 2,
            entered_at: t(0),
            last_seen_at: t(10),
            exited_at,
        }
    }

    #[test]
    fn test_presence_upsert() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_presence(&interval(None)).unwrap();
        assert_eq!(db.get_open_presences().unwrap().len(), 1);

        db.upsert_presence(&interval(Some(t(70)))).unwrap();
        assert!(db.get_open_presences().unwrap().is_empty());

        let stored = db.get_presence(7).unwrap().unwrap();
        assert_eq!(stored, interval(Some(t(70))));

        let stats = db.stats().unwrap();
        assert_eq!(stats.presence_count, 1);
        assert_eq!(stats.open_presence_count, 0);
        assert_eq!(
            db.get_presences_in_time_range(t(5).timestamp_millis(), t(6).timestamp_millis())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_observation_log() {
        let db = Database::open_in_memory().unwrap();
        let observation = Observation {
            anchor_id: "B8:27:EB:00:00:01".to_string(),
            device_address: "AA:BB:CC:00:00:01".to_string(),
            signal_strength: -61,
            timestamp: t(3),
        };
        db.record(&EngineEvent::Observed {
            observation: observation.clone(),
            is_asset: true,
        })
        .unwrap();
        db.insert_observation(&observation, true).unwrap();

        let logs = db.get_logs_for_device("AA:BB:CC:00:00:01", 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].rssi, -61);
        assert!(logs[0].is_asset);

        let stats = db.stats().unwrap();
        assert_eq!(stats.log_count, 2);
        assert_eq!(stats.device_count, 1);
        assert_eq!(stats.asset_log_count, 2);
        assert_eq!(stats.first_log, Some(t(3).timestamp_millis()));
    }

    #[test]
    fn test_empty_stats() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.log_count, 0);
        assert_eq!(stats.first_log, None);
    }

    #[tokio::test]
    async fn test_log_writer_drains_channel() {
        let db = Database::open_in_memory().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let handle = LogWriter::spawn(db, rx);

        tx.send(EngineEvent::PresenceOpened(interval(None))).await.unwrap();
        tx.send(EngineEvent::PresenceConflict {
            asset_id: 1,
            rooms: vec![1, 2],
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), 2);
    }
}
