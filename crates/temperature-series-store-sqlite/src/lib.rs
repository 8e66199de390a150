use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use temperature_series_core::{Reading, TimeWindow};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS temperature_readings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  device_id TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  temperature REAL NOT NULL,
  is_alarm INTEGER NOT NULL DEFAULT 0 CHECK (is_alarm IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_temperature_readings_device_timestamp
  ON temperature_readings(device_id, timestamp);
";

const READING_COLUMNS: &str = "device_id, timestamp, temperature, is_alarm";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

/// Overall extent of one device's readings, independent of any window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSpan {
    pub device_id: String,
    pub total_count: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed reading store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            // also adopts a pre-existing temperature_readings table
            apply_migration_1(&self.conn)?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Single-row existence check for any reading of `device_id`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn device_exists(&self, device_id: &str) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM temperature_readings WHERE device_id = ?1 LIMIT 1)",
                params![device_id],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to check device {device_id}"))?;
        Ok(exists == 1)
    }

    /// Count readings of `device_id` inside `window`, bounds inclusive.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn count_readings(&self, device_id: &str, window: TimeWindow) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM temperature_readings
                 WHERE device_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
                params![device_id, window.from, window.to],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to count readings for {device_id} in {window}"))?;
        u64::try_from(count).context("sqlite returned a negative count")
    }

    /// Every `sampling_rate`-th reading in timestamp order, starting with the first.
    ///
    /// # Errors
    /// Returns an error when `sampling_rate` is zero or the query fails.
    pub fn sample_readings(
        &self,
        device_id: &str,
        window: TimeWindow,
        sampling_rate: u64,
    ) -> Result<Vec<Reading>> {
        if sampling_rate == 0 {
            return Err(anyhow!("sampling rate must be at least 1"));
        }
        let stride = i64::try_from(sampling_rate).context("sampling rate exceeds sqlite range")?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {READING_COLUMNS} FROM (
                SELECT {READING_COLUMNS},
                       ROW_NUMBER() OVER (ORDER BY timestamp ASC, id ASC) AS rn
                FROM temperature_readings
                WHERE device_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             )
             WHERE (rn - 1) % ?4 = 0
             ORDER BY rn ASC"
        ))?;
        let rows = stmt
            .query_map(params![device_id, window.from, window.to, stride], reading_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to sample readings for {device_id} in {window}"))?;
        Ok(rows)
    }

    /// Raw readings `[offset, offset + limit)` in ascending timestamp order.
    ///
    /// # Errors
    /// Returns an error when `offset`/`limit` exceed the sqlite integer range or the query fails.
    pub fn page_readings(
        &self,
        device_id: &str,
        window: TimeWindow,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Reading>> {
        let offset = i64::try_from(offset).context("page offset exceeds sqlite range")?;
        let limit = i64::try_from(limit).context("page limit exceeds sqlite range")?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {READING_COLUMNS} FROM temperature_readings
             WHERE device_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC, id ASC
             LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt
            .query_map(params![device_id, window.from, window.to, limit, offset], reading_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to page readings for {device_id} in {window}"))?;
        Ok(rows)
    }

    /// Insert readings in one transaction. Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error when any insert fails; nothing is committed in that case.
    pub fn insert_readings(&mut self, readings: &[Reading]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO temperature_readings(device_id, timestamp, temperature, is_alarm)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for reading in readings {
                stmt.execute(params![
                    reading.device_id,
                    reading.timestamp,
                    reading.temperature,
                    reading.is_alarm
                ])
                .with_context(|| {
                    format!(
                        "failed to insert reading for {} at {}",
                        reading.device_id, reading.timestamp
                    )
                })?;
            }
        }
        tx.commit().context("failed to commit reading batch")?;
        Ok(readings.len())
    }

    /// Count and first/last timestamps across all of a device's readings.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn device_span(&self, device_id: &str) -> Result<DeviceSpan> {
        let (count, first_timestamp, last_timestamp) = self
            .conn
            .query_row(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp)
                 FROM temperature_readings WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .with_context(|| format!("failed to read span for {device_id}"))?;

        Ok(DeviceSpan {
            device_id: device_id.to_string(),
            total_count: u64::try_from(count).context("sqlite returned a negative count")?,
            first_timestamp,
            last_timestamp,
        })
    }
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        device_id: row.get(0)?,
        timestamp: row.get(1)?,
        temperature: row.get(2)?,
        is_alarm: row.get(3)?,
    })
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "temperature_readings")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
