//! `SQLite` persistence layer.
//!
//! One database holds the change ledger (triage rows included), the
//! per-aggregate clock index, the business records and the export
//! watermark. Ledger values are stored as JSON scalars, the same form they
//! take on the wire. Record fields keep their type tag so they load back
//! with the type they were written with.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_core::{
    format_utc, parse_utc, AggregateClockState, AggregateKey, ChangeLedger, ClockComparison,
    ClockStateStore, FieldKind, FieldValue, LedgerEntry, Record, RecordStore, SiteId, StoreError,
    VectorClock,
};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

const EXPORT_WATERMARK: &str = "export";

/// `SQLite`-backed implementation of every FieldSync store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqliteResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The persisted export watermark, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored value is not UTC.
    pub async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_utc FROM sync_watermark WHERE name = ?1",
                [EXPORT_WATERMARK],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        raw.map(|text| parse_utc(&text).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()
    }

    /// Persist the export watermark.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub async fn save_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r"
            INSERT INTO sync_watermark (name, value_utc) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET value_utc = excluded.value_utc
            ",
            (EXPORT_WATERMARK, format_utc(&watermark)),
        )
        .map_err(backend)?;
        Ok(())
    }

    /// Row counts of the ledger and the clock index.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn counts(&self) -> Result<(usize, usize), StoreError> {
        let conn = self.conn.lock().await;
        let ledger: i64 = conn
            .query_row("SELECT COUNT(*) FROM change_ledger", [], |row| row.get(0))
            .map_err(backend)?;
        let clocks: i64 = conn
            .query_row("SELECT COUNT(*) FROM aggregate_clock_state", [], |row| {
                row.get(0)
            })
            .map_err(backend)?;
        Ok((
            usize::try_from(ledger).unwrap_or_default(),
            usize::try_from(clocks).unwrap_or_default(),
        ))
    }
}

fn init_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        r"
        -- Append-only change ledger; triage rows use field_name '__triage__'
        CREATE TABLE IF NOT EXISTS change_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            field_name TEXT NOT NULL,
            previous_value TEXT NOT NULL,
            new_value TEXT NOT NULL,
            origin_site_id TEXT NOT NULL,
            origin_device_id TEXT,
            observed_on_utc INTEGER NOT NULL,
            vector_clock_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_change_ledger_observed
            ON change_ledger(observed_on_utc);
        CREATE INDEX IF NOT EXISTS idx_change_ledger_field
            ON change_ledger(field_name, observed_on_utc);
        CREATE INDEX IF NOT EXISTS idx_change_ledger_aggregate
            ON change_ledger(aggregate_type, aggregate_id, field_name);

        -- Per-aggregate clock index
        CREATE TABLE IF NOT EXISTS aggregate_clock_state (
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            vector_clock_json TEXT NOT NULL,
            updated_on_utc INTEGER NOT NULL,
            PRIMARY KEY (aggregate_type, aggregate_id)
        );

        -- Business records and their typed fields
        CREATE TABLE IF NOT EXISTS records (
            aggregate_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            key_field TEXT NOT NULL,
            modified_by TEXT,
            modified_on_utc INTEGER,
            PRIMARY KEY (aggregate_type, record_id)
        );

        CREATE TABLE IF NOT EXISTS record_fields (
            aggregate_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            field_name TEXT NOT NULL,
            value_tag TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (aggregate_type, record_id, field_name)
        );

        CREATE TABLE IF NOT EXISTS sync_watermark (
            name TEXT PRIMARY KEY,
            value_utc TEXT NOT NULL
        );
        ",
    )
}

#[async_trait]
impl ChangeLedger for SqliteStore {
    async fn append(&self, entries: Vec<LedgerEntry>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(backend)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    r"
                    INSERT INTO change_ledger (
                        aggregate_type, aggregate_id, field_name, previous_value, new_value,
                        origin_site_id, origin_device_id, observed_on_utc, vector_clock_json
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ",
                )
                .map_err(backend)?;
            for entry in &entries {
                stmt.execute((
                    &entry.aggregate_type,
                    entry.aggregate_id.to_string(),
                    &entry.field_name,
                    serde_json::to_string(&entry.previous_value)?,
                    serde_json::to_string(&entry.new_value)?,
                    entry.origin_site_id.as_str(),
                    entry.origin_device_id.as_deref(),
                    entry.observed_on_utc.timestamp_micros(),
                    entry.vector_clock.to_json()?,
                ))
                .map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)
    }

    async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                r"
                SELECT aggregate_type, aggregate_id, field_name, previous_value, new_value,
                       origin_site_id, origin_device_id, observed_on_utc, vector_clock_json
                FROM change_ledger
                WHERE observed_on_utc >= ?1
                ORDER BY observed_on_utc ASC, id ASC
                ",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([since.timestamp_micros()], raw_ledger_row)
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;
        rows.into_iter().map(RawLedgerRow::decode).collect()
    }

    async fn read_latest(
        &self,
        field_name: &str,
        take: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                r"
                SELECT aggregate_type, aggregate_id, field_name, previous_value, new_value,
                       origin_site_id, origin_device_id, observed_on_utc, vector_clock_json
                FROM change_ledger
                WHERE field_name = ?1
                ORDER BY observed_on_utc DESC, id DESC
                LIMIT ?2
                ",
            )
            .map_err(backend)?;
        let limit = i64::try_from(take).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map((field_name, limit), raw_ledger_row)
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;
        rows.into_iter().map(RawLedgerRow::decode).collect()
    }

    async fn contains_change(&self, entry: &LedgerEntry) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                r"
                SELECT origin_site_id, vector_clock_json FROM change_ledger
                WHERE aggregate_type = ?1 AND aggregate_id = ?2 AND field_name = ?3
                ",
            )
            .map_err(backend)?;
        let candidates = stmt
            .query_map(
                (
                    &entry.aggregate_type,
                    entry.aggregate_id.to_string(),
                    &entry.field_name,
                ),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;

        // Site ids and clocks compare by value, not by stored text.
        for (site, clock_json) in candidates {
            if SiteId::new(site) == entry.origin_site_id
                && VectorClock::from_json(&clock_json)?.compare(&entry.vector_clock)
                    == ClockComparison::Equal
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl ClockStateStore for SqliteStore {
    async fn load_clock(
        &self,
        key: &AggregateKey,
    ) -> Result<Option<AggregateClockState>, StoreError> {
        let conn = self.conn.lock().await;
        let row: Option<(String, i64)> = conn
            .query_row(
                r"
                SELECT vector_clock_json, updated_on_utc FROM aggregate_clock_state
                WHERE aggregate_type = ?1 AND aggregate_id = ?2
                ",
                (&key.aggregate_type, key.aggregate_id.to_string()),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;

        row.map(|(clock_json, updated)| {
            Ok(AggregateClockState {
                key: key.clone(),
                vector_clock: VectorClock::from_json(&clock_json)?,
                updated_on_utc: from_micros(updated)?,
            })
        })
        .transpose()
    }

    async fn save_clock(&self, state: &AggregateClockState) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r"
            INSERT INTO aggregate_clock_state (
                aggregate_type, aggregate_id, vector_clock_json, updated_on_utc
            ) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(aggregate_type, aggregate_id) DO UPDATE SET
                vector_clock_json = excluded.vector_clock_json,
                updated_on_utc = excluded.updated_on_utc
            ",
            (
                &state.key.aggregate_type,
                state.key.aggregate_id.to_string(),
                state.vector_clock.to_json()?,
                state.updated_on_utc.timestamp_micros(),
            ),
        )
        .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn find_record(
        &self,
        aggregate_type: &str,
        key_field: &str,
        id: Uuid,
    ) -> Result<Option<Record>, StoreError> {
        let conn = self.conn.lock().await;
        let record_id = id.to_string();
        let header: Option<(Option<String>, Option<i64>)> = conn
            .query_row(
                r"
                SELECT modified_by, modified_on_utc FROM records
                WHERE aggregate_type = ?1 AND record_id = ?2 AND key_field = ?3
                ",
                (aggregate_type, &record_id, key_field),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;
        let Some((modified_by, modified_on)) = header else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare_cached(
                r"
                SELECT field_name, value_tag, value_json FROM record_fields
                WHERE aggregate_type = ?1 AND record_id = ?2
                ",
            )
            .map_err(backend)?;
        let fields = stmt
            .query_map((aggregate_type, &record_id), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;

        let mut record = Record::new();
        for (name, tag, json) in fields {
            record.set(name, decode_tagged(&tag, &json)?);
        }
        record.modified_by = modified_by;
        record.modified_on_utc = modified_on.map(from_micros).transpose()?;
        Ok(Some(record))
    }

    async fn save_record(
        &self,
        aggregate_type: &str,
        key_field: &str,
        record: &Record,
    ) -> Result<(), StoreError> {
        let id = record
            .identifier(key_field)
            .ok_or_else(|| StoreError::MissingKey {
                aggregate_type: aggregate_type.to_string(),
                key_field: key_field.to_string(),
            })?;
        let record_id = id.to_string();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(backend)?;
        tx.execute(
            r"
            INSERT INTO records (aggregate_type, record_id, key_field, modified_by, modified_on_utc)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(aggregate_type, record_id) DO UPDATE SET
                key_field = excluded.key_field,
                modified_by = excluded.modified_by,
                modified_on_utc = excluded.modified_on_utc
            ",
            (
                aggregate_type,
                &record_id,
                key_field,
                record.modified_by.as_deref(),
                record.modified_on_utc.map(|ts| ts.timestamp_micros()),
            ),
        )
        .map_err(backend)?;
        tx.execute(
            "DELETE FROM record_fields WHERE aggregate_type = ?1 AND record_id = ?2",
            (aggregate_type, &record_id),
        )
        .map_err(backend)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    r"
                    INSERT INTO record_fields (
                        aggregate_type, record_id, field_name, value_tag, value_json
                    ) VALUES (?1, ?2, ?3, ?4, ?5)
                    ",
                )
                .map_err(backend)?;
            for (name, value) in record.fields() {
                stmt.execute((
                    aggregate_type,
                    &record_id,
                    name,
                    value.tag(),
                    serde_json::to_string(value)?,
                ))
                .map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)
    }
}

struct RawLedgerRow {
    aggregate_type: String,
    aggregate_id: String,
    field_name: String,
    previous_value: String,
    new_value: String,
    origin_site_id: String,
    origin_device_id: Option<String>,
    observed_on_utc: i64,
    vector_clock_json: String,
}

fn raw_ledger_row(row: &Row<'_>) -> SqliteResult<RawLedgerRow> {
    Ok(RawLedgerRow {
        aggregate_type: row.get(0)?,
        aggregate_id: row.get(1)?,
        field_name: row.get(2)?,
        previous_value: row.get(3)?,
        new_value: row.get(4)?,
        origin_site_id: row.get(5)?,
        origin_device_id: row.get(6)?,
        observed_on_utc: row.get(7)?,
        vector_clock_json: row.get(8)?,
    })
}

impl RawLedgerRow {
    fn decode(self) -> Result<LedgerEntry, StoreError> {
        Ok(LedgerEntry {
            aggregate_type: self.aggregate_type,
            aggregate_id: Uuid::parse_str(&self.aggregate_id)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            field_name: self.field_name,
            previous_value: serde_json::from_str(&self.previous_value)?,
            new_value: serde_json::from_str(&self.new_value)?,
            origin_site_id: SiteId::new(self.origin_site_id),
            origin_device_id: self.origin_device_id,
            observed_on_utc: from_micros(self.observed_on_utc)?,
            vector_clock: VectorClock::from_json(&self.vector_clock_json)?,
        })
    }
}

fn decode_tagged(tag: &str, json: &str) -> Result<FieldValue, StoreError> {
    let raw: FieldValue = serde_json::from_str(json)?;
    let kind = match tag {
        "decimal" => FieldKind::Decimal,
        "timestamp" => FieldKind::Timestamp,
        "identifier" => FieldKind::Identifier,
        "float" => FieldKind::Float,
        _ => return Ok(raw),
    };
    raw.convert(&kind)
        .ok_or_else(|| StoreError::Serialization(format!("stored {tag} value {json} is corrupt")))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {micros}")))
}

#[allow(clippy::needless_pass_by_value)]
fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
