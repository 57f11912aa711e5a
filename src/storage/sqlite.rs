//! SQLite-backed stores. The decoder database is the main connection and the
//! other four store files are attached to it, so one transaction covers a
//! whole flush.

use super::rows::{RowBatch, StoreRow};
use super::schema::{self, TableSchema};
use super::Store;
use crate::config::StoresConfig;
use crate::error::{IngestError, Result};
use rusqlite::{params, params_from_iter, Connection, Transaction};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StoreSchemas {
    decoder: TableSchema,
    features: TableSchema,
    measurements: TableSchema,
    statements: TableSchema,
    unparsable: TableSchema,
}

impl StoreSchemas {
    fn get(&self, store: Store) -> &TableSchema {
        match store {
            Store::Decoder => &self.decoder,
            Store::Features => &self.features,
            Store::Measurements => &self.measurements,
            Store::Statements => &self.statements,
            Store::Unparsable => &self.unparsable,
        }
    }
}

/// Rows newly inserted by one flush; keys already present are not counted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushCounts {
    pub decoder: usize,
    pub features: usize,
    pub measurements: usize,
    pub statements: usize,
    pub unparsable: usize,
}

pub struct Stores {
    conn: Connection,
    schemas: StoreSchemas,
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn existing_columns(conn: &Connection, schema: &TableSchema) -> Result<HashSet<String>> {
    let sql = format!("PRAGMA {}.table_info(\"{}\")", schema.database, schema.table);
    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names.into_iter().map(|n| n.to_ascii_lowercase()).collect())
}

/// Create the table if absent, then add any configured column it lacks.
/// Existing columns are never dropped or retyped.
fn ensure_table(conn: &Connection, schema: &TableSchema) -> Result<usize> {
    conn.execute(&schema.create_sql(), [])?;
    let existing = existing_columns(conn, schema)?;
    let mut added = 0;
    for column in &schema.columns {
        if existing.contains(&column.name.to_ascii_lowercase()) {
            continue;
        }
        conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {}",
                schema.qualified_name(),
                TableSchema::column_definition(column)
            ),
            [],
        )?;
        info!(table = schema.table, column = %column.name, "Added column to existing table");
        added += 1;
    }
    Ok(added)
}

fn insert_rows<R: StoreRow>(tx: &Transaction<'_>, schemas: &StoreSchemas, rows: &[R]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut stmt = tx.prepare_cached(&schemas.get(R::STORE).insert_sql())?;
    let mut inserted = 0;
    for row in rows {
        inserted += stmt.execute(params_from_iter(row.values()?))?;
    }
    Ok(inserted)
}

impl Stores {
    pub fn open(
        config: &StoresConfig,
        phi_fields: &[String],
        resting_fields: &[String],
    ) -> Result<Self> {
        let schemas = StoreSchemas {
            decoder: schema::decoder_schema(phi_fields)?,
            features: schema::features_schema()?,
            measurements: schema::measurements_schema(resting_fields)?,
            statements: schema::statements_schema()?,
            unparsable: schema::unparsable_schema()?,
        };

        let attached = [
            (&config.features, schemas.features.database),
            (&config.measurements, schemas.measurements.database),
            (&config.statements, schemas.statements.database),
            (&config.unparsable, schemas.unparsable.database),
        ];
        let mut distinct = HashSet::new();
        for path in std::iter::once(&config.decoder).chain(attached.iter().map(|(p, _)| *p)) {
            if !distinct.insert(path) {
                return Err(IngestError::Config(format!(
                    "store file '{}' is configured for more than one store",
                    path.display()
                )));
            }
            ensure_parent(path)?;
        }

        let conn = Connection::open(&config.decoder)?;
        for (path, alias) in attached {
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", alias),
                params![path.to_string_lossy()],
            )?;
        }
        let mode: String = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "Stores attached");

        for store in Store::ALL {
            let added = ensure_table(&conn, schemas.get(store))?;
            debug!(store = store.label(), added_columns = added, "Store table ready");
        }
        conn.execute(
            "CREATE INDEX IF NOT EXISTS main.decoder_encounter ON \"Decoder\" (\"PUID\", \"ACQ_DATE\", \"ACQ_TIME\")",
            [],
        )?;

        info!(decoder = %config.decoder.display(), "Opened stores");
        Ok(Self { conn, schemas })
    }

    /// Whether a flushed decoder row exists for this patient and acquisition timestamp.
    pub fn encounter_recorded(&self, puid: &str, date: &str, time: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT 1 FROM main.\"Decoder\" WHERE \"PUID\" = ?1 AND \"ACQ_DATE\" = ?2 AND \"ACQ_TIME\" = ?3 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![puid, date, time])?;
        Ok(rows.next()?.is_some())
    }

    /// Write every row of `batch` in one transaction. Rows whose key already
    /// exists are skipped, except in the decoder store: each decoder row
    /// carries a freshly minted EUID, so a skipped one fails the flush and
    /// nothing of it is committed.
    pub fn flush(&mut self, batch: &RowBatch) -> Result<FlushCounts> {
        let tx = self.conn.transaction()?;
        let decoder = insert_rows(&tx, &self.schemas, &batch.decoder)?;
        if decoder < batch.decoder.len() {
            return Err(IngestError::EncounterConflict {
                rows: batch.decoder.len(),
                skipped: batch.decoder.len() - decoder,
            });
        }
        let counts = FlushCounts {
            decoder,
            features: insert_rows(&tx, &self.schemas, &batch.features)?,
            measurements: insert_rows(&tx, &self.schemas, &batch.measurements)?,
            statements: insert_rows(&tx, &self.schemas, &batch.statements)?,
            unparsable: insert_rows(&tx, &self.schemas, &batch.unparsable)?,
        };
        tx.commit()?;
        Ok(counts)
    }

    pub fn row_count(&self, store: Store) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.schemas.get(store).qualified_name());
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| IngestError::Persistence(e))
    }
}
