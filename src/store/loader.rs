//! Loader - writes a run's records as a new table generation
//!
//! A generation is built in a staging table inside one transaction that
//! spans the whole run. Committing flags outliers, swaps the staging table
//! in for the live one and records the generation; aborting rolls
//! everything back. Readers therefore see either the old or the new table.

use crate::error::LoadError;
use crate::normalize::Borough;
use crate::store::query::{read_record, RECORD_COLUMNS};
use crate::validate::{CanonicalRecord, OutlierPolicy};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

pub const SALES_TABLE: &str = "sales";
const STAGING_TABLE: &str = "sales_next";

const CREATE_META: &str = r"
CREATE TABLE IF NOT EXISTS load_generations (
    generation INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    committed_at TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    outlier_count INTEGER NOT NULL
);
";

fn create_staging_sql() -> String {
    format!(
        r"
DROP TABLE IF EXISTS {staging};
CREATE TABLE {staging} (
    sale_id TEXT PRIMARY KEY,
    borough TEXT NOT NULL
        CHECK (borough IN ('Manhattan', 'Bronx', 'Brooklyn', 'Queens', 'Staten Island')),
    neighborhood TEXT,
    building_class_category TEXT NOT NULL,
    address TEXT,
    sale_price REAL NOT NULL CHECK (sale_price > 0),
    sale_date TEXT NOT NULL,
    gross_sqft REAL CHECK (gross_sqft IS NULL OR gross_sqft > 0),
    price_per_sqft REAL,
    sale_year INTEGER NOT NULL,
    sale_month INTEGER NOT NULL CHECK (sale_month BETWEEN 1 AND 12),
    is_outlier INTEGER NOT NULL DEFAULT 0
);
",
        staging = STAGING_TABLE
    )
}

/// Counts for one loaded batch, or accumulated over a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub inserted: u64,
    /// Identical re-deliveries of a row already in the generation
    pub skipped: u64,
    pub errors: u64,
}

impl LoadReport {
    pub fn merge(&mut self, other: &LoadReport) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Result of a committed generation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationReport {
    pub generation: i64,
    pub rows: u64,
    pub outliers: u64,
}

#[derive(Debug)]
struct OpenGeneration {
    run_id: String,
    report: LoadReport,
}

pub struct Loader {
    conn: Connection,
    open: Option<OpenGeneration>,
}

impl Loader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL keeps readers of the live table unblocked while a run writes.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, LoadError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LoadError> {
        conn.execute_batch(CREATE_META)?;
        Ok(Self { conn, open: None })
    }

    /// Read access for queries against the committed generation.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn has_open_generation(&self) -> bool {
        self.open.is_some()
    }

    /// Open the run-wide transaction and an empty staging table.
    pub fn begin_generation(&mut self, run_id: &str) -> Result<(), LoadError> {
        if self.open.is_some() {
            warn!("Discarding an unfinished generation before starting a new one");
            self.abort_generation()?;
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        if let Err(e) = self.conn.execute_batch(&create_staging_sql()) {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        self.open = Some(OpenGeneration {
            run_id: run_id.to_string(),
            report: LoadReport::default(),
        });
        debug!(run_id, "Staging generation opened");
        Ok(())
    }

    /// Insert one batch into the staging generation.
    ///
    /// Row failures are not retried: every row of the batch is attempted so
    /// the report can count them, then any failure fails the batch.
    pub fn load(&mut self, batch: u64, records: &[CanonicalRecord]) -> Result<LoadReport, LoadError> {
        if self.open.is_none() {
            return Err(LoadError::NoGeneration);
        }

        let mut report = LoadReport::default();
        let mut first_error: Option<String> = None;
        {
            let mut insert = self.conn.prepare_cached(&format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(sale_id) DO NOTHING",
                STAGING_TABLE, RECORD_COLUMNS
            ))?;
            let mut existing = self.conn.prepare_cached(&format!(
                "SELECT {} FROM {} WHERE sale_id = ?1",
                RECORD_COLUMNS, STAGING_TABLE
            ))?;

            for record in records {
                let outcome = insert.execute(params![
                    record.sale_id,
                    record.borough.as_str(),
                    record.neighborhood,
                    record.building_class_category,
                    record.address,
                    record.sale_price,
                    record.sale_date.format("%Y-%m-%d").to_string(),
                    record.gross_sqft,
                    record.price_per_sqft,
                    record.sale_year,
                    record.sale_month,
                    record.is_outlier,
                ]);
                match outcome {
                    Ok(1) => report.inserted += 1,
                    Ok(_) => {
                        let stored = existing
                            .query_row(params![record.sale_id], read_record)
                            .optional()?;
                        if stored.as_ref() == Some(record) {
                            report.skipped += 1;
                        } else {
                            report.errors += 1;
                            first_error.get_or_insert_with(|| {
                                format!("conflicting duplicate sale_id {}", record.sale_id)
                            });
                        }
                    }
                    Err(e) => {
                        report.errors += 1;
                        first_error.get_or_insert_with(|| format!("sale_id {}: {}", record.sale_id, e));
                    }
                }
            }
        }

        if let Some(first_error) = first_error {
            warn!(batch, failed = report.errors, error = %first_error, "Batch rejected by the store");
            return Err(LoadError::BatchFailed {
                batch,
                failed: report.errors,
                first_error,
            });
        }

        if let Some(open) = self.open.as_mut() {
            open.report.merge(&report);
        }
        debug!(batch, inserted = report.inserted, skipped = report.skipped, "Batch loaded");
        Ok(report)
    }

    /// Flag outliers, swap the staging table in and commit.
    pub fn commit_generation(&mut self, policy: &OutlierPolicy) -> Result<GenerationReport, LoadError> {
        let open = self.open.take().ok_or(LoadError::NoGeneration)?;
        match self.finish(&open.run_id, policy) {
            Ok(report) => {
                info!(
                    generation = report.generation,
                    rows = report.rows,
                    outliers = report.outliers,
                    inserted = open.report.inserted,
                    "Generation swapped in"
                );
                Ok(report)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn finish(&self, run_id: &str, policy: &OutlierPolicy) -> Result<GenerationReport, LoadError> {
        let outliers = self.flag_outliers(policy)?;
        let rows: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", STAGING_TABLE),
            [],
            |row| row.get(0),
        )?;

        self.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {live};
             ALTER TABLE {staging} RENAME TO {live};
             CREATE INDEX IF NOT EXISTS idx_{live}_borough_year ON {live} (borough, sale_year, sale_month);",
            live = SALES_TABLE,
            staging = STAGING_TABLE
        ))?;
        self.conn.execute(
            "INSERT INTO load_generations (run_id, committed_at, row_count, outlier_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, Utc::now().to_rfc3339(), rows, outliers as i64],
        )?;
        let generation = self.conn.last_insert_rowid();
        self.conn.execute_batch("COMMIT")?;

        Ok(GenerationReport {
            generation,
            rows: rows as u64,
            outliers,
        })
    }

    fn flag_outliers(&self, policy: &OutlierPolicy) -> Result<u64, LoadError> {
        let mut flagged = 0u64;
        let mut select = self.conn.prepare(&format!(
            "SELECT price_per_sqft FROM {} WHERE borough = ?1 AND price_per_sqft IS NOT NULL",
            STAGING_TABLE
        ))?;
        for borough in Borough::ALL {
            let values = select
                .query_map(params![borough.as_str()], |row| row.get::<_, f64>(0))?
                .collect::<Result<Vec<f64>, _>>()?;
            let Some(fences) = policy.fences(&values) else {
                continue;
            };
            let changed = self.conn.execute(
                &format!(
                    "UPDATE {} SET is_outlier = 1
                     WHERE borough = ?1 AND price_per_sqft IS NOT NULL
                       AND (price_per_sqft < ?2 OR price_per_sqft > ?3)",
                    STAGING_TABLE
                ),
                params![borough.as_str(), fences.lower, fences.upper],
            )?;
            debug!(
                borough = borough.as_str(),
                q1 = fences.q1,
                q3 = fences.q3,
                flagged = changed,
                "Outlier fences applied"
            );
            flagged += changed as u64;
        }
        Ok(flagged)
    }

    /// Discard the staging generation; the live table is untouched.
    pub fn abort_generation(&mut self) -> Result<(), LoadError> {
        if let Some(open) = self.open.take() {
            self.conn.execute_batch("ROLLBACK")?;
            info!(run_id = %open.run_id, "Staging generation discarded");
        }
        Ok(())
    }
}
