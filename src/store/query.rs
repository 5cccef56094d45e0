//! Read-side queries over the committed `sales` generation

use crate::normalize::Borough;
use crate::store::loader::SALES_TABLE;
use crate::validate::CanonicalRecord;
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Column list shared by inserts and reads; order matches [`read_record`].
pub const RECORD_COLUMNS: &str = "sale_id, borough, neighborhood, building_class_category, address, \
     sale_price, sale_date, gross_sqft, price_per_sqft, sale_year, sale_month, is_outlier";

/// Open an existing store without taking the writer lock.
pub fn open_reader(path: impl AsRef<Path>) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

pub fn read_record(row: &Row<'_>) -> rusqlite::Result<CanonicalRecord> {
    let borough: String = row.get(1)?;
    let borough = Borough::from_canonical(&borough)
        .ok_or_else(|| conversion_error(1, format!("unknown borough {:?}", borough)))?;
    let sale_date: String = row.get(6)?;
    let sale_date = NaiveDate::parse_from_str(&sale_date, "%Y-%m-%d")
        .map_err(|e| conversion_error(6, format!("bad sale_date {:?}: {}", sale_date, e)))?;

    Ok(CanonicalRecord {
        sale_id: row.get(0)?,
        borough,
        neighborhood: row.get(2)?,
        building_class_category: row.get(3)?,
        address: row.get(4)?,
        sale_price: row.get(5)?,
        sale_date,
        gross_sqft: row.get(7)?,
        price_per_sqft: row.get(8)?,
        sale_year: row.get(9)?,
        sale_month: row.get(10)?,
        is_outlier: row.get(11)?,
    })
}

/// True once at least one generation has been committed.
pub fn has_live_table(conn: &Connection) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![SALES_TABLE],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Every committed row, ordered by `sale_id`.
pub fn all_records(conn: &Connection) -> rusqlite::Result<Vec<CanonicalRecord>> {
    if !has_live_table(conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY sale_id",
        RECORD_COLUMNS, SALES_TABLE
    ))?;
    let records: rusqlite::Result<Vec<CanonicalRecord>> = stmt.query_map([], read_record)?.collect();
    records
}

pub fn row_count(conn: &Connection) -> rusqlite::Result<u64> {
    if !has_live_table(conn)? {
        return Ok(0);
    }
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", SALES_TABLE), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

pub fn borough_counts(conn: &Connection) -> rusqlite::Result<BTreeMap<Borough, u64>> {
    Ok(borough_stats(conn)?
        .into_iter()
        .map(|stats| (stats.borough, stats.transactions))
        .collect())
}

/// Per-borough aggregate over the live table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BoroughStats {
    pub borough: Borough,
    pub transactions: u64,
    pub outliers: u64,
    pub avg_sale_price: f64,
    /// Average over rows with a known floor area, outliers excluded
    pub avg_price_per_sqft: Option<f64>,
    pub first_sale: Option<NaiveDate>,
    pub last_sale: Option<NaiveDate>,
}

pub fn borough_stats(conn: &Connection) -> rusqlite::Result<Vec<BoroughStats>> {
    if !has_live_table(conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT borough,
                COUNT(*),
                SUM(is_outlier),
                AVG(sale_price),
                AVG(CASE WHEN is_outlier = 0 THEN price_per_sqft END),
                MIN(sale_date),
                MAX(sale_date)
         FROM {}
         GROUP BY borough",
        SALES_TABLE
    ))?;
    let rows = stmt.query_map([], |row| {
        let borough: String = row.get(0)?;
        let borough = Borough::from_canonical(&borough)
            .ok_or_else(|| conversion_error(0, format!("unknown borough {:?}", borough)))?;
        let first: Option<String> = row.get(5)?;
        let last: Option<String> = row.get(6)?;
        Ok(BoroughStats {
            borough,
            transactions: row.get::<_, i64>(1)? as u64,
            outliers: row.get::<_, i64>(2)? as u64,
            avg_sale_price: row.get(3)?,
            avg_price_per_sqft: row.get(4)?,
            first_sale: first.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            last_sale: last.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        })
    })?;

    let mut stats = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    stats.sort_by_key(|s| s.borough.code());
    Ok(stats)
}

/// Bookkeeping row written when a generation is swapped in.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationInfo {
    pub generation: i64,
    pub run_id: String,
    pub committed_at: String,
    pub row_count: u64,
    pub outlier_count: u64,
}

pub fn current_generation(conn: &Connection) -> rusqlite::Result<Option<GenerationInfo>> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'load_generations'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }
    conn.query_row(
        "SELECT generation, run_id, committed_at, row_count, outlier_count
         FROM load_generations ORDER BY generation DESC LIMIT 1",
        [],
        |row| {
            Ok(GenerationInfo {
                generation: row.get(0)?,
                run_id: row.get(1)?,
                committed_at: row.get(2)?,
                row_count: row.get::<_, i64>(3)? as u64,
                outlier_count: row.get::<_, i64>(4)? as u64,
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Loader;
    use crate::validate::OutlierPolicy;

    fn record(id: &str, borough: Borough, price: f64, day: u32) -> CanonicalRecord {
        let sale_date = NaiveDate::from_ymd_opt(2023, 6, day).unwrap();
        CanonicalRecord {
            sale_id: id.to_string(),
            borough,
            neighborhood: None,
            building_class_category: "UNKNOWN".to_string(),
            address: Some(format!("{} MAIN ST", day)),
            sale_price: price,
            sale_date,
            gross_sqft: None,
            price_per_sqft: None,
            sale_year: 2023,
            sale_month: 6,
            is_outlier: false,
        }
    }

    #[test]
    fn empty_store_reports_nothing() {
        let loader = Loader::in_memory().unwrap();
        let conn = loader.connection();
        assert!(!has_live_table(conn).unwrap());
        assert_eq!(row_count(conn).unwrap(), 0);
        assert!(all_records(conn).unwrap().is_empty());
        assert!(borough_stats(conn).unwrap().is_empty());
        assert!(current_generation(conn).unwrap().is_none());
    }

    #[test]
    fn stats_group_by_borough_in_code_order() {
        let mut loader = Loader::in_memory().unwrap();
        loader.begin_generation("run-q").unwrap();
        loader
            .load(
                0,
                &[
                    record("q1", Borough::Queens, 100.0, 1),
                    record("q2", Borough::Queens, 300.0, 9),
                    record("m1", Borough::Manhattan, 50.0, 5),
                ],
            )
            .unwrap();
        loader.commit_generation(&OutlierPolicy::default()).unwrap();

        let conn = loader.connection();
        let stats = borough_stats(conn).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].borough, Borough::Manhattan);
        assert_eq!(stats[1].borough, Borough::Queens);
        assert_eq!(stats[1].transactions, 2);
        assert_eq!(stats[1].avg_sale_price, 200.0);
        assert_eq!(stats[1].avg_price_per_sqft, None);
        assert_eq!(stats[1].first_sale, NaiveDate::from_ymd_opt(2023, 6, 1));
        assert_eq!(stats[1].last_sale, NaiveDate::from_ymd_opt(2023, 6, 9));

        let counts = borough_counts(conn).unwrap();
        assert_eq!(counts.get(&Borough::Queens), Some(&2));
        assert_eq!(counts.get(&Borough::Bronx), None);

        let generation = current_generation(conn).unwrap().unwrap();
        assert_eq!(generation.run_id, "run-q");
        assert_eq!(generation.row_count, 3);
    }

    #[test]
    fn records_read_back_unchanged() {
        let mut loader = Loader::in_memory().unwrap();
        let original = record("x", Borough::StatenIsland, 425_000.0, 20);
        loader.begin_generation("run-r").unwrap();
        loader.load(0, &[original.clone()]).unwrap();
        loader.commit_generation(&OutlierPolicy::default()).unwrap();

        assert_eq!(all_records(loader.connection()).unwrap(), vec![original]);
    }
}
