//! Export the live table as CSV or Parquet

use crate::error::{PipelineError, Result};
use crate::validate::CanonicalRecord;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Parquet,
}

impl FromStr for ExportFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "parquet" | "pq" => Ok(ExportFormat::Parquet),
            other => Err(PipelineError::Export(format!(
                "unsupported export format '{}' (expected csv or parquet)",
                other
            ))),
        }
    }
}

impl ExportFormat {
    /// Guess the format from a file extension, defaulting to CSV.
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
            .unwrap_or(ExportFormat::Csv)
    }
}

/// Write `records` to `path`; returns the number of rows written.
pub fn export_records(records: &[CanonicalRecord], path: &Path, format: ExportFormat) -> Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    match format {
        ExportFormat::Csv => write_csv(records, path)?,
        ExportFormat::Parquet => write_parquet(records, path)?,
    }
    info!(path = %path.display(), rows = records.len(), format = ?format, "Export written");
    Ok(records.len())
}

fn write_csv(records: &[CanonicalRecord], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| PipelineError::Export(e.to_string()))?;
    for record in records {
        writer
            .serialize(record)
            .map_err(|e| PipelineError::Export(e.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Column-oriented frame of the canonical schema.
pub fn to_dataframe(records: &[CanonicalRecord]) -> Result<DataFrame> {
    let sale_id: Vec<&str> = records.iter().map(|r| r.sale_id.as_str()).collect();
    let borough: Vec<&str> = records.iter().map(|r| r.borough.as_str()).collect();
    let neighborhood: Vec<Option<&str>> = records.iter().map(|r| r.neighborhood.as_deref()).collect();
    let building_class: Vec<&str> = records
        .iter()
        .map(|r| r.building_class_category.as_str())
        .collect();
    let address: Vec<Option<&str>> = records.iter().map(|r| r.address.as_deref()).collect();
    let sale_price: Vec<f64> = records.iter().map(|r| r.sale_price).collect();
    let sale_date: Vec<String> = records
        .iter()
        .map(|r| r.sale_date.format("%Y-%m-%d").to_string())
        .collect();
    let gross_sqft: Vec<Option<f64>> = records.iter().map(|r| r.gross_sqft).collect();
    let price_per_sqft: Vec<Option<f64>> = records.iter().map(|r| r.price_per_sqft).collect();
    let sale_year: Vec<i32> = records.iter().map(|r| r.sale_year).collect();
    let sale_month: Vec<i32> = records.iter().map(|r| r.sale_month as i32).collect();
    let is_outlier: Vec<bool> = records.iter().map(|r| r.is_outlier).collect();

    DataFrame::new(vec![
        Series::new("sale_id", sale_id),
        Series::new("borough", borough),
        Series::new("neighborhood", neighborhood),
        Series::new("building_class_category", building_class),
        Series::new("address", address),
        Series::new("sale_price", sale_price),
        Series::new("sale_date", sale_date),
        Series::new("gross_sqft", gross_sqft),
        Series::new("price_per_sqft", price_per_sqft),
        Series::new("sale_year", sale_year),
        Series::new("sale_month", sale_month),
        Series::new("is_outlier", is_outlier),
    ])
    .map_err(|e| PipelineError::Export(e.to_string()))
}

fn write_parquet(records: &[CanonicalRecord], path: &Path) -> Result<()> {
    let mut df = to_dataframe(records)?;
    let mut file = File::create(path)?;
    ParquetWriter::new(&mut file)
        .finish(&mut df)
        .map_err(|e| PipelineError::Export(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Borough;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn sample() -> Vec<CanonicalRecord> {
        vec![CanonicalRecord {
            sale_id: "k1".to_string(),
            borough: Borough::StatenIsland,
            neighborhood: Some("GREAT KILLS".to_string()),
            building_class_category: "01 ONE FAMILY DWELLINGS".to_string(),
            address: None,
            sale_price: 650_000.0,
            sale_date: NaiveDate::from_ymd_opt(2022, 11, 2).unwrap(),
            gross_sqft: Some(1_300.0),
            price_per_sqft: Some(500.0),
            sale_year: 2022,
            sale_month: 11,
            is_outlier: false,
        }]
    }

    #[test]
    fn format_from_name_and_extension() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("parquet".parse::<ExportFormat>().unwrap(), ExportFormat::Parquet);
        assert!("xlsx".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::from_path(Path::new("out/sales.parquet")), ExportFormat::Parquet);
        assert_eq!(ExportFormat::from_path(Path::new("sales")), ExportFormat::Csv);
    }

    #[test]
    fn csv_export_has_header_and_canonical_borough_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sales.csv");
        assert_eq!(export_records(&sample(), &path, ExportFormat::Csv).unwrap(), 1);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("sale_id,borough,neighborhood"));
        let row = lines.next().unwrap();
        assert!(row.contains("Staten Island"));
        assert!(row.contains("2022-11-02"));
    }

    #[test]
    fn dataframe_keeps_nulls() {
        let df = to_dataframe(&sample()).unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(df.width(), 12);
        assert_eq!(df.column("address").unwrap().null_count(), 1);
    }

    #[test]
    fn parquet_export_writes_a_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sales.parquet");
        export_records(&sample(), &path, ExportFormat::Parquet).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
