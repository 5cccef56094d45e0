//! Fixture Source - serves a fixed record set page by page
//!
//! Backed by in-memory records or CSV text, so a run can be replayed
//! offline against a known dataset.

use crate::ingestion::connector::{PageRequest, PageSource, RawRecord, SourceError};
use crate::normalize::field_key;
use anyhow::{Context, Result};
use async_trait::async_trait;
use csv::ReaderBuilder;
use serde_json::Value;
use std::path::Path;

pub struct FixtureSource {
    source_id: String,
    records: Vec<RawRecord>,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            source_id: source_id.into(),
            records,
        }
    }

    pub fn from_csv_text(source_id: impl Into<String>, csv_text: &str) -> Result<Self> {
        Ok(Self::new(source_id, parse_csv(csv_text)?))
    }

    pub fn from_csv_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        Self::from_csv_text(format!("file://{}", path.display()), &text)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read CSV rows into records shaped like the API's JSON rows: every
/// value is text and blank cells are left out.
fn parse_csv(csv_text: &str) -> Result<Vec<RawRecord>> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let keys: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(field_key)
        .collect();

    reader
        .records()
        .enumerate()
        .map(|(row, result)| -> Result<RawRecord> {
            let cells = result.with_context(|| format!("Failed to read CSV row {}", row + 1))?;
            Ok(keys
                .iter()
                .zip(cells.iter())
                .map(|(key, cell)| (key, cell.trim()))
                .filter(|(_, cell)| !cell.is_empty())
                .map(|(key, cell)| (key.clone(), Value::String(cell.to_string())))
                .collect())
        })
        .collect()
}

fn sale_date_key(record: &RawRecord) -> Option<String> {
    record
        .get("sale_date")
        .and_then(Value::as_str)
        .map(|s| s.chars().take(10).collect())
}

#[async_trait]
impl PageSource for FixtureSource {
    async fn fetch_page(&self, request: &PageRequest) -> std::result::Result<Vec<RawRecord>, SourceError> {
        let start = request.start_date.map(|d| d.format("%Y-%m-%d").to_string());
        let end = request.end_date.map(|d| d.format("%Y-%m-%d").to_string());
        let in_range = |record: &&RawRecord| {
            if start.is_none() && end.is_none() {
                return true;
            }
            match sale_date_key(record) {
                Some(date) => {
                    start.as_ref().map_or(true, |s| &date >= s) && end.as_ref().map_or(true, |e| &date <= e)
                }
                None => false,
            }
        };

        Ok(self
            .records
            .iter()
            .filter(in_range)
            .skip(request.offset as usize)
            .take(request.limit)
            .cloned()
            .collect())
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}
