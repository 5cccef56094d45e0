//! Raw Sink - append-only landing area for fetched pages
//!
//! Each page is one JSON-lines file named by its fetch sequence number.
//! Pages are kept for audit and for replaying a run without re-fetching.

use crate::error::{PipelineError, Result};
use crate::ingestion::checkpoint::write_atomic;
use crate::ingestion::connector::RawRecord;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PAGE_PREFIX: &str = "page-";
const PAGE_SUFFIX: &str = ".jsonl";

pub struct RawSink {
    dir: PathBuf,
}

impl RawSink {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn page_path(&self, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:08}{}", PAGE_PREFIX, sequence, PAGE_SUFFIX))
    }

    /// Durably land a page. Landing the same sequence twice replaces the
    /// earlier copy, which happens when a page is re-fetched after a crash.
    pub fn append(&self, sequence: u64, records: &[RawRecord]) -> Result<PathBuf> {
        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let path = self.page_path(sequence);
        write_atomic(&path, &buf)?;
        debug!(sequence, records = records.len(), path = %path.display(), "Raw page landed");
        Ok(path)
    }

    pub fn read_page(&self, sequence: u64) -> Result<Vec<RawRecord>> {
        let path = self.page_path(sequence);
        let text = fs::read_to_string(&path).map_err(|e| {
            PipelineError::RawSink(format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut records = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line)? {
                Value::Object(map) => records.push(map),
                other => {
                    return Err(PipelineError::RawSink(format!(
                        "{} line {}: expected an object, found {}",
                        path.display(),
                        line_no + 1,
                        other
                    )))
                }
            }
        }
        Ok(records)
    }

    /// Sequence numbers of all landed pages, ascending.
    pub fn sequences(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(seq) = name
                .strip_prefix(PAGE_PREFIX)
                .and_then(|rest| rest.strip_suffix(PAGE_SUFFIX))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                out.push(seq);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Remove every landed page (operator reset).
    pub fn clear(&self) -> Result<usize> {
        let sequences = self.sequences()?;
        for seq in &sequences {
            fs::remove_file(self.page_path(*seq))?;
        }
        info!(pages = sequences.len(), dir = %self.dir.display(), "Raw sink cleared");
        Ok(sequences.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(v: Value) -> RawRecord {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn pages_are_listed_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let sink = RawSink::open(dir.path().join("raw")).unwrap();
        sink.append(2, &[record(json!({"a": 2}))]).unwrap();
        sink.append(0, &[record(json!({"a": 0}))]).unwrap();
        sink.append(1, &[]).unwrap();
        fs::write(sink.dir().join("notes.txt"), "ignored").unwrap();

        assert_eq!(sink.sequences().unwrap(), vec![0, 1, 2]);
        assert!(sink.read_page(1).unwrap().is_empty());
    }

    #[test]
    fn landed_page_reads_back_field_for_field() {
        let dir = TempDir::new().unwrap();
        let sink = RawSink::open(dir.path()).unwrap();
        let page = vec![
            record(json!({"borough": "2", "sale_price": "500000", "neighborhood": null})),
            record(json!({"borough": "MANHATTAN", "sale_price": 1})),
        ];
        sink.append(7, &page).unwrap();
        assert_eq!(sink.read_page(7).unwrap(), page);
    }

    #[test]
    fn relanding_a_sequence_replaces_it() {
        let dir = TempDir::new().unwrap();
        let sink = RawSink::open(dir.path()).unwrap();
        sink.append(0, &[record(json!({"v": 1}))]).unwrap();
        sink.append(0, &[record(json!({"v": 2})), record(json!({"v": 3}))]).unwrap();
        assert_eq!(sink.read_page(0).unwrap().len(), 2);
        assert_eq!(sink.sequences().unwrap(), vec![0]);
    }

    #[test]
    fn clear_removes_pages() {
        let dir = TempDir::new().unwrap();
        let sink = RawSink::open(dir.path()).unwrap();
        sink.append(0, &[]).unwrap();
        sink.append(1, &[]).unwrap();
        assert_eq!(sink.clear().unwrap(), 2);
        assert!(sink.sequences().unwrap().is_empty());
        assert!(sink.read_page(0).is_err());
    }
}
