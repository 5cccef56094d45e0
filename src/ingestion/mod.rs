//! Ingestion Module
//!
//! Pulls the rolling sales dataset page by page into the store with:
//! - Paced, retried page requests
//! - Raw landing of every page before its checkpoint moves
//! - Durable, monotonic fetch checkpoints
//! - Replay of landed pages so a restart rebuilds the same table

pub mod checkpoint;
pub mod connector;
pub mod fetcher;
pub mod fixture;
pub mod orchestrator;
pub mod raw_sink;
pub mod retry;
pub mod socrata;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use connector::{FetchCheckpoint, PageRequest, PageSource, RawRecord, SourceError};
pub use fetcher::{FetchedPage, PageFetcher};
pub use fixture::FixtureSource;
pub use orchestrator::{Pipeline, RunOptions};
pub use raw_sink::RawSink;
pub use retry::{RateLimiter, RetryPolicy, RetryState};
pub use socrata::{DatasetInfo, SocrataSource};

use crate::store::LoadReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of one pipeline run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run ID, also recorded with the committed generation
    pub run_id: String,

    pub status: RunStatus,

    /// Pages requested from the source in this run
    pub pages_fetched: u64,

    /// Landed pages re-read from the raw sink
    pub pages_replayed: u64,

    /// Raw records seen, fetched plus replayed
    pub raw_records: u64,

    pub accepted: u64,

    /// Malformed record counts keyed by reason code
    pub malformed: BTreeMap<String, u64>,

    /// Rejected record counts keyed by reason
    pub rejected: BTreeMap<String, u64>,

    pub deduplicated: u64,

    /// Store-side counts over every loaded batch
    pub loaded: LoadReport,

    /// Rows flagged as outliers in the committed generation
    pub outliers: u64,

    /// Retried page requests
    pub retries: u64,

    /// Generation swapped in by this run, if it completed
    pub generation: Option<i64>,

    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Interrupted,
            pages_fetched: 0,
            pages_replayed: 0,
            raw_records: 0,
            accepted: 0,
            malformed: BTreeMap::new(),
            rejected: BTreeMap::new(),
            deduplicated: 0,
            loaded: LoadReport::default(),
            outliers: 0,
            retries: 0,
            generation: None,
            elapsed_ms: 0,
        }
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed.values().sum()
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }

    /// Every raw record ends up in exactly one bucket.
    pub fn is_balanced(&self) -> bool {
        self.accepted + self.malformed_total() + self.rejected_total() + self.deduplicated
            == self.raw_records
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    /// All pages processed and the new generation swapped in
    Completed,
    /// Stopped early; the staging generation was discarded
    Interrupted,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({:?})", self.run_id, self.status)?;
        writeln!(f, "  pages fetched:    {}", self.pages_fetched)?;
        writeln!(f, "  pages replayed:   {}", self.pages_replayed)?;
        writeln!(f, "  raw records:      {}", self.raw_records)?;
        writeln!(f, "  accepted:         {}", self.accepted)?;
        writeln!(f, "  malformed:        {}", self.malformed_total())?;
        for (reason, count) in &self.malformed {
            writeln!(f, "    {:<28} {}", reason, count)?;
        }
        writeln!(f, "  rejected:         {}", self.rejected_total())?;
        for (reason, count) in &self.rejected {
            writeln!(f, "    {:<28} {}", reason, count)?;
        }
        writeln!(f, "  deduplicated:     {}", self.deduplicated)?;
        writeln!(f, "  rows inserted:    {}", self.loaded.inserted)?;
        writeln!(f, "  outliers flagged: {}", self.outliers)?;
        writeln!(f, "  retries:          {}", self.retries)?;
        if let Some(generation) = self.generation {
            writeln!(f, "  generation:       {}", generation)?;
        }
        write!(f, "  elapsed:          {:.1}s", self.elapsed_ms as f64 / 1000.0)
    }
}
