//! Page source seam - abstract interface for the paginated remote dataset

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One transaction exactly as the API returned it.
pub type RawRecord = Map<String, Value>;

/// Durable ingestion progress, used to resume after a crash or throttling.
///
/// `offset` never moves backwards except through an explicit operator reset.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchCheckpoint {
    /// Offset of the next record to request
    pub offset: u64,

    /// Records received so far
    pub total_fetched: u64,

    /// Pages landed so far; also the sequence number of the next page
    pub pages_fetched: u64,

    /// Time the last page was landed
    pub last_success_time: DateTime<Utc>,
}

impl FetchCheckpoint {
    /// Start-of-dataset position.
    pub fn start() -> Self {
        Self {
            offset: 0,
            total_fetched: 0,
            pages_fetched: 0,
            last_success_time: Utc::now(),
        }
    }

    /// Position after a page of `records` records has been landed.
    pub fn advance(&self, records: usize) -> Self {
        let records = records as u64;
        Self {
            offset: self.offset + records,
            total_fetched: self.total_fetched + records,
            pages_fetched: self.pages_fetched + 1,
            last_success_time: Utc::now(),
        }
    }

    /// Sequence number the next landed page will carry.
    pub fn next_sequence(&self) -> u64 {
        self.pages_fetched
    }
}

/// Parameters of a single page request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Raw failure reported by a source for one request attempt.
///
/// The fetcher decides which of these are worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport failure (timeout: {timeout}): {message}")]
    Transport { message: String, timeout: bool },

    #[error("malformed response body: {0}")]
    Decode(String),
}

/// Paginated source of raw transaction records.
///
/// Implementations:
/// - `SocrataSource`: the NYC Open Data HTTP endpoint
/// - `FixtureSource`: in-memory or CSV-backed records for replay and tests
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page; an empty or short page signals the end of the dataset.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawRecord>, SourceError>;

    /// Source identifier used in logs (e.g., the endpoint URL)
    fn source_id(&self) -> &str;
}
