//! Page Fetcher - serialized, paced, retried page requests

use crate::config::PipelineConfig;
use crate::error::{FetchError, Result};
use crate::ingestion::checkpoint::CheckpointStore;
use crate::ingestion::connector::{FetchCheckpoint, PageRequest, PageSource, RawRecord};
use crate::ingestion::raw_sink::RawSink;
use crate::ingestion::retry::{RateLimiter, RetryPolicy, RetryState};
use chrono::NaiveDate;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One page as returned by [`PageFetcher::fetch_next_page`].
#[derive(Clone, Debug)]
pub struct FetchedPage {
    /// Sequence number of this page in the fetch order
    pub sequence: u64,
    pub records: Vec<RawRecord>,

    /// Checkpoint to persist once the page is landed
    pub checkpoint: FetchCheckpoint,

    /// False once the source returned fewer records than requested
    pub has_more: bool,

    /// Attempts used, including the successful one
    pub attempts: u32,
}

impl FetchedPage {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

pub struct PageFetcher {
    source: Box<dyn PageSource>,
    policy: RetryPolicy,
    limiter: RateLimiter,
    page_size: usize,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
}

impl PageFetcher {
    pub fn new(source: Box<dyn PageSource>, policy: RetryPolicy, page_size: usize) -> Self {
        Self {
            source,
            policy,
            limiter: RateLimiter::new(Duration::ZERO),
            page_size: page_size.max(1),
            start_date: None,
            end_date: None,
        }
    }

    pub fn from_config(source: Box<dyn PageSource>, config: &PipelineConfig) -> Self {
        Self::new(source, RetryPolicy::from_config(config), config.page_size)
            .with_min_interval(config.min_request_interval())
            .with_date_range(config.start_date, config.end_date)
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.limiter = RateLimiter::new(interval);
        self
    }

    pub fn with_date_range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Request the page that starts at `checkpoint.offset`.
    ///
    /// Retries 429/5xx/transport failures with backoff up to the policy's
    /// attempt bound. Does not touch any durable state.
    pub async fn fetch_next_page(
        &mut self,
        checkpoint: &FetchCheckpoint,
    ) -> std::result::Result<FetchedPage, FetchError> {
        let request = PageRequest {
            offset: checkpoint.offset,
            limit: self.page_size,
            start_date: self.start_date,
            end_date: self.end_date,
        };

        let mut state = self.policy.start();
        loop {
            state = match state {
                RetryState::Attempt { attempt } => {
                    self.limiter.acquire().await;
                    debug!(
                        source = self.source.source_id(),
                        offset = request.offset,
                        limit = request.limit,
                        attempt,
                        "Requesting page"
                    );
                    match self.source.fetch_page(&request).await {
                        Ok(records) => return Ok(self.finish(checkpoint, records, attempt)),
                        Err(err) => {
                            let next = self.policy.on_error(attempt, &err);
                            if let RetryState::Backoff { delay, .. } = &next {
                                warn!(
                                    offset = request.offset,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %err,
                                    "Page request failed, backing off"
                                );
                            }
                            next
                        }
                    }
                }
                RetryState::Backoff { delay, .. } => {
                    tokio::time::sleep(delay).await;
                    state.resume()
                }
                RetryState::Failed(err) => {
                    warn!(offset = request.offset, error = %err, "Giving up on page");
                    return Err(err);
                }
            };
        }
    }

    fn finish(&self, checkpoint: &FetchCheckpoint, records: Vec<RawRecord>, attempts: u32) -> FetchedPage {
        let has_more = records.len() >= self.page_size;
        let next = if records.is_empty() {
            checkpoint.clone()
        } else {
            checkpoint.advance(records.len())
        };
        FetchedPage {
            sequence: checkpoint.next_sequence(),
            records,
            checkpoint: next,
            has_more,
            attempts,
        }
    }

    /// Fetch the next page, land it in `sink`, then persist its checkpoint.
    ///
    /// The checkpoint is written only after the raw page is durable, so a
    /// crash in between re-fetches the page on restart (at-least-once).
    /// An empty page is neither landed nor checkpointed.
    pub async fn fetch_and_land(
        &mut self,
        checkpoint: &FetchCheckpoint,
        sink: &RawSink,
        store: &dyn CheckpointStore,
    ) -> Result<FetchedPage> {
        let page = self.fetch_next_page(checkpoint).await?;
        if page.records.is_empty() {
            info!(offset = checkpoint.offset, "Source returned an empty page; end of dataset");
            return Ok(page);
        }

        sink.append(page.sequence, &page.records)?;
        store.save(&page.checkpoint)?;
        info!(
            page = page.sequence,
            records = page.records.len(),
            offset = page.checkpoint.offset,
            retries = page.retries(),
            has_more = page.has_more,
            "Page landed and checkpointed"
        );
        Ok(page)
    }
}
