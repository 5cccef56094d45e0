//! Pipeline Orchestrator - drives one ingestion run end to end
//!
//! fetch → land → checkpoint → normalize → validate → load, one page at a
//! time, then swap the finished generation in. A run that resumes from a
//! checkpoint first replays the pages already landed, so the generation it
//! builds always covers the dataset from offset zero.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ingestion::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::ingestion::connector::{FetchCheckpoint, PageSource, RawRecord};
use crate::ingestion::fetcher::PageFetcher;
use crate::ingestion::raw_sink::RawSink;
use crate::ingestion::{RunStatus, RunSummary};
use crate::normalize::normalize;
use crate::store::Loader;
use crate::validate::{OutlierPolicy, ValidationOutcome, Validator};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Options for a single run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Rebuild from landed pages only; never contact the source
    #[serde(default)]
    pub replay_only: bool,

    /// Stop after fetching this many pages in this run
    #[serde(default)]
    pub max_pages: Option<u64>,
}

pub struct Pipeline {
    fetcher: PageFetcher,
    sink: RawSink,
    checkpoints: Box<dyn CheckpointStore>,
    loader: Loader,
    outlier_policy: OutlierPolicy,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        fetcher: PageFetcher,
        sink: RawSink,
        checkpoints: Box<dyn CheckpointStore>,
        loader: Loader,
    ) -> Self {
        Self {
            fetcher,
            sink,
            checkpoints,
            loader,
            outlier_policy: OutlierPolicy::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire a pipeline against the data directory in `config`.
    pub fn from_config(config: &PipelineConfig, source: Box<dyn PageSource>) -> Result<Self> {
        let fetcher = PageFetcher::from_config(source, config);
        let sink = RawSink::open(config.raw_dir())?;
        let checkpoints = Box::new(FileCheckpointStore::new(config.checkpoint_path()));
        let loader = Loader::open(config.store_path())?;
        Ok(Self::new(fetcher, sink, checkpoints, loader)
            .with_outlier_policy(OutlierPolicy::new(config.outlier_iqr_multiple)))
    }

    pub fn with_outlier_policy(mut self, policy: OutlierPolicy) -> Self {
        self.outlier_policy = policy;
        self
    }

    /// Setting the returned flag stops the run after the in-flight page.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn raw_sink(&self) -> &RawSink {
        &self.sink
    }

    pub fn checkpoint(&self) -> Result<Option<FetchCheckpoint>> {
        self.checkpoints.load()
    }

    /// Forget all fetch progress and landed pages. The live table stays
    /// until the next completed run replaces it.
    pub fn reset(&self) -> Result<usize> {
        self.checkpoints.reset()?;
        let removed = self.sink.clear()?;
        info!(pages_removed = removed, "Ingestion state reset");
        Ok(removed)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn run(&mut self, options: &RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::new(Uuid::new_v4().to_string());
        let checkpoint = self.checkpoints.load()?;

        info!(
            run_id = %summary.run_id,
            resume_offset = checkpoint.as_ref().map(|c| c.offset).unwrap_or(0),
            landed_pages = checkpoint.as_ref().map(|c| c.pages_fetched).unwrap_or(0),
            replay_only = options.replay_only,
            "Starting ingestion run"
        );

        self.loader.begin_generation(&summary.run_id)?;
        let outcome = self.drive(checkpoint, options, &mut summary).await;

        match outcome {
            Ok(true) => {
                let generation = self.loader.commit_generation(&self.outlier_policy)?;
                summary.status = RunStatus::Completed;
                summary.outliers = generation.outliers;
                summary.generation = Some(generation.generation);
            }
            Ok(false) => {
                self.loader.abort_generation()?;
                summary.status = RunStatus::Interrupted;
                warn!(
                    run_id = %summary.run_id,
                    pages_fetched = summary.pages_fetched,
                    "Run stopped early; checkpoint kept, staging discarded"
                );
            }
            Err(err) => {
                if let Err(abort_err) = self.loader.abort_generation() {
                    warn!(error = %abort_err, "Could not discard staging generation");
                }
                error!(run_id = %summary.run_id, error = %err, "Ingestion run failed");
                return Err(err);
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            raw = summary.raw_records,
            accepted = summary.accepted,
            malformed = summary.malformed_total(),
            rejected = summary.rejected_total(),
            deduplicated = summary.deduplicated,
            outliers = summary.outliers,
            retries = summary.retries,
            elapsed_ms = summary.elapsed_ms,
            "Ingestion run finished"
        );
        Ok(summary)
    }

    /// Returns `Ok(true)` when every page was processed.
    async fn drive(
        &mut self,
        checkpoint: Option<FetchCheckpoint>,
        options: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        let mut validator = Validator::new();

        if let Some(checkpoint) = &checkpoint {
            if !self.replay(checkpoint, &mut validator, summary)? {
                return Ok(false);
            }
        }
        if options.replay_only {
            return Ok(true);
        }

        let mut checkpoint = checkpoint.unwrap_or_else(FetchCheckpoint::start);
        loop {
            if self.stop_requested() {
                info!(offset = checkpoint.offset, "Stop requested");
                return Ok(false);
            }
            if let Some(max_pages) = options.max_pages {
                if summary.pages_fetched >= max_pages {
                    info!(max_pages, offset = checkpoint.offset, "Page limit reached");
                    return Ok(false);
                }
            }

            let page = self
                .fetcher
                .fetch_and_land(&checkpoint, &self.sink, self.checkpoints.as_ref())
                .await?;
            summary.retries += page.retries() as u64;
            if !page.records.is_empty() {
                summary.pages_fetched += 1;
                self.process_page(page.sequence, &page.records, &mut validator, summary)?;
            }
            checkpoint = page.checkpoint;
            if !page.has_more {
                return Ok(true);
            }
        }
    }

    /// Re-process the pages landed before `checkpoint`. Pages landed after
    /// it were never checkpointed and get re-fetched instead.
    fn replay(
        &mut self,
        checkpoint: &FetchCheckpoint,
        validator: &mut Validator,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        let landed = self.sink.sequences()?;
        for sequence in 0..checkpoint.pages_fetched {
            if landed.binary_search(&sequence).is_err() {
                return Err(PipelineError::RawSink(format!(
                    "landed page {} is missing; reset the checkpoint to re-fetch from the start",
                    sequence
                )));
            }
        }

        for sequence in 0..checkpoint.pages_fetched {
            if self.stop_requested() {
                return Ok(false);
            }
            let records = self.sink.read_page(sequence)?;
            self.process_page(sequence, &records, validator, summary)?;
            summary.pages_replayed += 1;
        }
        if checkpoint.pages_fetched > 0 {
            info!(pages = checkpoint.pages_fetched, "Replayed landed pages");
        }
        Ok(true)
    }

    fn process_page(
        &mut self,
        sequence: u64,
        records: &[RawRecord],
        validator: &mut Validator,
        summary: &mut RunSummary,
    ) -> Result<()> {
        summary.raw_records += records.len() as u64;

        let mut batch = Vec::with_capacity(records.len());
        for raw in records {
            match normalize(raw) {
                Err(reason) => {
                    debug!(page = sequence, reason = %reason, "Malformed record");
                    *summary.malformed.entry(reason.reason_code()).or_insert(0) += 1;
                }
                Ok(draft) => match validator.validate(draft) {
                    ValidationOutcome::Accepted(record) => batch.push(record),
                    ValidationOutcome::Rejected(reason) => {
                        *summary.rejected.entry(reason.to_string()).or_insert(0) += 1;
                    }
                    ValidationOutcome::Deduplicated => summary.deduplicated += 1,
                },
            }
        }

        let report = self.loader.load(sequence, &batch)?;
        summary.accepted += batch.len() as u64;
        summary.loaded.merge(&report);
        debug!(
            page = sequence,
            records = records.len(),
            accepted = batch.len(),
            "Page processed"
        );
        Ok(())
    }
}
