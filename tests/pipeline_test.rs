use async_trait::async_trait;
use nyc_sales_ingest::ingestion::{
    CheckpointStore, FetchCheckpoint, FileCheckpointStore, FixtureSource, MemoryCheckpointStore,
    PageFetcher, PageRequest, PageSource, Pipeline, RawRecord, RawSink, RetryPolicy, RunOptions,
    RunStatus, SourceError,
};
use nyc_sales_ingest::normalize::Borough;
use nyc_sales_ingest::store::{export_records, query, ExportFormat, Loader};
use nyc_sales_ingest::validate::CanonicalRecord;
use nyc_sales_ingest::{FetchError, PipelineError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

const PAGE_SIZE: usize = 4;

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/rolling_sales_sample.csv")
}

fn fixture_source() -> FixtureSource {
    FixtureSource::from_csv_file(fixture_path()).unwrap()
}

/// Pipeline whose checkpoint, raw pages and store all live under `dir`.
fn pipeline_in(dir: &Path, source: Box<dyn PageSource>) -> Pipeline {
    let fetcher = PageFetcher::new(source, RetryPolicy::immediate(5), PAGE_SIZE);
    Pipeline::new(
        fetcher,
        RawSink::open(dir.join("raw")).unwrap(),
        Box::new(FileCheckpointStore::new(dir.join("checkpoint.json"))),
        Loader::open(dir.join("sales.db")).unwrap(),
    )
}

fn table(pipeline: &Pipeline) -> Vec<CanonicalRecord> {
    query::all_records(pipeline.loader().connection()).unwrap()
}

/// Fails every request at `fail_offset` with `status` for the first
/// `failures` attempts, then serves the wrapped source.
struct ScriptedSource {
    inner: FixtureSource,
    fail_offset: u64,
    status: u16,
    failures: u32,
    calls_at_offset: AtomicU32,
}

impl ScriptedSource {
    fn new(fail_offset: u64, status: u16, failures: u32) -> Self {
        Self {
            inner: fixture_source(),
            fail_offset,
            status,
            failures,
            calls_at_offset: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawRecord>, SourceError> {
        if request.offset == self.fail_offset {
            let call = self.calls_at_offset.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SourceError::Status {
                    status: self.status,
                    body: "slow down".to_string(),
                });
            }
        }
        self.inner.fetch_page(request).await
    }

    fn source_id(&self) -> &str {
        "scripted"
    }
}

/// Raises the pipeline's stop flag while the page at `stop_offset` is
/// being fetched, then lets that fetch finish.
struct StopDuringFetch {
    inner: FixtureSource,
    stop_offset: u64,
    stop: Arc<OnceLock<Arc<AtomicBool>>>,
}

#[async_trait]
impl PageSource for StopDuringFetch {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RawRecord>, SourceError> {
        if request.offset == self.stop_offset {
            if let Some(stop) = self.stop.get() {
                stop.store(true, Ordering::SeqCst);
            }
        }
        self.inner.fetch_page(request).await
    }

    fn source_id(&self) -> &str {
        "stop-during-fetch"
    }
}

#[tokio::test]
async fn full_run_reproduces_fixture_statistics() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_in(dir.path(), Box::new(fixture_source()));

    let summary = pipeline.run(&RunOptions::default()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.pages_fetched, 6);
    assert_eq!(summary.raw_records, 21);
    assert_eq!(summary.accepted, 14);
    assert_eq!(summary.rejected.get("non-positive price"), Some(&3));
    assert_eq!(summary.rejected.get("missing borough"), Some(&1));
    assert_eq!(summary.malformed.get("unknown borough"), Some(&1));
    assert_eq!(summary.malformed.get("invalid sale_date"), Some(&1));
    assert_eq!(summary.deduplicated, 1);
    assert_eq!(summary.outliers, 0);
    assert_eq!(summary.retries, 0);
    assert!(summary.is_balanced());

    let counts = query::borough_counts(pipeline.loader().connection()).unwrap();
    assert_eq!(counts.get(&Borough::Manhattan), Some(&4));
    assert_eq!(counts.get(&Borough::Bronx), Some(&3));
    assert_eq!(counts.get(&Borough::Brooklyn), Some(&3));
    assert_eq!(counts.get(&Borough::Queens), Some(&2));
    assert_eq!(counts.get(&Borough::StatenIsland), Some(&2));

    let checkpoint = pipeline.checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.offset, 21);
    assert_eq!(checkpoint.pages_fetched, 6);
    assert_eq!(pipeline.raw_sink().sequences().unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn every_stored_row_keeps_the_table_invariants() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_in(dir.path(), Box::new(fixture_source()));
    pipeline.run(&RunOptions::default()).await.unwrap();

    let rows = table(&pipeline);
    assert_eq!(rows.len(), 14);
    for row in &rows {
        assert!(row.sale_price > 0.0, "{:?}", row);
        assert!(Borough::ALL.contains(&row.borough));
        assert!((1..=12).contains(&row.sale_month));
        assert_eq!(row.sale_year, 2024);
        match row.gross_sqft {
            Some(sqft) => {
                assert!(sqft > 0.0);
                let expected = (row.sale_price / sqft * 100.0).round() / 100.0;
                assert_eq!(row.price_per_sqft, Some(expected));
            }
            None => assert_eq!(row.price_per_sqft, None),
        }
    }

    let chelsea = rows
        .iter()
        .find(|r| r.neighborhood.as_deref() == Some("CHELSEA"))
        .unwrap();
    assert_eq!(chelsea.sale_price, 2_000_000.0);
    assert_eq!(chelsea.price_per_sqft, Some(2000.0));
    assert_eq!(chelsea.address.as_deref(), Some("100 W 20TH ST, 4B"));
}

#[tokio::test]
async fn rerun_after_reset_produces_the_same_table() {
    let dir = TempDir::new().unwrap();

    let mut first = pipeline_in(dir.path(), Box::new(fixture_source()));
    let first_summary = first.run(&RunOptions::default()).await.unwrap();
    let first_rows = table(&first);
    first.reset().unwrap();
    drop(first);

    let mut second = pipeline_in(dir.path(), Box::new(fixture_source()));
    let second_summary = second.run(&RunOptions::default()).await.unwrap();

    assert_eq!(second_summary.pages_replayed, 0);
    assert_eq!(second_summary.pages_fetched, first_summary.pages_fetched);
    assert_eq!(table(&second), first_rows);
    assert!(second_summary.generation > first_summary.generation);
}

#[tokio::test]
async fn interrupted_run_resumes_to_the_same_table() {
    let reference_dir = TempDir::new().unwrap();
    let mut reference = pipeline_in(reference_dir.path(), Box::new(fixture_source()));
    reference.run(&RunOptions::default()).await.unwrap();
    let expected = table(&reference);

    let dir = TempDir::new().unwrap();
    let mut interrupted = pipeline_in(dir.path(), Box::new(fixture_source()));
    let options = RunOptions {
        max_pages: Some(2),
        ..RunOptions::default()
    };
    let partial = interrupted.run(&options).await.unwrap();
    assert_eq!(partial.status, RunStatus::Interrupted);
    assert_eq!(partial.pages_fetched, 2);
    assert!(table(&interrupted).is_empty());
    assert_eq!(interrupted.checkpoint().unwrap().unwrap().offset, 8);
    drop(interrupted);

    let mut resumed = pipeline_in(dir.path(), Box::new(fixture_source()));
    let summary = resumed.run(&RunOptions::default()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.pages_replayed, 2);
    assert_eq!(summary.pages_fetched, 4);
    assert_eq!(summary.raw_records, 21);
    assert_eq!(summary.accepted, 14);
    assert_eq!(table(&resumed), expected);
}

#[tokio::test]
async fn stop_during_fetch_lands_and_checkpoints_the_in_flight_page() {
    let dir = TempDir::new().unwrap();
    let stop = Arc::new(OnceLock::new());
    let source = StopDuringFetch {
        inner: fixture_source(),
        stop_offset: 4,
        stop: stop.clone(),
    };
    let mut pipeline = pipeline_in(dir.path(), Box::new(source));
    stop.set(pipeline.stop_handle()).unwrap();

    let summary = pipeline.run(&RunOptions::default()).await.unwrap();

    assert_eq!(summary.status, RunStatus::Interrupted);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.generation, None);
    let checkpoint = pipeline.checkpoint().unwrap().unwrap();
    assert_eq!((checkpoint.offset, checkpoint.pages_fetched), (8, 2));
    assert_eq!(pipeline.raw_sink().sequences().unwrap(), vec![0, 1]);
    assert_eq!(pipeline.raw_sink().read_page(1).unwrap().len(), PAGE_SIZE);
    assert!(table(&pipeline).is_empty());
    drop(pipeline);

    let mut resumed = pipeline_in(dir.path(), Box::new(fixture_source()));
    let summary = resumed.run(&RunOptions::default()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.pages_replayed, 2);
    assert_eq!(summary.accepted, 14);
}

#[tokio::test]
async fn page_landed_without_checkpoint_is_fetched_again() {
    let dir = TempDir::new().unwrap();
    let mut interrupted = pipeline_in(dir.path(), Box::new(fixture_source()));
    let options = RunOptions {
        max_pages: Some(1),
        ..RunOptions::default()
    };
    interrupted.run(&options).await.unwrap();

    // Crash between landing page 1 and saving its checkpoint.
    let stale: RawRecord = serde_json::from_str(r#"{"borough": "1", "sale_price": 1, "sale_date": "1999-01-01"}"#).unwrap();
    interrupted.raw_sink().append(1, &[stale]).unwrap();
    drop(interrupted);

    let mut resumed = pipeline_in(dir.path(), Box::new(fixture_source()));
    let summary = resumed.run(&RunOptions::default()).await.unwrap();

    assert_eq!(summary.pages_replayed, 1);
    assert_eq!(summary.accepted, 14);
    assert!(table(&resumed).iter().all(|r| r.sale_year == 2024));
}

#[tokio::test]
async fn throttled_page_is_retried_and_checkpointed_once() {
    let source = ScriptedSource::new(PAGE_SIZE as u64, 429, 3);
    let mut fetcher = PageFetcher::new(Box::new(source), RetryPolicy::immediate(5), PAGE_SIZE);
    let dir = TempDir::new().unwrap();
    let sink = RawSink::open(dir.path().join("raw")).unwrap();
    let store = MemoryCheckpointStore::new();

    let mut checkpoint = FetchCheckpoint::start();
    let mut pages = 0u64;
    let mut retries = 0u64;
    loop {
        let page = fetcher.fetch_and_land(&checkpoint, &sink, &store).await.unwrap();
        if !page.records.is_empty() {
            pages += 1;
        }
        retries += page.retries() as u64;
        checkpoint = page.checkpoint;
        if !page.has_more {
            break;
        }
    }

    assert_eq!(pages, 6);
    assert_eq!(store.saves(), pages);
    assert_eq!(retries, 3);
    assert_eq!(store.load().unwrap().unwrap().offset, 21);
}

#[tokio::test]
async fn run_counts_retries_and_completes() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_in(dir.path(), Box::new(ScriptedSource::new(8, 429, 3)));

    let summary = pipeline.run(&RunOptions::default()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.retries, 3);
    assert_eq!(summary.accepted, 14);
}

#[tokio::test]
async fn exhausted_throttling_fails_the_run_and_keeps_progress() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_in(dir.path(), Box::new(ScriptedSource::new(8, 429, 10)));

    let err = pipeline.run(&RunOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Fetch(FetchError::Throttled { attempts: 5 })
    ));
    assert!(table(&pipeline).is_empty());
    assert!(!pipeline.loader().has_open_generation());
    assert_eq!(pipeline.checkpoint().unwrap().unwrap().pages_fetched, 2);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_in(dir.path(), Box::new(ScriptedSource::new(0, 400, 1)));

    match pipeline.run(&RunOptions::default()).await {
        Err(PipelineError::Fetch(FetchError::Upstream { status, attempts, .. })) => {
            assert_eq!(status, Some(400));
            assert_eq!(attempts, 1);
        }
        other => panic!("expected an upstream failure, got {:?}", other.map(|s| s.status)),
    }
    assert!(pipeline.checkpoint().unwrap().is_none());
}

#[tokio::test]
async fn failed_run_leaves_previous_generation_live() {
    let dir = TempDir::new().unwrap();
    let mut first = pipeline_in(dir.path(), Box::new(fixture_source()));
    first.run(&RunOptions::default()).await.unwrap();
    let committed = table(&first);
    first.reset().unwrap();
    drop(first);

    let mut failing = pipeline_in(dir.path(), Box::new(ScriptedSource::new(12, 503, 10)));
    assert!(failing.run(&RunOptions::default()).await.is_err());
    assert_eq!(table(&failing), committed);
}

#[tokio::test]
async fn replay_only_rebuilds_from_landed_pages() {
    let dir = TempDir::new().unwrap();
    let mut first = pipeline_in(dir.path(), Box::new(fixture_source()));
    first.run(&RunOptions::default()).await.unwrap();
    let expected = table(&first);
    drop(first);

    // A source that would fail if contacted.
    let offline = ScriptedSource::new(0, 500, u32::MAX);
    let mut replay = pipeline_in(dir.path(), Box::new(offline));
    let options = RunOptions {
        replay_only: true,
        ..RunOptions::default()
    };
    let summary = replay.run(&options).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.pages_fetched, 0);
    assert_eq!(summary.pages_replayed, 6);
    assert_eq!(table(&replay), expected);
}

#[tokio::test]
async fn missing_landed_page_is_reported() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(FetchCheckpoint {
        offset: 4,
        total_fetched: 4,
        pages_fetched: 1,
        last_success_time: chrono::Utc::now(),
    }));
    let fetcher = PageFetcher::new(Box::new(fixture_source()), RetryPolicy::immediate(1), PAGE_SIZE);
    let mut pipeline = Pipeline::new(
        fetcher,
        RawSink::open(dir.path().join("raw")).unwrap(),
        Box::new(store.clone()),
        Loader::in_memory().unwrap(),
    );

    assert!(matches!(
        pipeline.run(&RunOptions::default()).await,
        Err(PipelineError::RawSink(_))
    ));
    assert_eq!(store.saves(), 0);
}

#[tokio::test]
async fn committed_table_exports_to_csv_and_parquet() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_in(dir.path(), Box::new(fixture_source()));
    pipeline.run(&RunOptions::default()).await.unwrap();
    drop(pipeline);

    let conn = query::open_reader(dir.path().join("sales.db")).unwrap();
    let rows = query::all_records(&conn).unwrap();

    let csv_path = dir.path().join("out/sales.csv");
    let written = export_records(&rows, &csv_path, ExportFormat::from_path(&csv_path)).unwrap();
    assert_eq!(written, 14);
    let text = std::fs::read_to_string(&csv_path).unwrap();
    assert_eq!(text.lines().count(), 15);

    let parquet_path = dir.path().join("out/sales.parquet");
    export_records(&rows, &parquet_path, ExportFormat::Parquet).unwrap();
    assert!(parquet_path.exists());
}
