//! Pipeline configuration
//!
//! Values are layered: defaults, an optional JSON file, `NYC_SALES_*`
//! environment variables (a `.env` file is honoured by the binary), and
//! finally command-line overrides applied by the caller.

use crate::error::{PipelineError, Result};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// NYC Citywide Rolling Calendar Sales.
pub const DEFAULT_DATASET_ID: &str = "usep-8jbt";
pub const DEFAULT_BASE_URL: &str = "https://data.cityofnewyork.us/resource";

/// Records per request (API maximum).
pub const DEFAULT_PAGE_SIZE: usize = 50_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub base_url: String,
    pub dataset_id: String,

    /// Socrata app token, sent as `X-App-Token` for higher rate limits
    pub app_token: Option<String>,

    pub page_size: usize,
    pub request_timeout_ms: u64,

    /// Self-imposed gap between two requests, independent of server throttling
    pub min_request_interval_ms: u64,

    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Fence width in IQRs for flagging price-per-sqft outliers
    pub outlier_iqr_multiple: f64,

    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,

    pub data_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            dataset_id: DEFAULT_DATASET_ID.to_string(),
            app_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_ms: 30_000,
            min_request_interval_ms: 500,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            outlier_iqr_multiple: 3.0,
            start_date: None,
            end_date: None,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Apply `NYC_SALES_*` environment overrides on top of `self`.
    pub fn with_env(mut self) -> Result<Self> {
        if let Ok(v) = env::var("NYC_SALES_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = env::var("NYC_SALES_DATASET_ID") {
            self.dataset_id = v;
        }
        if let Ok(v) = env::var("SOCRATA_APP_TOKEN") {
            if !v.trim().is_empty() {
                self.app_token = Some(v);
            }
        }
        if let Ok(v) = env::var("NYC_SALES_PAGE_SIZE") {
            self.page_size = parse_env("NYC_SALES_PAGE_SIZE", &v)?;
        }
        if let Ok(v) = env::var("NYC_SALES_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_env("NYC_SALES_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = env::var("NYC_SALES_MIN_INTERVAL_MS") {
            self.min_request_interval_ms = parse_env("NYC_SALES_MIN_INTERVAL_MS", &v)?;
        }
        if let Ok(v) = env::var("NYC_SALES_MAX_ATTEMPTS") {
            self.max_attempts = parse_env("NYC_SALES_MAX_ATTEMPTS", &v)?;
        }
        if let Ok(v) = env::var("NYC_SALES_OUTLIER_IQR_MULTIPLE") {
            self.outlier_iqr_multiple = parse_env("NYC_SALES_OUTLIER_IQR_MULTIPLE", &v)?;
        }
        if let Ok(v) = env::var("NYC_SALES_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        Ok(self)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(PipelineError::Config("page_size must be positive".to_string()));
        }
        // A larger page comes back short and reads as the end of the dataset.
        if self.page_size > DEFAULT_PAGE_SIZE {
            return Err(PipelineError::Config(format!(
                "page_size {} exceeds the API maximum of {}",
                self.page_size, DEFAULT_PAGE_SIZE
            )));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config("max_attempts must be at least 1".to_string()));
        }
        if !(self.outlier_iqr_multiple.is_finite() && self.outlier_iqr_multiple >= 0.0) {
            return Err(PipelineError::Config(format!(
                "outlier_iqr_multiple must be a non-negative number, got {}",
                self.outlier_iqr_multiple
            )));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(PipelineError::Config(
                "backoff_base_ms cannot exceed backoff_max_ms".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(PipelineError::Config(format!(
                    "start_date {} is after end_date {}",
                    start, end
                )));
            }
        }
        if let Some(start) = self.start_date {
            let today = Utc::now().date_naive();
            if start > today {
                return Err(PipelineError::Config(format!(
                    "start_date {} is in the future (today is {})",
                    start, today
                )));
            }
        }
        Ok(())
    }

    /// Restrict the run to sales from the last `days` days before `today`.
    pub fn with_last_days(mut self, days: u32, today: NaiveDate) -> Result<Self> {
        let start = today.checked_sub_days(Days::new(u64::from(days))).ok_or_else(|| {
            PipelineError::Config(format!("--days {} reaches before the earliest date", days))
        })?;
        self.start_date = Some(start);
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("sales.db")
    }

    pub fn resource_url(&self) -> String {
        format!("{}/{}.json", self.base_url.trim_end_matches('/'), self.dataset_id)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{} has an invalid value: {:?}", name, value)))
}
