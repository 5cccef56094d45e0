use thiserror::Error;

/// Failure to obtain a page from the remote source.
///
/// Both variants are fatal for a run. The checkpoint has already been
/// persisted up to the last landed page, so rerunning resumes cleanly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("source kept throttling after {attempts} attempts")]
    Throttled { attempts: u32 },

    #[error("upstream error (status {status:?}) after {attempts} attempts: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
        attempts: u32,
    },
}

impl FetchError {
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Throttled { attempts } | FetchError::Upstream { attempts, .. } => *attempts,
        }
    }
}

/// Failure while writing a generation into the analytical store.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("batch {batch} failed: {failed} row(s) violated constraints, first: {first_error}")]
    BatchFailed {
        batch: u64,
        failed: u64,
        first_error: String,
    },

    #[error("no staging generation is open")]
    NoGeneration,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Raw sink error: {0}")]
    RawSink(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Load(LoadError::Storage(err))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
