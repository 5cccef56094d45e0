//! Checkpoint Store - durable record of ingestion progress

use crate::error::{PipelineError, Result};
use crate::ingestion::connector::FetchCheckpoint;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Single-writer store for the fetch checkpoint.
pub trait CheckpointStore: Send + Sync {
    /// `None` means start of dataset.
    fn load(&self) -> Result<Option<FetchCheckpoint>>;

    /// Persist `checkpoint`. Refuses to move the offset backwards.
    fn save(&self, checkpoint: &FetchCheckpoint) -> Result<()>;

    /// Operator reset: forget all progress.
    fn reset(&self) -> Result<()>;
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Option<FetchCheckpoint>> {
        (**self).load()
    }

    fn save(&self, checkpoint: &FetchCheckpoint) -> Result<()> {
        (**self).save(checkpoint)
    }

    fn reset(&self) -> Result<()> {
        (**self).reset()
    }
}

fn ensure_forward(current: Option<&FetchCheckpoint>, next: &FetchCheckpoint) -> Result<()> {
    if let Some(current) = current {
        if next.offset < current.offset || next.pages_fetched < current.pages_fetched {
            return Err(PipelineError::Checkpoint(format!(
                "refusing to roll checkpoint back from offset {} (page {}) to offset {} (page {})",
                current.offset, current.pages_fetched, next.offset, next.pages_fetched
            )));
        }
    }
    Ok(())
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// contents: write a sibling temp file, fsync it, rename over the target.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    let tmp = parent.join(format!(".{}.tmp", file_name));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    #[cfg(unix)]
    {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// JSON checkpoint file.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<FetchCheckpoint>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = serde_json::from_str(&text).map_err(|e| {
            PipelineError::Checkpoint(format!("{} is unreadable: {}", self.path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &FetchCheckpoint) -> Result<()> {
        let current = self.load()?;
        ensure_forward(current.as_ref(), checkpoint)?;

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.path, &bytes)?;
        debug!(
            offset = checkpoint.offset,
            pages = checkpoint.pages_fetched,
            "Checkpoint saved"
        );
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Checkpoint reset");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    checkpoint: Option<FetchCheckpoint>,
    saves: u64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: FetchCheckpoint) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                checkpoint: Some(checkpoint),
                saves: 0,
            }),
        }
    }

    /// Number of successful `save` calls.
    pub fn saves(&self) -> u64 {
        self.lock().map(|s| s.saves).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::Checkpoint("checkpoint lock poisoned".to_string()))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<FetchCheckpoint>> {
        Ok(self.lock()?.checkpoint.clone())
    }

    fn save(&self, checkpoint: &FetchCheckpoint) -> Result<()> {
        let mut state = self.lock()?;
        ensure_forward(state.checkpoint.as_ref(), checkpoint)?;
        state.checkpoint = Some(checkpoint.clone());
        state.saves += 1;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.lock()?.checkpoint = None;
        Ok(())
    }
}
