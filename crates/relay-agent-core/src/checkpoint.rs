use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::state::ConversationState;
use crate::types::Phase;

/// Loop state persisted after a completed step, keyed by thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    /// Steps completed on this thread, counted across runs and resumes.
    pub step: u64,
    pub next: Phase,
    /// Label of the participant that owns `next` in a handoff loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    pub state: ConversationState,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl Checkpoint {
    pub fn new(
        thread_id: impl Into<String>,
        step: u64,
        next: Phase,
        participant: Option<String>,
        state: ConversationState,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            step,
            next,
            participant,
            state,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint IO error: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid thread id: {0:?}")]
    InvalidThreadId(String),
}

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// All checkpoints of a thread, oldest first.
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;
}

pub type CheckpointerRef = Arc<dyn Checkpointer>;

#[derive(Default)]
pub struct MemoryCheckpointer {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .and_then(|history| history.last())
            .cloned())
    }

    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut threads = self.threads.write().await;
        threads
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }
}

const TAIL_CHUNK: u64 = 64 * 1024;

/// One JSONL file per thread under `dir`; each line is a checkpoint.
///
/// Every line carries the full conversation, so a thread's file grows with
/// the square of its length. `load_latest` only reads the trailing line;
/// `history` parses the whole file.
pub struct FileCheckpointer {
    dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn thread_path(&self, thread_id: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
            && !thread_id.starts_with('.');
        if !valid {
            return Err(CheckpointError::InvalidThreadId(thread_id.to_string()));
        }
        Ok(self.dir.join(format!("{thread_id}.jsonl")))
    }

    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_lines(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let path = self.thread_path(thread_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(error.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<Checkpoint>(line).map_err(CheckpointError::from))
            .collect()
    }

    async fn read_last_line(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.thread_path(thread_id)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let mut start = file.metadata().await?.len();
        let mut tail: Vec<u8> = Vec::new();
        loop {
            let end = tail
                .iter()
                .rposition(|byte| !byte.is_ascii_whitespace())
                .map_or(0, |index| index + 1);
            let line_start = tail[..end].iter().rposition(|byte| *byte == b'\n');
            if line_start.is_some() || start == 0 {
                let line = &tail[line_start.map_or(0, |index| index + 1)..end];
                if line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(serde_json::from_slice(line)?));
            }

            let chunk = TAIL_CHUNK.min(start);
            start -= chunk;
            file.seek(SeekFrom::Start(start)).await?;
            let mut buffer = vec![0u8; chunk as usize];
            file.read_exact(&mut buffer).await?;
            buffer.extend_from_slice(&tail);
            tail = buffer;
        }
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        self.read_last_line(thread_id).await
    }

    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.thread_path(&checkpoint.thread_id)?;
        let mut line = serde_json::to_string(checkpoint)?;
        line.push('\n');

        let lock = self.thread_lock(&checkpoint.thread_id).await;
        let guard = lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        drop(guard);

        // Forget the lock once no other writer holds it.
        let mut locks = self.write_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&checkpoint.thread_id);
        }
        Ok(())
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.read_lines(thread_id).await
    }
}
