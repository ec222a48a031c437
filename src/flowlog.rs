//! Per-task append-only event journal (§4.5).
//!
//! A process-wide registry hands out one `FlowLogHandle` per task id, using
//! the same get-or-create/double-checked-lock shape the teacher's
//! `SessionManager` uses for per-user sessions, retargeted from user ids to
//! task ids.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FlowLogError {
    #[error("io error writing flow log: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowLogError>;

#[derive(Debug, Clone, Copy)]
pub enum Stream {
    Webhook,
    Queue,
    AgentOutput,
    Service,
}

impl Stream {
    fn file_name(self) -> &'static str {
        match self {
            Stream::Webhook => "02-webhook-flow.jsonl",
            Stream::Queue => "03-queue-flow.jsonl",
            Stream::AgentOutput => "04-agent-output.jsonl",
            Stream::Service => "05-service-flow.jsonl",
        }
    }
}

pub struct FlowLogHandle {
    dir: PathBuf,
}

impl FlowLogHandle {
    async fn open(root: &Path, task_id: Uuid) -> Result<Self> {
        let dir = root.join(task_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Append one JSON-serializable event to a stream, fsyncing after the
    /// write so a crash doesn't lose the last line (§4.5).
    pub async fn append(&self, stream: Stream, event: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let path = self.dir.join(stream.file_name());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomically (re)write a whole-file JSON document via tempfile + rename,
    /// never a direct `File::create` over the target path.
    pub async fn write_json(&self, file_name: &str, value: &impl Serialize) -> Result<()> {
        let dir = self.dir.clone();
        let file_name = file_name.to_string();
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::task::spawn_blocking(move || -> std::result::Result<(), std::io::Error> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            use std::io::Write;
            tmp.write_all(&bytes)?;
            tmp.flush()?;
            tmp.persist(dir.join(&file_name))
                .map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .expect("blocking write task panicked")?;
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }
}

/// Process-wide registry of open handles, keyed by task id.
pub struct FlowLog {
    root: PathBuf,
    handles: RwLock<HashMap<Uuid, Arc<FlowLogHandle>>>,
}

impl FlowLog {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            handles: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get_or_create(&self, task_id: Uuid) -> Result<Arc<FlowLogHandle>> {
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(&task_id) {
                return Ok(Arc::clone(handle));
            }
        }

        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(&task_id) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(FlowLogHandle::open(&self.root, task_id).await?);
        handles.insert(task_id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop the in-memory handle once a task reaches a terminal state; the
    /// files on disk remain.
    pub async fn release(&self, task_id: Uuid) {
        self.handles.write().await.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_and_write_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlowLog::new(dir.path());
        let task_id = Uuid::new_v4();

        let handle = log.get_or_create(task_id).await.unwrap();
        handle
            .append(Stream::Webhook, &json!({"event": "received"}))
            .await
            .unwrap();
        handle
            .write_json("metadata.json", &json!({"status": "queued"}))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(handle.directory().join("02-webhook-flow.jsonl"))
            .await
            .unwrap();
        assert!(contents.contains("received"));

        let meta = tokio::fs::read_to_string(handle.directory().join("metadata.json"))
            .await
            .unwrap();
        assert!(meta.contains("queued"));
    }

    #[tokio::test]
    async fn get_or_create_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlowLog::new(dir.path());
        let task_id = Uuid::new_v4();
        let h1 = log.get_or_create(task_id).await.unwrap();
        let h2 = log.get_or_create(task_id).await.unwrap();
        assert!(Arc::ptr_eq(&h1, &h2));
    }
}
