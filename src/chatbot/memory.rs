//! Bounded conversation memory persisted to JSON files.
//!
//! Each history file holds `{"chat_history": [{"role": .., "content": ..}, ...]}`
//! with at most `limit` entries. Saves go through a sibling temp file and a
//! rename so a crash never leaves a half-written history behind.

use crate::chatbot::message::{window, History, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Whether all chats share one history or each chat gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope {
    Shared,
    PerChat,
}

impl FromStr for MemoryScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" | "global" => Ok(MemoryScope::Shared),
            "per_chat" | "per-chat" | "chat" => Ok(MemoryScope::PerChat),
            other => Err(format!("unknown memory scope '{other}' (expected shared or per_chat)")),
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Read { path: PathBuf, source: std::io::Error },
    /// The file exists but does not hold a valid history.
    Corrupt { path: PathBuf, source: serde_json::Error },
    /// The history could not be serialized; nothing was written.
    Encode { path: PathBuf, source: serde_json::Error },
    Write { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "failed to read memory '{}': {}", path.display(), source),
            Self::Corrupt { path, source } => write!(f, "corrupt memory file '{}': {}", path.display(), source),
            Self::Encode { path, source } => write!(f, "failed to encode memory '{}': {}", path.display(), source),
            Self::Write { path, source } => write!(f, "failed to write memory '{}': {}", path.display(), source),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => Some(source),
            Self::Corrupt { source, .. } | Self::Encode { source, .. } => Some(source),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MemoryState {
    #[serde(default)]
    chat_history: History,
}

/// File-backed conversation store.
///
/// Callers take [`ConversationStore::lock`] for the whole load/append/save
/// cycle; the store itself does not cache anything between cycles.
pub struct ConversationStore {
    path: PathBuf,
    scope: MemoryScope,
    limit: usize,
    locks: std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    pub fn new(path: impl Into<PathBuf>, scope: MemoryScope, limit: usize) -> Self {
        Self {
            path: path.into(),
            scope,
            limit,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Key used for locking; every chat maps to one key in shared scope.
    fn key(&self, conversation_id: i64) -> i64 {
        match self.scope {
            MemoryScope::Shared => 0,
            MemoryScope::PerChat => conversation_id,
        }
    }

    /// File holding the history for a conversation.
    pub fn path_for(&self, conversation_id: i64) -> PathBuf {
        match self.scope {
            MemoryScope::Shared => self.path.clone(),
            MemoryScope::PerChat => {
                let stem = self
                    .path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "memory".to_string());
                let name = match self.path.extension() {
                    Some(ext) => format!("{stem}-{conversation_id}.{}", ext.to_string_lossy()),
                    None => format!("{stem}-{conversation_id}"),
                };
                self.path.with_file_name(name)
            }
        }
    }

    /// Exclusive access to one conversation's history until the guard drops.
    ///
    /// Entries nobody holds or waits on are pruned here, so the map only
    /// tracks conversations with a cycle in flight.
    pub async fn lock(&self, conversation_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(self.key(conversation_id)).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of conversation locks currently tracked.
    pub fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Read the persisted history. A missing file is an empty history.
    pub async fn load(&self, conversation_id: i64) -> Result<History, StoreError> {
        let path = self.path_for(conversation_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No memory at {:?}, starting fresh", path);
                return Ok(History::new());
            }
            Err(e) => return Err(StoreError::Read { path, source: e }),
        };

        let state: MemoryState =
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupt { path: path.clone(), source: e })?;

        debug!("Loaded memory from {:?} ({} messages)", path, state.chat_history.len());
        Ok(state.chat_history)
    }

    /// Overwrite the persisted history with the trailing window of `history`.
    pub async fn save(&self, conversation_id: i64, history: &[Message]) -> Result<(), StoreError> {
        let path = self.path_for(conversation_id);
        let state = MemoryState {
            chat_history: window(history, self.limit).to_vec(),
        };
        let json =
            serde_json::to_string(&state).map_err(|e| StoreError::Encode { path: path.clone(), source: e })?;

        write_atomic(&path, json.as_bytes())
            .await
            .map_err(|e| StoreError::Write { path: path.clone(), source: e })?;

        debug!("💾 Saved memory to {:?} ({} messages)", path, state.chat_history.len());
        Ok(())
    }

    /// Append `message`, dropping the oldest entries beyond the window.
    pub fn append_and_bound(&self, mut history: History, message: Message) -> History {
        history.push(message);
        if history.len() > self.limit {
            history.drain(..history.len() - self.limit);
        }
        history
    }

    /// Forget a conversation. Clearing an absent history succeeds.
    pub async fn clear(&self, conversation_id: i64) -> Result<(), StoreError> {
        let path = self.path_for(conversation_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("🧹 Cleared memory {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Write { path, source: e }),
        }
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp_path, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        tokio::fs::remove_file(&tmp_path).await.ok();
        return Err(e);
    }
    Ok(())
}
