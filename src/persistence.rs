//! Durable snapshot + operation log boundary.
//!
//! Storage shape is opaque to the rest of the core: a room's state is always
//! `snapshot + tail`, replayable in order. This implementation is a
//! filesystem store — one JSON snapshot file plus a newline-delimited JSON
//! tail log per room — with blocking `std::fs` writes run on a dedicated
//! blocking thread.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::ot::Operation;

/// A document snapshot: enough, with its tail log, to reconstruct a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub content: String,
    pub version: u64,
}

/// What [`Persistence::load_room`] returns for an existing room.
pub struct LoadedRoom {
    pub snapshot: Snapshot,
    pub tail: Vec<Operation>,
}

/// The persistence interface consumed by rooms.
///
/// Implementations must be safe for concurrent use across rooms — this is
/// the one resource shared across the otherwise per-room-isolated world.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    /// Load a room's last snapshot and tail log, or `None` if it has never
    /// been persisted.
    async fn load_room(&self, room_id: &str) -> Result<Option<LoadedRoom>>;

    /// Append one accepted op to the room's tail log.
    ///
    /// Must be durable-before-ack only when the room is configured
    /// `durable=true`; callers decide whether to await this or spawn
    /// it fire-and-forget.
    async fn append_op(&self, room_id: &str, op: &Operation) -> Result<()>;

    /// Write a new snapshot and compact the tail log to entries after it.
    async fn snapshot(&self, room_id: &str, content: &str, version: u64) -> Result<()>;
}

fn sanitize_room_id(room_id: &str) -> String {
    room_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// A [`Persistence`] implementation backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct FsPersistence {
    root: PathBuf,
}

impl FsPersistence {
    /// Open (creating if needed) a persistence root directory.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating persistence root {}", root.display()))?;
        Ok(Self { root })
    }

    /// Open a persistence root in a fresh temporary directory, for tests.
    pub async fn temporary() -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("collab_server_{:x}", rand::random::<u64>()));
        Self::new(dir).await
    }

    fn snapshot_path(&self, room_id: &str) -> PathBuf {
        self.room_dir(room_id).join("snapshot.json")
    }

    fn tail_path(&self, room_id: &str) -> PathBuf {
        self.room_dir(room_id).join("tail.jsonl")
    }

    fn room_dir(&self, room_id: &str) -> PathBuf {
        self.root.join(sanitize_room_id(room_id))
    }

    async fn ensure_room_dir(&self, room_id: &str) -> Result<()> {
        fs::create_dir_all(self.room_dir(room_id)).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Persistence for FsPersistence {
    async fn load_room(&self, room_id: &str) -> Result<Option<LoadedRoom>> {
        let snapshot_path = self.snapshot_path(room_id);
        if !snapshot_path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&snapshot_path)
            .await
            .context("reading snapshot")?;
        let snapshot: Snapshot = serde_json::from_str(&raw).context("parsing snapshot")?;

        let tail_path = self.tail_path(room_id);
        let tail = if tail_path.exists() {
            let raw = fs::read_to_string(&tail_path)
                .await
                .context("reading tail log")?;
            let mut ops = Vec::new();
            for (line_no, line) in raw.lines().enumerate() {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Operation>(line) {
                    Ok(op) => ops.push(op),
                    Err(e) => warn!("skipping malformed tail entry {room_id}:{line_no}: {e}"),
                }
            }
            ops
        } else {
            Vec::new()
        };

        Ok(Some(LoadedRoom { snapshot, tail }))
    }

    async fn append_op(&self, room_id: &str, op: &Operation) -> Result<()> {
        self.ensure_room_dir(room_id).await?;
        let path = self.tail_path(room_id);
        let line = serde_json::to_string(op).context("serializing op")?;
        let op = op.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening tail log for {}", path.display()))?;
            writeln!(file, "{line}").context("appending to tail log")?;
            drop(op);
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn snapshot(&self, room_id: &str, content: &str, version: u64) -> Result<()> {
        self.ensure_room_dir(room_id).await?;
        let snapshot_path = self.snapshot_path(room_id);
        let tail_path = self.tail_path(room_id);
        let snapshot = Snapshot {
            content: content.to_string(),
            version,
        };
        tokio::task::spawn_blocking(move || -> Result<()> {
            let json = serde_json::to_string_pretty(&snapshot)?;
            std::fs::write(&snapshot_path, json).context("writing snapshot")?;
            // Compaction: the new snapshot already reflects every op up to
            // `version`, so the tail log since the last snapshot is dead.
            std::fs::write(&tail_path, b"").context("truncating tail log")?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

impl Drop for FsPersistence {
    fn drop(&mut self) {
        if self.root.parent() == Some(std::env::temp_dir().as_path()) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}
