//! Append-only snapshot storage keyed by capture time.
//!
//! Files are named `produce_<YYYYMMDD_HHMMSS>.jpg`; a second capture in the
//! same second gets a `_<n>` suffix. Existing files are never overwritten.
//! Bytes are staged in a hidden `.part` file and only published under the
//! final name once fully written, so a failed write never shows up in `list`.

use crate::error::KernelResult;
use serde::Serialize;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const PREFIX: &str = "produce_";
const EXTENSION: &str = "jpg";
/// `YYYYMMDD_HHMMSS`
const STAMP_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub size_bytes: u64,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub async fn open<P: AsRef<Path>>(dir: P) -> KernelResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub async fn store(&self, bytes: &[u8], captured_at: OffsetDateTime) -> KernelResult<SnapshotInfo> {
        let stamp = captured_at
            .format(format_description!("[year][month][day]_[hour][minute][second]"))
            .unwrap_or_else(|_| captured_at.unix_timestamp().to_string());

        let staged = self.dir.join(format!(".incoming-{}.part", Uuid::new_v4()));
        if let Err(e) = write_staged(&staged, bytes).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e.into());
        }
        let published = self.publish(&staged, &stamp).await;
        let _ = fs::remove_file(&staged).await;
        let name = published?;
        Ok(SnapshotInfo { name, size_bytes: bytes.len() as u64 })
    }

    /// Links the staged file under the first free name; `hard_link` fails on existing targets.
    async fn publish(&self, staged: &Path, stamp: &str) -> std::io::Result<String> {
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("{PREFIX}{stamp}.{EXTENSION}")
            } else {
                format!("{PREFIX}{stamp}_{suffix}.{EXTENSION}")
            };
            match fs::hard_link(staged, self.dir.join(&name)).await {
                Ok(()) => return Ok(name),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Snapshots newest first.
    pub async fn list(&self) -> KernelResult<Vec<SnapshotInfo>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let is_snapshot = name.starts_with(PREFIX)
                && path.extension().and_then(|e| e.to_str()) == Some(EXTENSION);
            if !is_snapshot {
                continue;
            }
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            out.push(SnapshotInfo { name: name.to_string(), size_bytes });
        }
        out.sort_by_cached_key(|s| Reverse(sort_key(&s.name)));
        Ok(out)
    }
}

async fn write_staged(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// (stamp, collision suffix); suffixes compare numerically so `_10` follows `_9`.
fn sort_key(name: &str) -> (String, u32) {
    let rest = name
        .strip_prefix(PREFIX)
        .and_then(|n| n.strip_suffix(".jpg"))
        .unwrap_or(name);
    match rest.get(STAMP_LEN..).and_then(|tail| tail.strip_prefix('_')) {
        Some(n) => (rest[..STAMP_LEN].to_string(), n.parse().unwrap_or(0)),
        None => (rest.to_string(), 0),
    }
}
