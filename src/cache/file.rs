//! Directory-tree cache: one JSON file per record.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::trace;
use uuid::Uuid;

use super::{CacheError, Cacher};
use crate::loader::PathResolver;
use crate::record::RecordType;

/// Cache that writes records under per-device directories.
///
/// File names sort in write order, so a [`crate::loader::FileLoader`]
/// pointed at the same directories replays the cache in arrival order.
pub struct FileCache {
    logs_dir: PathResolver,
    info_dir: PathResolver,
    seq: AtomicU64,
}

impl FileCache {
    pub fn new(logs_dir: PathResolver, info_dir: PathResolver) -> Self {
        Self {
            logs_dir,
            info_dir,
            seq: AtomicU64::new(0),
        }
    }

    /// Directory that holds records of `kind` for `device`.
    pub fn dir_for(&self, device: Uuid, kind: RecordType) -> PathBuf {
        match kind {
            RecordType::Logs => (self.logs_dir)(device),
            RecordType::Info => (self.info_dir)(device),
        }
    }

    fn next_file_name(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq:08}.json", Utc::now().format("%Y%m%dT%H%M%S%.9fZ"))
    }
}

#[async_trait]
impl Cacher for FileCache {
    async fn check_and_save(
        &self,
        device: Uuid,
        kind: RecordType,
        data: &[u8],
    ) -> Result<(), CacheError> {
        let dir = self.dir_for(device, kind);
        tokio::fs::create_dir_all(&dir).await.map_err(|source| io_error(&dir, source))?;

        let path = dir.join(self.next_file_name());
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| io_error(&path, source))?;

        trace!(path = %path.display(), bytes = data.len(), "Cached record");
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}
