//! Write-through cache for decoded records.
//!
//! A [`Cacher`] is invoked once per decoded record, before the record is
//! offered to the caller. Cache durability is best-effort: loaders log cache
//! failures and keep delivering.

mod file;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::record::RecordType;

pub use file::FileCache;

/// Errors raised by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure while persisting a record.
    #[error("cache I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure reported by an external backend.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Persistence hook keyed by device and record type.
#[async_trait]
pub trait Cacher: Send + Sync {
    /// Persist one record's canonical bytes.
    async fn check_and_save(
        &self,
        device: Uuid,
        kind: RecordType,
        data: &[u8],
    ) -> Result<(), CacheError>;
}
