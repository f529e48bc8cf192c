//! Loader contract and its implementations.
//!
//! A [`Loader`] retrieves records for one bound device, either draining what
//! is currently available ([`Loader::process_existing`]) or additionally
//! waiting for new records ([`Loader::process_stream`]). Records are handed to
//! a per-record callback whose return value decides whether reading goes on.
//!
//! - [`RemoteLoader`]: pulls from the controller over HTTP with retry and resume
//! - [`FileLoader`]: reads record files from per-device directories
//!
//! Key-value-stream loaders are provided externally through
//! [`crate::controller::KvStreamBackend`].

mod file;
mod remote;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::cache::Cacher;
use crate::frame::FrameError;
use crate::record::RecordType;

pub use file::FileLoader;
pub use remote::{
    ClientFactory, RemoteLoader, RetryPolicy, UrlResolver, STREAM_HEADER, STREAM_VALUE,
};

/// Boxed error returned by record callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-record callback.
///
/// Receives the canonical bytes of one record and returns whether the loader
/// should keep reading.
pub type ProcessFn = Box<dyn FnMut(&[u8]) -> Result<bool, BoxError> + Send>;

/// Maps a device to a directory.
pub type PathResolver = Arc<dyn Fn(Uuid) -> PathBuf + Send + Sync>;

/// Errors returned by loaders.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// `set_uuid` was never called on this loader.
    #[error("loader is not bound to a device")]
    NoDevice,

    /// An endpoint URL could not be built.
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The HTTP client could not be constructed.
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request failed before a response arrived or while reading the body.
    #[error("error reading URL {url}: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    /// The controller answered with a non-success status.
    #[error("controller returned HTTP {status} for {url}")]
    Status { url: Url, status: u16 },

    /// The response body could not be decoded.
    #[error("process: {0}")]
    Frame(#[from] FrameError),

    /// The record callback returned an error.
    #[error("record callback failed: {0}")]
    Callback(#[source] BoxError),

    /// The retry budget ran out without an intervening inactivity reset.
    #[error("all connection attempts failed ({attempts} attempts, last error: {last_error})")]
    AttemptsExhausted { attempts: u32, last_error: String },

    /// `process_stream` timed out before the engine reported an outcome.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The background streaming task panicked or was cancelled.
    #[error("stream task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Filesystem failure in a file-backed loader.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoaderError {
    /// Whether this error should consume a retry attempt rather than end the
    /// call immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LoaderError::NoDevice | LoaderError::InvalidUrl(_) | LoaderError::Client(_)
        )
    }
}

/// Capability set shared by every record source.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Bind the loader to a device.
    fn set_uuid(&mut self, device: Uuid);

    /// Currently bound device, if any.
    fn device(&self) -> Option<Uuid>;

    /// Attach a write-through cache.
    fn set_remote_cache(&mut self, cache: Arc<dyn Cacher>);

    /// Independent instance sharing only immutable configuration and the
    /// cache. The copy starts unbound.
    fn clone_loader(&self) -> Box<dyn Loader>;

    /// Drain all currently retrievable records in arrival order.
    async fn process_existing(
        &self,
        process: ProcessFn,
        kind: RecordType,
    ) -> Result<(), LoaderError>;

    /// Drain existing records, then keep waiting for new ones.
    ///
    /// A zero `timeout` waits indefinitely.
    async fn process_stream(
        &self,
        process: ProcessFn,
        kind: RecordType,
        timeout: Duration,
    ) -> Result<(), LoaderError>;
}

/// Spawned engine task, aborted when dropped.
///
/// Dropping a `process_stream` future therefore stops the engine instead of
/// leaving it to retry in the background.
struct AbortOnDrop(JoinHandle<Result<(), LoaderError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run a loader engine as a background task raced against an optional
/// timeout.
///
/// The task's join handle is the single completion slot. When the timeout
/// wins, or the caller stops awaiting, the task is aborted, which drops its
/// HTTP client and any idle connections with it.
pub(crate) async fn race_timeout<F>(engine: F, timeout: Duration) -> Result<(), LoaderError>
where
    F: Future<Output = Result<(), LoaderError>> + Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(engine));
    if timeout.is_zero() {
        return (&mut task.0).await?;
    }

    match tokio::time::timeout(timeout, &mut task.0).await {
        Ok(joined) => joined?,
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Stream timed out");
            Err(LoaderError::Timeout(timeout))
        }
    }
}
