//! Loader over per-device record directories.
//!
//! Each file holds one or more framed JSON messages. Files are read in name
//! order; streaming polls the directory for names it has not seen yet.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use super::{race_timeout, Loader, LoaderError, PathResolver, ProcessFn};
use crate::cache::Cacher;
use crate::frame::FrameDecoder;
use crate::record::RecordType;

/// Default interval between directory scans while streaming.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Loader that reads record files written by a local controller.
pub struct FileLoader {
    logs_dir: PathResolver,
    info_dir: PathResolver,
    poll_interval: Duration,
    cache: Option<Arc<dyn Cacher>>,
    device: Option<Uuid>,
}

impl FileLoader {
    pub fn new(logs_dir: PathResolver, info_dir: PathResolver) -> Self {
        debug!("File loader init");
        Self {
            logs_dir,
            info_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cache: None,
            device: None,
        }
    }

    /// Set the directory scan interval used by `process_stream`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn reader(&self, kind: RecordType) -> Result<DirReader, LoaderError> {
        let device = self.device.ok_or(LoaderError::NoDevice)?;
        let dir = match kind {
            RecordType::Logs => (self.logs_dir)(device),
            RecordType::Info => (self.info_dir)(device),
        };
        Ok(DirReader {
            dir,
            device,
            kind,
            cache: self.cache.clone(),
            seen: HashSet::new(),
        })
    }
}

#[async_trait]
impl Loader for FileLoader {
    fn set_uuid(&mut self, device: Uuid) {
        self.device = Some(device);
    }

    fn device(&self) -> Option<Uuid> {
        self.device
    }

    fn set_remote_cache(&mut self, cache: Arc<dyn Cacher>) {
        self.cache = Some(cache);
    }

    fn clone_loader(&self) -> Box<dyn Loader> {
        Box::new(Self {
            logs_dir: Arc::clone(&self.logs_dir),
            info_dir: Arc::clone(&self.info_dir),
            poll_interval: self.poll_interval,
            cache: self.cache.clone(),
            device: None,
        })
    }

    async fn process_existing(
        &self,
        mut process: ProcessFn,
        kind: RecordType,
    ) -> Result<(), LoaderError> {
        let mut reader = self.reader(kind)?;
        reader.scan(&mut process).await.map(|_| ())
    }

    async fn process_stream(
        &self,
        process: ProcessFn,
        kind: RecordType,
        timeout: Duration,
    ) -> Result<(), LoaderError> {
        let reader = self.reader(kind)?;
        race_timeout(follow(reader, process, self.poll_interval), timeout).await
    }
}

/// Scan repeatedly until the callback stops reading.
async fn follow(
    mut reader: DirReader,
    mut process: ProcessFn,
    poll_interval: Duration,
) -> Result<(), LoaderError> {
    while reader.scan(&mut process).await? {
        tokio::time::sleep(poll_interval).await;
    }
    Ok(())
}

/// Reading state for one call.
struct DirReader {
    dir: PathBuf,
    device: Uuid,
    kind: RecordType,
    cache: Option<Arc<dyn Cacher>>,
    seen: HashSet<PathBuf>,
}

impl DirReader {
    /// Process every file not seen yet. Returns whether reading should go on.
    async fn scan(&mut self, process: &mut ProcessFn) -> Result<bool, LoaderError> {
        for path in self.new_files().await? {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|source| io_error(&path, source))?;
            self.seen.insert(path);

            let mut decoder = FrameDecoder::new(self.kind);
            decoder.extend(&data);
            while let Some(record) = decoder.next_record()? {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache
                        .check_and_save(self.device, self.kind, record.as_bytes())
                        .await
                    {
                        error!(error = %e, device = %self.device, kind = %self.kind, "Error in cache");
                    }
                }
                if !process(record.as_bytes()).map_err(LoaderError::Callback)? {
                    return Ok(false);
                }
            }
            decoder.finish()?;
        }
        Ok(true)
    }

    /// Regular files in the directory that have not been processed, in name
    /// order. A missing directory has no files yet.
    async fn new_files(&self) -> Result<Vec<PathBuf>, LoaderError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&self.dir, source)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(&self.dir, source))?
        {
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file && !self.seen.contains(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LoaderError {
    LoaderError::Io {
        path: path.to_path_buf(),
        source,
    }
}
