//! HTTP loader that pulls framed records from the controller.
//!
//! Each drain or watch call runs a retry engine over single fetches. A fetch
//! issues one GET, decodes the body frame by frame, writes every record
//! through to the cache and hands it to the callback unless it was already
//! delivered earlier in the same call.
//!
//! Resume relies on the controller redelivering records in identical order
//! from the start on every fresh connection. The call's [`Session`] counts
//! records per connection (`cur_count`) and remembers how many the caller has
//! already seen (`last_count`), so a reconnect fast-forwards over the
//! replayed prefix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::{race_timeout, Loader, LoaderError, ProcessFn};
use crate::cache::Cacher;
use crate::frame::FrameDecoder;
use crate::record::{Record, RecordType};

/// Header marking a request as long-lived.
pub const STREAM_HEADER: &str = "X-Stream";

/// Value of [`STREAM_HEADER`] for streaming requests.
pub const STREAM_VALUE: &str = "true";

/// Default number of consecutive attempts before a call fails.
const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default delay between attempts.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Timeout for one-shot (non-streaming) requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after each delivered record in streaming mode.
const DEFAULT_STREAM_PACING: Duration = Duration::from_secs(1);

/// Inactivity reset interval as a multiple of the retry delay.
const INACTIVITY_RESET_FACTOR: u32 = 2;

/// Builds the HTTP client used for one call.
pub type ClientFactory = Arc<dyn Fn() -> Result<Client, reqwest::Error> + Send + Sync>;

/// Maps a device to an endpoint URL.
pub type UrlResolver = Arc<dyn Fn(Uuid) -> Result<Url, url::ParseError> + Send + Sync>;

/// Retry and pacing settings for the connection engine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before the call fails
    pub max_attempts: u32,

    /// Delay between attempts
    pub delay: Duration,

    /// Timeout applied to one-shot requests
    pub request_timeout: Duration,

    /// Pause after each delivered record while streaming
    pub stream_pacing: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_pacing: DEFAULT_STREAM_PACING,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and delay.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Self::default()
        }
    }

    /// An attempt that runs at least this long resets the attempt counter.
    pub fn inactivity_reset(&self) -> Duration {
        self.delay * INACTIVITY_RESET_FACTOR
    }
}

/// Resume counters for one drain/watch call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Session {
    cur_count: u64,
    last_count: u64,
}

impl Session {
    /// Start counting a fresh connection from its first record.
    fn rewind(&mut self) {
        self.cur_count = 0;
    }

    /// Skip a record the caller has already seen, advancing the position.
    fn skip_replayed(&mut self) -> bool {
        if self.last_count > self.cur_count {
            self.cur_count += 1;
            true
        } else {
            false
        }
    }

    fn mark_delivered(&mut self) {
        self.cur_count += 1;
        self.last_count = self.cur_count;
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.last_count
    }
}

/// How a single fetch ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOutcome {
    /// The body ended; all currently available records were consumed.
    Drained,
    /// The callback asked to stop reading.
    Stopped,
}

/// Immutable configuration shared by a loader and its clones.
struct Endpoints {
    client_factory: ClientFactory,
    logs_url: UrlResolver,
    info_url: UrlResolver,
    policy: RetryPolicy,
}

/// Loader that pulls records from the controller over HTTP.
pub struct RemoteLoader {
    endpoints: Arc<Endpoints>,
    cache: Option<Arc<dyn Cacher>>,
    device: Option<Uuid>,
    first_load: Arc<AtomicBool>,
}

impl RemoteLoader {
    /// Create a loader with the default retry policy.
    pub fn new(client_factory: ClientFactory, logs_url: UrlResolver, info_url: UrlResolver) -> Self {
        debug!("HTTP remote loader init");
        Self {
            endpoints: Arc::new(Endpoints {
                client_factory,
                logs_url,
                info_url,
                policy: RetryPolicy::default(),
            }),
            cache: None,
            device: None,
            first_load: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Replace the retry policy.
    ///
    /// Clones made afterwards share the new policy.
    pub fn with_policy(self, policy: RetryPolicy) -> Self {
        let endpoints = Endpoints {
            client_factory: Arc::clone(&self.endpoints.client_factory),
            logs_url: Arc::clone(&self.endpoints.logs_url),
            info_url: Arc::clone(&self.endpoints.info_url),
            policy,
        };
        Self {
            endpoints: Arc::new(endpoints),
            ..self
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.endpoints.policy
    }

    /// Whether the connectivity probe is still pending for this instance.
    pub fn is_first_load(&self) -> bool {
        self.first_load.load(Ordering::Acquire)
    }

    /// Prepare an owned connection for one call.
    fn connect(&self, kind: RecordType) -> Result<Connection, LoaderError> {
        let device = self.device.ok_or(LoaderError::NoDevice)?;
        let url = match kind {
            RecordType::Logs => (self.endpoints.logs_url)(device)?,
            RecordType::Info => (self.endpoints.info_url)(device)?,
        };
        let client = (self.endpoints.client_factory)().map_err(LoaderError::Client)?;

        Ok(Connection {
            client,
            url,
            device,
            kind,
            policy: self.endpoints.policy.clone(),
            cache: self.cache.clone(),
            first_load: Arc::clone(&self.first_load),
        })
    }
}

#[async_trait]
impl Loader for RemoteLoader {
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
            endpoints: Arc::clone(&self.endpoints),
            cache: self.cache.clone(),
            device: None,
            first_load: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn process_existing(
        &self,
        mut process: ProcessFn,
        kind: RecordType,
    ) -> Result<(), LoaderError> {
        let connection = self.connect(kind)?;
        connection.repeatable(&mut process, false).await
    }

    async fn process_stream(
        &self,
        mut process: ProcessFn,
        kind: RecordType,
        timeout: Duration,
    ) -> Result<(), LoaderError> {
        let connection = self.connect(kind)?;
        let engine = async move { connection.repeatable(&mut process, true).await };
        race_timeout(engine, timeout).await
    }
}

/// Everything one call needs, owned so it can move into a background task.
///
/// The client lives exactly as long as the call; dropping it closes idle
/// pooled connections.
struct Connection {
    client: Client,
    url: Url,
    device: Uuid,
    kind: RecordType,
    policy: RetryPolicy,
    cache: Option<Arc<dyn Cacher>>,
    first_load: Arc<AtomicBool>,
}

impl Connection {
    /// Retry engine over single fetches.
    ///
    /// Fails once `max_attempts` consecutive attempts have failed. An attempt
    /// that ran for at least [`RetryPolicy::inactivity_reset`] before failing
    /// resets the counter, so only bursts of rapid failures exhaust the
    /// budget.
    async fn repeatable(&self, process: &mut ProcessFn, stream: bool) -> Result<(), LoaderError> {
        let mut session = Session::default();
        let max = self.policy.max_attempts;
        let mut attempt: u32 = 0;
        let mut last_error: Option<LoaderError> = None;

        while attempt < max {
            let reset_at = Instant::now() + self.policy.inactivity_reset();

            let result = if !stream {
                self.fetch(process, &mut session, false).await.map(|_| ())
            } else if self.first_load.load(Ordering::Acquire) {
                match self.probe().await {
                    Ok(()) => {
                        self.first_load.store(false, Ordering::Release);
                        attempt = 0;
                        continue;
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.stream_attempt(process, &mut session, attempt > 0).await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        error = %e,
                        url = %self.url,
                        delivered = session.delivered(),
                        "Error in controller request"
                    );
                    last_error = Some(e);
                }
            }

            if Instant::now() >= reset_at {
                debug!("Attempt outlived the inactivity interval, resetting attempt counter");
                attempt = 0;
            }

            info!("Attempt to re-establish connection with controller ({attempt}) of ({max})");
            sleep(self.policy.delay).await;
            attempt += 1;
        }

        let last_error = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        error!(attempts = max, last_error = %last_error, "All connection attempts failed");
        Err(LoaderError::AttemptsExhausted {
            attempts: max,
            last_error,
        })
    }

    /// One streaming attempt.
    ///
    /// On a retry the already available records are replayed first without
    /// the stream header. If the caller stops during that replay the call is
    /// complete and no long-lived connection is opened.
    async fn stream_attempt(
        &self,
        process: &mut ProcessFn,
        session: &mut Session,
        retrying: bool,
    ) -> Result<(), LoaderError> {
        if retrying {
            match self.fetch(process, session, false).await {
                Ok(FetchOutcome::Stopped) => return Ok(()),
                Ok(FetchOutcome::Drained) => {}
                Err(e) => debug!(error = %e, "Replay of existing records failed"),
            }
        }

        self.fetch(process, session, true).await.map(|_| ())
    }

    /// Connectivity probe: a one-shot fetch that discards every record.
    ///
    /// Runs on a throw-away session so the call's resume state is untouched.
    async fn probe(&self) -> Result<(), LoaderError> {
        let mut discard: ProcessFn = Box::new(|_| Ok(true));
        let mut session = Session::default();
        self.fetch(&mut discard, &mut session, false).await.map(|_| ())
    }

    /// Issue one GET and consume its body frame by frame.
    async fn fetch(
        &self,
        process: &mut ProcessFn,
        session: &mut Session,
        stream: bool,
    ) -> Result<FetchOutcome, LoaderError> {
        debug!(url = %self.url, stream, "Remote controller request");

        let mut request = self.client.get(self.url.clone());
        request = if stream {
            request.header(STREAM_HEADER, STREAM_VALUE)
        } else {
            request.timeout(self.policy.request_timeout)
        };

        let mut response = request.send().await.map_err(|source| LoaderError::Request {
            url: self.url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        session.rewind();
        let mut decoder = FrameDecoder::new(self.kind);

        loop {
            while let Some(record) = decoder.next_record()? {
                if !self.deliver(record, process, session, stream).await? {
                    return Ok(FetchOutcome::Stopped);
                }
            }

            let chunk = response.chunk().await.map_err(|source| LoaderError::Request {
                url: self.url.clone(),
                source,
            })?;
            match chunk {
                Some(bytes) => decoder.extend(&bytes),
                None => {
                    decoder.finish()?;
                    return Ok(FetchOutcome::Drained);
                }
            }
        }
    }

    /// Cache one record and offer it to the callback.
    ///
    /// Returns whether reading should continue.
    async fn deliver(
        &self,
        record: Record,
        process: &mut ProcessFn,
        session: &mut Session,
        stream: bool,
    ) -> Result<bool, LoaderError> {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .check_and_save(self.device, self.kind, record.as_bytes())
                .await
            {
                error!(error = %e, device = %self.device, kind = %self.kind, "Error in cache");
            }
        }

        if session.skip_replayed() {
            trace!(position = session.cur_count, "Suppressed replayed record");
            return Ok(true);
        }

        let result = process(record.as_bytes());
        if stream && !self.policy.stream_pacing.is_zero() {
            sleep(self.policy.stream_pacing).await;
        }
        session.mark_delivered();

        result.map_err(LoaderError::Callback)
    }
}
