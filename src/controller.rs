//! Controller context: picks and wires loader and cache variants.
//!
//! The context is built once from [`Config`]. Every call to
//! [`ControllerCtx::loader`] produces a fresh, fully composed loader:
//!
//! 1. choose the record source (local files, remote HTTP, or a key-value
//!    stream backend)
//! 2. if caching is enabled, attach a cache (files or key-value streams)
//!    under a separate prefix so cached artefacts never alias live data
//!
//! Key-value stream loaders and caches are external collaborators and are
//! plugged in through [`KvStreamBackend`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Certificate, Client};
use thiserror::Error;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::cache::{Cacher, FileCache};
use crate::config::Config;
use crate::loader::{
    ClientFactory, FileLoader, Loader, PathResolver, RemoteLoader, RetryPolicy, UrlResolver,
};
use crate::record::RecordType;

/// Host used when the key-value store URL names none.
pub const DEFAULT_REDIS_HOST: &str = "localhost";

/// Port used when the key-value store URL names none.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Prefix of the controller's per-device logs stream.
pub const LOGS_STREAM_PREFIX: &str = "LOGS_EVE_";

/// Prefix of the controller's per-device info stream.
pub const INFO_STREAM_PREFIX: &str = "INFO_EVE_";

/// Cache prefix used when the configured one is empty.
pub const DEFAULT_CACHE_PREFIX: &str = "cache";

const USER_AGENT: &str = concat!("edge-controller/", env!("CARGO_PKG_VERSION"));

/// Errors raised while wiring loaders and caches.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The key-value store URL could not be parsed.
    #[error("cannot parse key-value store url '{url}': {reason}")]
    InvalidRedisUrl { url: String, reason: String },

    /// The controller base URL could not be parsed.
    #[error("invalid controller url '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The CA certificate could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A key-value variant was selected but no backend is registered.
    #[error("no key-value stream backend registered for the {0}")]
    BackendUnavailable(&'static str),

    /// The key-value backend failed to build a loader or cache.
    #[error("key-value stream backend error: {0}")]
    Backend(String),
}

/// Connection parameters for the key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisTarget {
    /// `host:port`
    pub addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
}

/// Parse `redis://[user[:password]@]host:port[/databaseID]`.
///
/// Missing host and port fall back to [`DEFAULT_REDIS_HOST`] and
/// [`DEFAULT_REDIS_PORT`]; a missing database is 0. A lone user field is the
/// password (`redis://secret@host`).
pub fn parse_redis_url(s: &str) -> Result<RedisTarget, ControllerError> {
    let invalid = |reason: String| ControllerError::InvalidRedisUrl {
        url: s.to_string(),
        reason,
    };

    let url = Url::parse(s).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "redis" {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .unwrap_or(DEFAULT_REDIS_HOST);
    let port = url.port().unwrap_or(DEFAULT_REDIS_PORT);
    let addr = format!("{host}:{port}");

    let db_path = url.path().trim_matches('/');
    let database = if db_path.is_empty() {
        0
    } else {
        db_path
            .parse::<i64>()
            .map_err(|_| invalid(format!("database '{db_path}' is not a number")))?
    };

    let user = Some(url.username()).filter(|u| !u.is_empty());
    let (username, password) = match (user, url.password()) {
        (user, Some(password)) => (user.map(str::to_string), Some(password.to_string())),
        (Some(secret), None) => (None, Some(secret.to_string())),
        (None, None) => (None, None),
    };

    Ok(RedisTarget {
        addr,
        username,
        password,
        database,
    })
}

/// Maps a device to a key-value stream name.
pub type StreamResolver = Arc<dyn Fn(Uuid) -> String + Send + Sync>;

/// Per-record-type stream names handed to a key-value backend.
#[derive(Clone)]
pub struct StreamNames {
    pub logs: StreamResolver,
    pub info: StreamResolver,
}

impl StreamNames {
    pub fn resolve(&self, device: Uuid, kind: RecordType) -> String {
        match kind {
            RecordType::Logs => (self.logs)(device),
            RecordType::Info => (self.info)(device),
        }
    }
}

/// Builds key-value-stream loaders and caches.
pub trait KvStreamBackend: Send + Sync {
    fn loader(
        &self,
        target: &RedisTarget,
        streams: StreamNames,
    ) -> Result<Box<dyn Loader>, ControllerError>;

    fn cache(
        &self,
        target: &RedisTarget,
        streams: StreamNames,
    ) -> Result<Arc<dyn Cacher>, ControllerError>;
}

/// Wiring layer between configuration and the checker layer.
#[derive(Clone)]
pub struct ControllerCtx {
    dir: PathBuf,
    base_url: Url,
    client_factory: ClientFactory,
    remote: bool,
    remote_redis: bool,
    redis_url: String,
    caching: bool,
    caching_redis: bool,
    caching_prefix: String,
    policy: RetryPolicy,
    kv_backend: Option<Arc<dyn KvStreamBackend>>,
}

impl ControllerCtx {
    /// Build the context from configuration.
    ///
    /// Fails on a malformed controller URL or an unreadable CA file.
    pub fn from_config(config: &Config) -> Result<Self, ControllerError> {
        let base_url = base_url(&config.controller_url)?;
        let client_factory = client_factory(config.server_ca.as_deref(), config.request_timeout)?;

        let caching_prefix = if config.caching_prefix.trim().is_empty() {
            DEFAULT_CACHE_PREFIX.to_string()
        } else {
            config.caching_prefix.trim().to_string()
        };

        Ok(Self {
            dir: config.dir.clone(),
            base_url,
            client_factory,
            remote: config.remote,
            remote_redis: config.remote_redis,
            redis_url: config.redis_url.clone(),
            caching: config.caching,
            caching_redis: config.caching_redis,
            caching_prefix,
            policy: config.retry_policy(),
            kv_backend: None,
        })
    }

    /// Register the provider of key-value-stream loaders and caches.
    pub fn with_kv_backend(mut self, backend: Arc<dyn KvStreamBackend>) -> Self {
        self.kv_backend = Some(backend);
        self
    }

    /// Replace the retry policy handed to remote loaders.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build a fresh loader, cache-wrapped if caching is enabled.
    pub fn loader(&self) -> Result<Box<dyn Loader>, ControllerError> {
        let mut loader: Box<dyn Loader> = if !self.remote {
            info!("will use local file loader");
            Box::new(FileLoader::new(
                self.path_resolver(RecordType::Logs, false),
                self.path_resolver(RecordType::Info, false),
            ))
        } else if self.remote_redis {
            info!("will use remote key-value stream loader");
            let target = parse_redis_url(&self.redis_url)?;
            self.backend("loader")?.loader(&target, self.live_streams())?
        } else {
            info!("will use remote HTTP loader");
            Box::new(
                RemoteLoader::new(
                    Arc::clone(&self.client_factory),
                    self.url_resolver(RecordType::Logs),
                    self.url_resolver(RecordType::Info),
                )
                .with_policy(self.policy.clone()),
            )
        };

        if self.caching {
            let cache: Arc<dyn Cacher> = if self.caching_redis {
                info!(prefix = %self.caching_prefix, "will cache into key-value streams");
                let target = parse_redis_url(&self.redis_url)?;
                self.backend("cache")?.cache(&target, self.cache_streams())?
            } else {
                info!(prefix = %self.caching_prefix, "will cache into files");
                Arc::new(FileCache::new(
                    self.path_resolver(RecordType::Logs, true),
                    self.path_resolver(RecordType::Info, true),
                ))
            };
            loader.set_remote_cache(cache);
        }

        Ok(loader)
    }

    /// Build a loader already bound to `device`.
    pub fn loader_for(&self, device: Uuid) -> Result<Box<dyn Loader>, ControllerError> {
        let mut loader = self.loader()?;
        loader.set_uuid(device);
        Ok(loader)
    }

    /// Controller endpoint for `kind` records of `device`.
    pub fn device_url(&self, device: Uuid, kind: RecordType) -> Result<Url, url::ParseError> {
        device_url(&self.base_url, device, kind)
    }

    /// Local directory the controller writes `kind` records of `device` to.
    pub fn device_dir(&self, device: Uuid, kind: RecordType) -> PathBuf {
        device_dir(&self.dir, device, kind)
    }

    /// Directory cached `kind` records of `device` are written to.
    pub fn cache_dir(&self, device: Uuid, kind: RecordType) -> PathBuf {
        cache_dir(&self.dir, &self.caching_prefix, device, kind)
    }

    /// Live key-value stream name.
    pub fn stream_name(&self, device: Uuid, kind: RecordType) -> String {
        self.live_streams().resolve(device, kind)
    }

    /// Cache key-value stream name.
    pub fn cache_stream_name(&self, device: Uuid, kind: RecordType) -> String {
        self.cache_streams().resolve(device, kind)
    }

    fn backend(&self, what: &'static str) -> Result<&Arc<dyn KvStreamBackend>, ControllerError> {
        self.kv_backend
            .as_ref()
            .ok_or(ControllerError::BackendUnavailable(what))
    }

    fn url_resolver(&self, kind: RecordType) -> UrlResolver {
        let base = self.base_url.clone();
        Arc::new(move |device| device_url(&base, device, kind))
    }

    fn path_resolver(&self, kind: RecordType, cached: bool) -> PathResolver {
        let dir = self.dir.clone();
        if cached {
            let prefix = self.caching_prefix.clone();
            Arc::new(move |device| cache_dir(&dir, &prefix, device, kind))
        } else {
            Arc::new(move |device| device_dir(&dir, device, kind))
        }
    }

    fn live_streams(&self) -> StreamNames {
        StreamNames {
            logs: Arc::new(|device| format!("{LOGS_STREAM_PREFIX}{device}")),
            info: Arc::new(|device| format!("{INFO_STREAM_PREFIX}{device}")),
        }
    }

    fn cache_streams(&self) -> StreamNames {
        let logs_prefix = self.caching_prefix.clone();
        let info_prefix = self.caching_prefix.clone();
        StreamNames {
            logs: Arc::new(move |device| format!("{LOGS_STREAM_PREFIX}{logs_prefix}_{device}")),
            info: Arc::new(move |device| format!("{INFO_STREAM_PREFIX}{info_prefix}_{device}")),
        }
    }
}

fn base_url(raw: &str) -> Result<Url, ControllerError> {
    let mut url = Url::parse(raw.trim()).map_err(|source| ControllerError::InvalidBaseUrl {
        url: raw.to_string(),
        source,
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn device_url(base: &Url, device: Uuid, kind: RecordType) -> Result<Url, url::ParseError> {
    base.join(&format!("admin/device/{device}/{kind}"))
}

fn device_dir(dir: &std::path::Path, device: Uuid, kind: RecordType) -> PathBuf {
    dir.join("run")
        .join("controller")
        .join("device")
        .join(device.to_string())
        .join(kind.as_str())
}

fn cache_dir(dir: &std::path::Path, prefix: &str, device: Uuid, kind: RecordType) -> PathBuf {
    dir.join(prefix).join(device.to_string()).join(kind.as_str())
}

/// Client factory for controller requests.
///
/// Without a CA file the controller is assumed to use a self-signed
/// certificate. No client-wide timeout is set; one-shot requests carry their
/// own.
fn client_factory(
    server_ca: Option<&std::path::Path>,
    request_timeout: Duration,
) -> Result<ClientFactory, ControllerError> {
    let certificate = match server_ca {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                ControllerError::Tls(format!("failed to read CA cert {}: {e}", path.display()))
            })?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| ControllerError::Tls(format!("invalid CA cert: {e}")))?;
            Some(cert)
        }
        None => None,
    };

    Ok(Arc::new(move || {
        let builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90));
        match &certificate {
            Some(cert) => builder.add_root_certificate(cert.clone()).build(),
            None => builder.danger_accept_invalid_certs(true).build(),
        }
    }))
}
