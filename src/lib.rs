//! Edge Controller Library
//!
//! Control-plane client for an edge-device test harness. It pulls device
//! logs and device info from a controller on behalf of test scenarios,
//! optionally mirrors every record into a cache, and hands records to a
//! checker through a per-record callback.
//!
//! - **record**: record types and the canonical record form
//! - **frame**: incremental decoder for the framed JSON record stream
//! - **loader**: the `Loader` contract with remote-HTTP and file variants
//! - **cache**: the `Cacher` contract with a file variant
//! - **controller**: wiring of loaders and caches from configuration
//! - **config**: environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use edge_controller::config::Config;
//! use edge_controller::controller::ControllerCtx;
//! use edge_controller::record::RecordType;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let ctx = ControllerCtx::from_config(&config).expect("Failed to build context");
//!
//!     let device = Uuid::parse_str("1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap();
//!     let loader = ctx.loader_for(device).expect("Failed to build loader");
//!
//!     // Wait up to a minute for a log bundle mentioning "ready"
//!     let result = loader
//!         .process_stream(
//!             Box::new(|bytes: &[u8]| Ok(!String::from_utf8_lossy(bytes).contains("ready"))),
//!             RecordType::Logs,
//!             Duration::from_secs(60),
//!         )
//!         .await;
//!     println!("watch finished: {result:?}");
//! }
//! ```

// Module declarations
pub mod cache;
pub mod config;
pub mod controller;
pub mod frame;
pub mod loader;
pub mod record;

// Re-export commonly used types at crate root for convenience
pub use cache::{CacheError, Cacher, FileCache};
pub use config::{Config, ConfigError, WatchConfig};
pub use controller::{parse_redis_url, ControllerCtx, ControllerError, KvStreamBackend, RedisTarget};
pub use frame::{FrameDecoder, FrameError};
pub use loader::{
    BoxError, FileLoader, Loader, LoaderError, ProcessFn, RemoteLoader, RetryPolicy,
};
pub use record::{Record, RecordError, RecordType};
