//! # TideKV - An In-Memory Key-Value Cache with Per-Key Expiry
//!
//! TideKV keeps typed values in memory, expires them per key and serializes
//! every mutation through a single job queue. It can be embedded as a
//! library through [`Cache`] or run as a TCP server speaking newline JSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               TideKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (main.rs)   │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │                     ┌──────────────────────────────────────────────┐    │
//! │                     │  Cache ── Executor (job queue, read permits) │    │
//! │                     └──────────────────────┬───────────────────────┘    │
//! │                                            ▼                            │
//! │                     ┌──────────────────────────────────────────────┐    │
//! │                     │  Buckets                                     │    │
//! │                     │  ┌──────────────────┐ ┌──────────────────┐   │    │
//! │                     │  │ persistent table │ │ volatile table   │   │    │
//! │                     │  └──────────────────┘ └──────────────────┘   │    │
//! │                     └──────────────────────────────────────────────┘    │
//! │                                            ▲                            │
//! │         ┌──────────────────┐  ┌────────────┴─────┐  ┌────────────────┐  │
//! │         │ Cleaner (sweep)  │  │ Cleaner (unlink) │  │ Watcher        │  │
//! │         └──────────────────┘  └──────────────────┘  └────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidekv::commands::CommandHandler;
//! use tidekv::connection::{handle_connection, ConnectionStats};
//! use tidekv::protocol::DatagramCodec;
//! use tidekv::{Cache, CacheConfig};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = Cache::new(CacheConfig::default())?;
//!     let stats = Arc::new(ConnectionStats::new());
//!     let listener = TcpListener::bind("127.0.0.1:8448").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let handler = CommandHandler::new(cache.clone());
//!         let stats = Arc::clone(&stats);
//!         tokio::spawn(handle_connection(
//!             stream,
//!             addr,
//!             DatagramCodec::default(),
//!             handler,
//!             stats,
//!         ));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: typed values, the entry table, the unlink queue, cleaners
//!   and snapshot files
//! - [`cache`]: buckets, the job executor, the watcher and the [`Cache`]
//!   facade
//! - [`protocol`]: the JSON datagram codec
//! - [`commands`]: maps requests onto cache operations
//! - [`connection`]: per-client connection loop
//! - [`config`]: TOML server configuration
//!
//! ## Expiry
//!
//! Keys with a deadline are expired in two ways:
//! 1. **Lazy**: reads never return an expired value
//! 2. **Active**: a cleaner task removes a bounded batch of the earliest
//!    deadlines on every tick
//!
//! Without a default expiration, keys written by `SET` live in a persistent
//! bucket and keys written by `SETEX` in a volatile one, and each bucket is
//! saved to its own snapshot file. With a default expiration, one table
//! holds everything.

pub mod cache;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod storage;

pub use cache::{Bucket, BucketMode, Cache, CacheStats, SaveOutcome};
pub use commands::CommandHandler;
pub use config::{CacheConfig, Config};
pub use error::{CacheError, Result};
pub use storage::{Expiry, Item, Ttl, Value, ValueKind};

/// The default port TideKV listens on
pub const DEFAULT_PORT: u16 = 8448;

/// The default host TideKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of TideKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
