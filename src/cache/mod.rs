//! Cache Module
//!
//! [`Cache`] is the public face of the engine. It is a cheap, cloneable
//! handle over:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                            Cache                              │
//! │                                                               │
//! │   set / get / incr ...                                        │
//! │          │                                                    │
//! │          ▼                                                    │
//! │   ┌─────────────┐   mutations inline   ┌──────────────────┐   │
//! │   │  Executor   │─────────────────────▶│     Buckets      │   │
//! │   │ (job queue) │── reads, N at once ─▶│ persistent │ vol │   │
//! │   └─────────────┘                      └──────────────────┘   │
//! │                                          ▲      ▲             │
//! │   keys / count / clear / save / load ────┘      │             │
//! │                                                 │             │
//! │   Cleaners (sweep + unlink drain) ──────────────┘             │
//! │   Watcher  (user callback, gets a Cache) ─────────────────────│
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Operations that go through the executor are `async`: writes resolve once
//! the job is queued, reads and fallible writes resolve with the job's
//! result. Writes through one `Cache` are applied in the order they were
//! queued.
//!
//! ## Example
//!
//! ```
//! use tidekv::{Cache, CacheConfig, Value};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> tidekv::Result<()> {
//! let cache = Cache::new(CacheConfig::default())?;
//!
//! cache.set("visits", Value::U32(1)).await?;
//! assert_eq!(cache.incr("visits").await?, Value::U32(2));
//!
//! cache.setex("session", "abc123", Duration::from_secs(60)).await?;
//! assert!(cache.get("session").await?.is_some());
//!
//! cache.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod buckets;
pub mod executor;
pub mod watcher;

pub use buckets::{Bucket, BucketMode, Buckets};
pub use executor::{Executor, Job, Op};
pub use watcher::WatchOp;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::storage::{Cleaner, DeleteHook, Item, SnapshotError, TableStats, Ttl, Value};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};
use watcher::Watcher;

/// Per-bucket results of [`Cache::save`].
///
/// `volatile` is `None` in single-bucket mode, where one table holds
/// everything.
#[derive(Debug)]
pub struct SaveOutcome {
    pub persistent: Result<usize>,
    pub volatile: Option<Result<usize>>,
}

impl SaveOutcome {
    pub fn is_ok(&self) -> bool {
        self.persistent.is_ok() && self.volatile.as_ref().map_or(true, |r| r.is_ok())
    }

    /// Total entries written, or the first failure.
    pub fn into_result(self) -> Result<usize> {
        let mut saved = self.persistent?;
        if let Some(volatile) = self.volatile {
            saved += volatile?;
        }
        Ok(saved)
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub mode: BucketMode,
    pub keys: usize,
    pub pending_unlinks: usize,
    pub tables: Vec<(Bucket, TableStats)>,
}

pub(crate) struct CacheInner {
    buckets: Buckets,
    executor: Executor,
    watcher: Watcher,
    cleaners: Mutex<Vec<Cleaner>>,
}

/// Handle to an in-process expiring key-value cache.
///
/// Clones share the same cache. Background tasks stop when the last handle
/// is dropped; [`Cache::shutdown`] stops them gracefully.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("mode", &self.mode())
            .field("keys", &self.count())
            .field("watcher", &self.inner.watcher)
            .finish()
    }
}

impl Cache {
    /// Creates an empty cache and starts its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_entries(config, HashMap::new())
    }

    /// Creates a cache seeded with `entries`.
    ///
    /// In dual-bucket mode, seeded items with a deadline land in the volatile
    /// bucket and the rest in the persistent one.
    pub fn with_entries(config: CacheConfig, entries: HashMap<String, Item>) -> Result<Self> {
        if config.default_expiration == Some(Duration::ZERO) {
            return Err(CacheError::Syntax(
                "default expiration must be greater than zero".to_string(),
            ));
        }
        if config.clean_interval.is_zero() || config.unlink_interval.is_zero() {
            return Err(CacheError::Syntax(
                "cleaner intervals must be greater than zero".to_string(),
            ));
        }

        let buckets = Buckets::new(config.default_expiration, entries);
        let executor = Executor::start(
            buckets.clone(),
            config.queue_capacity,
            config.read_concurrency,
        );

        let mut cleaners = vec![Cleaner::sweeper(
            Arc::clone(buckets.volatile()),
            config.clean_interval,
            config.sweep_budget,
        )];
        for (_, table) in buckets.tables() {
            cleaners.push(Cleaner::unlink_drainer(
                Arc::clone(table),
                config.unlink_interval,
            ));
        }

        info!(
            mode = ?buckets.mode(),
            keys = buckets.len(),
            read_concurrency = executor.read_concurrency(),
            "Cache initialized"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                buckets,
                executor,
                watcher: Watcher::new(),
                cleaners: Mutex::new(cleaners),
            }),
        })
    }

    async fn request<T>(&self, job: impl FnOnce(oneshot::Sender<T>) -> Job) -> Result<T> {
        let (done, rx) = oneshot::channel();
        self.inner.executor.submit(job(done)).await?;
        rx.await.map_err(|_| CacheError::ExecutorStopped)
    }

    /// Stores a key without a TTL (single-bucket mode: with the default TTL).
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.inner
            .executor
            .submit(Job::Set {
                key: key.into(),
                value: value.into(),
            })
            .await
    }

    /// Stores a key that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// [`CacheError::Syntax`] if `ttl` is zero.
    pub async fn setex(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        ttl: Duration,
    ) -> Result<()> {
        if ttl.is_zero() {
            return Err(CacheError::Syntax(
                "expiration must be greater than zero".to_string(),
            ));
        }
        self.inner
            .executor
            .submit(Job::Setex {
                key: key.into(),
                value: value.into(),
                ttl,
            })
            .await
    }

    /// Stores a key only if it is absent from both buckets.
    ///
    /// # Returns
    ///
    /// `true` if the key was stored.
    pub async fn setnx(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<bool> {
        let (key, value) = (key.into(), value.into());
        match self.request(|done| Job::Setnx { key, value, done }).await? {
            Ok(()) => Ok(true),
            Err(CacheError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Value>> {
        let key = key.into();
        self.request(|done| Job::Get { key, done }).await
    }

    /// Deletes a key. The deletion hook is handed to a blocking worker when
    /// the job is applied.
    pub async fn del(&self, key: impl Into<String>) -> Result<()> {
        self.inner
            .executor
            .submit(Job::Del { key: key.into() })
            .await
    }

    /// Removes a key right away and leaves its deletion hook to the unlink
    /// drain cycle.
    pub async fn unlink(&self, key: impl Into<String>) -> Result<()> {
        self.inner
            .executor
            .submit(Job::Unlink { key: key.into() })
            .await
    }

    /// Adds one to an integer value.
    ///
    /// # Returns
    ///
    /// The new value, with the stored width preserved.
    pub async fn incr(&self, key: impl Into<String>) -> Result<Value> {
        let key = key.into();
        self.request(|done| Job::Incr { key, done }).await?
    }

    /// Adds a decimal `delta` to an integer value.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Syntax`] if `delta` is not a valid `i64`
    /// - [`CacheError::NotFound`] if neither bucket holds the key
    /// - [`CacheError::Overflow`] / [`CacheError::TypeMismatch`] from the table
    pub async fn incrby(&self, key: impl Into<String>, delta: impl Into<String>) -> Result<Value> {
        let (key, delta) = (key.into(), delta.into());
        self.request(|done| Job::Incrby { key, delta, done }).await?
    }

    pub async fn ttl(&self, key: impl Into<String>) -> Result<Option<Ttl>> {
        let key = key.into();
        self.request(|done| Job::Ttl { key, done }).await
    }

    /// Live entries whose key matches the regular expression `pattern`.
    pub fn keys(&self, pattern: &str) -> Result<Vec<(String, Value)>> {
        self.inner.buckets.keys(pattern)
    }

    /// Stored entries across both buckets, including expired ones the
    /// sweeper has not reached yet.
    pub fn count(&self) -> usize {
        self.inner.buckets.len()
    }

    /// Removes every entry without running the deletion hook.
    pub fn clear(&self) {
        self.inner.buckets.clear();
    }

    /// Registers the deletion hook, replacing any previous one.
    ///
    /// The hook fires for `del` and swept expirations on a blocking worker,
    /// so a slow hook never holds up queued writes, and for `unlink` on the
    /// drain cycle. Moving a key between buckets does not fire it.
    pub fn add_delete_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let hook: DeleteHook = Arc::new(handler);
        self.inner.buckets.set_delete_hook(hook);
    }

    pub fn mode(&self) -> BucketMode {
        self.inner.buckets.mode()
    }

    /// Unlinked keys whose hook has not run yet.
    pub fn pending_unlinks(&self) -> usize {
        self.inner.buckets.pending_unlinks()
    }

    pub fn stats(&self) -> CacheStats {
        let buckets = &self.inner.buckets;
        CacheStats {
            mode: buckets.mode(),
            keys: buckets.len(),
            pending_unlinks: buckets.pending_unlinks(),
            tables: buckets
                .tables()
                .into_iter()
                .map(|(bucket, table)| (bucket, table.stats()))
                .collect(),
        }
    }

    /// Saves each bucket to `<path>.persistent` / `<path>.volatile`.
    ///
    /// Both buckets are written concurrently and fail independently.
    pub async fn save(&self, path: impl AsRef<Path>) -> SaveOutcome {
        let base = path.as_ref().to_path_buf();

        let persistent = self.save_bucket(Bucket::Persistent, base.clone());
        match self.mode() {
            BucketMode::Single => SaveOutcome {
                persistent: persistent.await,
                volatile: None,
            },
            BucketMode::Dual => {
                let volatile = self.save_bucket(Bucket::Volatile, base);
                let (persistent, volatile) = tokio::join!(persistent, volatile);
                SaveOutcome {
                    persistent,
                    volatile: Some(volatile),
                }
            }
        }
    }

    fn save_bucket(&self, bucket: Bucket, base: PathBuf) -> impl Future<Output = Result<usize>> {
        let buckets = self.inner.buckets.clone();
        async move {
            let path = bucket.snapshot_path(&base);
            tokio::task::spawn_blocking(move || buckets.save_bucket(bucket, &base))
                .await
                .map_err(|e| CacheError::SaveFailed {
                    bucket,
                    path,
                    source: SnapshotError::Io(io::Error::other(e)),
                })?
        }
    }

    /// Loads the bucket snapshots written by [`Cache::save`]. Loaded entries
    /// only fill keys that are absent from both buckets. Missing files load
    /// nothing; every bucket is attempted before the first failure is
    /// returned.
    ///
    /// # Returns
    ///
    /// The number of entries inserted.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let base = path.as_ref().to_path_buf();
        let buckets = self.inner.buckets.clone();

        let loaded = tokio::task::spawn_blocking(move || buckets.load(&base))
            .await
            .map_err(|e| CacheError::LoadFailed {
                bucket: Bucket::Persistent,
                path: Bucket::Persistent.snapshot_path(path.as_ref()),
                source: SnapshotError::Io(io::Error::other(e)),
            })??;

        debug!(loaded = loaded, "Snapshot loaded");
        Ok(loaded)
    }

    /// Installs a watch callback to run every `interval`. A running watcher
    /// is stopped first and left stopped.
    ///
    /// Must not be awaited from inside a watch callback.
    pub async fn replace_watch_op<F>(&self, interval: Duration, op: F)
    where
        F: Fn(Cache) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let op: WatchOp = Arc::new(op);
        self.inner.watcher.replace(interval, op).await;
    }

    /// # Errors
    ///
    /// [`CacheError::WatcherUnconfigured`] before any callback is installed,
    /// [`CacheError::WatcherRunning`] if it is already running.
    pub async fn start_watching(&self) -> Result<()> {
        self.inner
            .watcher
            .start(Arc::downgrade(&self.inner))
            .await
    }

    /// Stops the watcher and waits for the loop to exit.
    pub async fn stop_watching(&self) -> Result<()> {
        self.inner.watcher.stop().await
    }

    /// Stops the watcher without waiting for the loop to exit. Safe to call
    /// from inside a watch callback, which may then query or restart the
    /// watcher; a restarted loop ticks only after the old one has exited.
    pub async fn stop_watching_async(&self) -> Result<()> {
        self.inner.watcher.stop_async().await
    }

    pub async fn is_watching(&self) -> bool {
        self.inner.watcher.is_running().await
    }

    /// Stops the cache gracefully.
    ///
    /// Stops the watcher, runs every queued job, waits for in-flight reads,
    /// stops the cleaners and flushes pending unlink hooks. Afterwards, calls
    /// that go through the executor fail with [`CacheError::ExecutorStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        match self.inner.watcher.stop().await {
            Ok(()) | Err(CacheError::WatcherStopped) | Err(CacheError::WatcherUnconfigured) => {}
            Err(e) => return Err(e),
        }

        match self.inner.executor.shutdown().await {
            Ok(()) | Err(CacheError::ExecutorStopped) => {}
            Err(e) => return Err(e),
        }

        let cleaners = std::mem::take(&mut *self.inner.cleaners.lock());
        for cleaner in cleaners {
            cleaner.shutdown().await;
        }

        let mut flushed = 0;
        for (_, table) in self.inner.buckets.tables() {
            flushed += table.drain_unlinked();
        }

        info!(flushed_unlinks = flushed, "Cache shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn config() -> CacheConfig {
        CacheConfig {
            clean_interval: Duration::from_millis(10),
            unlink_interval: Duration::from_millis(20),
            read_concurrency: 4,
            ..CacheConfig::default()
        }
    }

    fn single(ttl: Duration) -> CacheConfig {
        CacheConfig {
            default_expiration: Some(ttl),
            ..config()
        }
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = Cache::new(config()).unwrap();

        cache.set("name", "Ariz").await.unwrap();
        assert_eq!(cache.get("name").await.unwrap(), Some(Value::from("Ariz")));
        assert_eq!(cache.get("missing").await.unwrap(), None);
        assert_eq!(cache.mode(), BucketMode::Dual);
    }

    #[tokio::test]
    async fn test_setex_expires() {
        let cache = Cache::new(config()).unwrap();

        cache
            .setex("session", "token", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(
            cache.get("session").await.unwrap(),
            Some(Value::from("token"))
        );
        assert!(matches!(
            cache.ttl("session").await.unwrap(),
            Some(Ttl::Remaining(_))
        ));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("session").await.unwrap(), None);
        assert_eq!(cache.ttl("session").await.unwrap(), None);
        // The sweeper has reclaimed it by now
        assert_eq!(cache.count(), 0);
    }

    #[tokio::test]
    async fn test_setex_rejects_zero_ttl() {
        let cache = Cache::new(config()).unwrap();
        assert!(matches!(
            cache.setex("k", "v", Duration::ZERO).await,
            Err(CacheError::Syntax(_))
        ));
    }

    #[tokio::test]
    async fn test_setnx() {
        let cache = Cache::new(config()).unwrap();

        assert!(cache.setnx("key", "v1").await.unwrap());
        assert!(!cache.setnx("key", "v2").await.unwrap());
        assert_eq!(cache.get("key").await.unwrap(), Some(Value::from("v1")));

        cache
            .setex("timed", "t", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!cache.setnx("timed", "other").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_overflow_every_width() {
        let cache = Cache::new(config()).unwrap();

        let maxima = [
            Value::Int(isize::MAX),
            Value::I8(i8::MAX),
            Value::I16(i16::MAX),
            Value::I32(i32::MAX),
            Value::I64(i64::MAX),
            Value::Uint(usize::MAX),
            Value::U8(u8::MAX),
            Value::U16(u16::MAX),
            Value::U32(u32::MAX),
            Value::U64(u64::MAX),
        ];

        for max in maxima {
            let key = format!("max:{}", max.kind());
            cache.set(key.as_str(), max.clone()).await.unwrap();
            assert!(
                matches!(cache.incr(key.as_str()).await, Err(CacheError::Overflow { .. })),
                "{} should overflow",
                max.kind()
            );
            assert_eq!(cache.get(key.as_str()).await.unwrap(), Some(max));
        }
    }

    #[tokio::test]
    async fn test_incrby_keeps_width() {
        let cache = Cache::new(config()).unwrap();

        cache.set("n", Value::I32(5)).await.unwrap();
        assert_eq!(cache.incrby("n", "3").await.unwrap(), Value::I32(8));
        assert_eq!(cache.get("n").await.unwrap(), Some(Value::I32(8)));

        assert!(matches!(
            cache.incrby("n", "x").await,
            Err(CacheError::Syntax(_))
        ));
        assert!(matches!(
            cache.incr("nothing").await,
            Err(CacheError::NotFound(_))
        ));

        cache.set("u", Value::U16(10)).await.unwrap();
        assert!(matches!(
            cache.incrby("u", "-1").await,
            Err(CacheError::Overflow { .. })
        ));

        cache.set("f", Value::F32(1.5)).await.unwrap();
        assert!(matches!(
            cache.incr("f").await,
            Err(CacheError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_del_runs_handler_once() {
        let cache = Cache::new(config()).unwrap();
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.add_delete_handler(move |key, value| {
            sink.lock().push((key.to_string(), value.clone()));
        });

        cache.set("k", Value::I64(7)).await.unwrap();
        cache.del("k").await.unwrap();
        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);

        // Hooks for `del` run on a blocking worker.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock(), vec![("k".to_string(), Value::I64(7))]);
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_stall_writes() {
        let cache = Cache::new(config()).unwrap();
        cache.add_delete_handler(|_, _| std::thread::sleep(Duration::from_millis(300)));

        cache.set("k", "v").await.unwrap();
        cache.del("k").await.unwrap();

        let started = std::time::Instant::now();
        cache.set("next", "v").await.unwrap();
        assert_eq!(cache.get("next").await.unwrap(), Some(Value::from("v")));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_unlink_defers_handler() {
        let cache = Cache::new(CacheConfig {
            unlink_interval: Duration::from_millis(100),
            ..config()
        })
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        cache.add_delete_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set("k", "v").await.unwrap();
        cache.unlink("k").await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.pending_unlinks(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.pending_unlinks(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiry_runs_handler() {
        let cache = Cache::new(config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        cache.add_delete_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache
            .setex("brief", "v", Duration::from_millis(20))
            .await
            .unwrap();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bucket_switch_keeps_one_copy() {
        let cache = Cache::new(config()).unwrap();

        cache
            .setex("k", "short", Duration::from_secs(60))
            .await
            .unwrap();
        cache.set("k", "long").await.unwrap();

        assert_eq!(cache.count(), 1);
        assert_eq!(cache.ttl("k").await.unwrap(), Some(Ttl::Never));
        assert_eq!(cache.get("k").await.unwrap(), Some(Value::from("long")));
    }

    #[tokio::test]
    async fn test_keys_and_clear() {
        let cache = Cache::new(config()).unwrap();

        cache.set("user:1", "a").await.unwrap();
        cache
            .setex("user:2", "b", Duration::from_secs(60))
            .await
            .unwrap();
        cache.set("order:1", "c").await.unwrap();
        // Writes are queued; a read behind them waits for all of them.
        cache.get("order:1").await.unwrap();

        assert_eq!(cache.keys("^user:").unwrap().len(), 2);
        assert!(matches!(
            cache.keys("[unclosed"),
            Err(CacheError::InvalidPattern(_))
        ));

        cache.clear();
        assert_eq!(cache.count(), 0);
    }

    #[tokio::test]
    async fn test_save_clear_load() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dump");
        let cache = Cache::new(config()).unwrap();

        cache.set("a", Value::U8(1)).await.unwrap();
        cache.set("b", Value::from("two")).await.unwrap();
        cache
            .setex("c", Value::F64(3.0), Duration::from_secs(60))
            .await
            .unwrap();
        cache.get("c").await.unwrap();
        let before = cache.count();

        let outcome = cache.save(&base).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.into_result().unwrap(), 3);
        assert!(base.with_extension("persistent").exists());
        assert!(base.with_extension("volatile").exists());

        cache.clear();
        assert_eq!(cache.count(), 0);

        assert_eq!(cache.load(&base).await.unwrap(), 3);
        assert_eq!(cache.count(), before);
        assert_eq!(cache.get("a").await.unwrap(), Some(Value::U8(1)));
        assert!(matches!(
            cache.ttl("c").await.unwrap(),
            Some(Ttl::Remaining(_))
        ));
    }

    #[tokio::test]
    async fn test_save_reports_each_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("no-such-dir").join("dump");
        let cache = Cache::new(config()).unwrap();

        let outcome = cache.save(&base).await;
        assert!(!outcome.is_ok());
        assert!(matches!(
            outcome.persistent,
            Err(CacheError::SaveFailed { bucket: Bucket::Persistent, .. })
        ));
        assert!(matches!(
            outcome.volatile,
            Some(Err(CacheError::SaveFailed { bucket: Bucket::Volatile, .. }))
        ));
    }

    #[tokio::test]
    async fn test_load_keeps_key_in_one_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dump");
        let cache = Cache::new(config()).unwrap();

        cache
            .setex("k", "saved", Duration::from_secs(60))
            .await
            .unwrap();
        cache.get("k").await.unwrap();
        assert!(cache.save(&base).await.is_ok());

        cache.clear();
        cache.set("k", "live").await.unwrap();
        cache.get("k").await.unwrap();

        assert_eq!(cache.load(&base).await.unwrap(), 0);
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.get("k").await.unwrap(), Some(Value::from("live")));
        assert_eq!(cache.ttl("k").await.unwrap(), Some(Ttl::Never));
    }

    #[tokio::test]
    async fn test_load_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(config()).unwrap();

        assert_eq!(cache.load(dir.path().join("nothing")).await.unwrap(), 0);
        assert_eq!(cache.count(), 0);
    }

    #[tokio::test]
    async fn test_load_single_mode_snapshot_into_dual() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("s");

        let single_cache = Cache::new(single(Duration::from_secs(60))).unwrap();
        single_cache.set("a", "1").await.unwrap();
        single_cache.set("b", "2").await.unwrap();
        single_cache.get("a").await.unwrap();
        assert!(single_cache.save(&base).await.is_ok());
        assert!(!Bucket::Volatile.snapshot_path(&base).exists());

        let dual_cache = Cache::new(config()).unwrap();
        assert_eq!(dual_cache.load(&base).await.unwrap(), 2);
        assert_eq!(dual_cache.get("b").await.unwrap(), Some(Value::from("2")));
        assert!(matches!(
            dual_cache.ttl("b").await.unwrap(),
            Some(Ttl::Remaining(_))
        ));
    }

    #[tokio::test]
    async fn test_single_bucket_mode() {
        let cache = Cache::new(single(Duration::from_millis(40))).unwrap();
        assert_eq!(cache.mode(), BucketMode::Single);

        cache.set("k", "v").await.unwrap();
        assert!(matches!(
            cache.ttl("k").await.unwrap(),
            Some(Ttl::Remaining(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let outcome = cache.save(dir.path().join("dump")).await;
        assert!(outcome.volatile.is_none());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_zero_default_expiration() {
        assert!(matches!(
            Cache::new(single(Duration::ZERO)),
            Err(CacheError::Syntax(_))
        ));
    }

    #[tokio::test]
    async fn test_seeded_cache() {
        let mut seed = HashMap::new();
        seed.insert("plain".to_string(), Item::new(Value::from("p")));
        seed.insert(
            "timed".to_string(),
            Item::with_ttl(Value::from("t"), Duration::from_secs(60)),
        );

        let cache = Cache::with_entries(config(), seed).unwrap();
        assert_eq!(cache.count(), 2);
        assert_eq!(cache.ttl("plain").await.unwrap(), Some(Ttl::Never));
        assert!(matches!(
            cache.ttl("timed").await.unwrap(),
            Some(Ttl::Remaining(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_incrby_loses_nothing() {
        let cache = Cache::new(config()).unwrap();
        cache.set("counter", Value::I64(0)).await.unwrap();

        let mut handles = Vec::new();
        for task in 0..8i64 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    cache.incrby("counter", (task + 1).to_string()).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 50 * (1 + 2 + ... + 8)
        assert_eq!(cache.get("counter").await.unwrap(), Some(Value::I64(1800)));
    }

    #[tokio::test]
    async fn test_watcher_lifecycle() {
        let cache = Cache::new(config()).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));

        assert!(matches!(
            cache.start_watching().await,
            Err(CacheError::WatcherUnconfigured)
        ));
        assert!(matches!(
            cache.stop_watching().await,
            Err(CacheError::WatcherUnconfigured)
        ));

        let counter = Arc::clone(&ticks);
        cache
            .replace_watch_op(Duration::from_millis(10), move |cache: Cache| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    cache.set("watched", Value::from("yes")).await?;
                    Ok::<(), anyhow::Error>(())
                }
                .boxed()
            })
            .await;
        assert!(!cache.is_watching().await);

        cache.start_watching().await.unwrap();
        assert!(matches!(
            cache.start_watching().await,
            Err(CacheError::WatcherRunning)
        ));

        sleep(Duration::from_millis(60)).await;
        cache.stop_watching().await.unwrap();
        let stopped_at = ticks.load(Ordering::SeqCst);
        assert!(stopped_at > 0);
        assert_eq!(
            cache.get("watched").await.unwrap(),
            Some(Value::from("yes"))
        );

        sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), stopped_at);
        assert!(matches!(
            cache.stop_watching().await,
            Err(CacheError::WatcherStopped)
        ));
    }

    #[tokio::test]
    async fn test_watcher_survives_failures() {
        let cache = Cache::new(config()).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        cache
            .replace_watch_op(Duration::from_millis(10), move |_cache: Cache| {
                let tick = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match tick % 3 {
                        0 => anyhow::bail!("tick {} failed", tick),
                        1 => panic!("tick {} panicked", tick),
                        _ => Ok::<(), anyhow::Error>(()),
                    }
                }
                .boxed()
            })
            .await;

        cache.start_watching().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(cache.is_watching().await);
        assert!(ticks.load(Ordering::SeqCst) >= 4);
        cache.stop_watching().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_stops_running_watcher() {
        let cache = Cache::new(config()).unwrap();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        cache
            .replace_watch_op(Duration::from_millis(10), move |_cache: Cache| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), anyhow::Error>(()) }.boxed()
            })
            .await;
        cache.start_watching().await.unwrap();
        sleep(Duration::from_millis(40)).await;

        let counter = Arc::clone(&second);
        cache
            .replace_watch_op(Duration::from_millis(10), move |_cache: Cache| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), anyhow::Error>(()) }.boxed()
            })
            .await;
        let first_total = first.load(Ordering::SeqCst);
        assert!(!cache.is_watching().await);

        cache.start_watching().await.unwrap();
        sleep(Duration::from_millis(40)).await;
        cache.stop_watching().await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), first_total);
        assert!(second.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_stop_watching_async() {
        let cache = Cache::new(config()).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        cache
            .replace_watch_op(Duration::from_millis(10), move |cache: Cache| {
                let counter = Arc::clone(&counter);
                async move {
                    // Stopping from inside the callback must not deadlock.
                    if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                        cache.stop_watching_async().await?;
                    }
                    Ok::<(), anyhow::Error>(())
                }
                .boxed()
            })
            .await;

        cache.start_watching().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(!cache.is_watching().await);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        // Restartable after an async stop
        cache.start_watching().await.unwrap();
        cache.stop_watching().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_from_inside_callback() {
        let cache = Cache::new(config()).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(false));

        let (counter, overlap, busy) = (
            Arc::clone(&ticks),
            Arc::clone(&overlaps),
            Arc::clone(&active),
        );
        cache
            .replace_watch_op(Duration::from_millis(10), move |cache: Cache| {
                let (counter, overlap, busy) = (
                    Arc::clone(&counter),
                    Arc::clone(&overlap),
                    Arc::clone(&busy),
                );
                async move {
                    if busy.swap(true, Ordering::SeqCst) {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        cache.stop_watching_async().await?;
                        anyhow::ensure!(!cache.is_watching().await, "still running after stop");
                        cache.start_watching().await?;
                    }
                    sleep(Duration::from_millis(5)).await;
                    busy.store(false, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
                .boxed()
            })
            .await;

        cache.start_watching().await.unwrap();
        sleep(Duration::from_millis(150)).await;

        assert!(cache.is_watching().await);
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        cache.stop_watching().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let cache = Cache::new(config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        cache.add_delete_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..100 {
            cache.set(format!("k{}", i), Value::from(i as i64)).await.unwrap();
        }
        cache.unlink("k0").await.unwrap();

        cache.shutdown().await.unwrap();

        assert_eq!(cache.count(), 99);
        assert_eq!(cache.pending_unlinks(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            cache.get("k1").await,
            Err(CacheError::ExecutorStopped)
        ));
        assert!(cache.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = Cache::new(config()).unwrap();
        cache.set("a", "1").await.unwrap();
        cache
            .setex("b", "2", Duration::from_secs(60))
            .await
            .unwrap();
        cache.get("a").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.mode, BucketMode::Dual);
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.tables.len(), 2);
        assert_eq!(stats.tables[0].0, Bucket::Persistent);
        assert_eq!(stats.tables[0].1.set_ops, 1);
    }
}
