//! Bucket Routing
//!
//! The cache keeps keys without a TTL and keys with one in separate tables so
//! the sweeper only ever walks tables where something can expire.
//!
//! ```text
//!   set / setnx ──▶ persistent ─┐
//!                               ├─ a key lives in at most one of them
//!   setex ───────▶ volatile ────┘
//! ```
//!
//! When the cache is built with a default expiration every key expires
//! anyway, so a single table serves both roles ([`BucketMode::Single`]).
//!
//! Moving a key between buckets is two sequential single-table operations:
//! write the new copy, then discard the old one. A concurrent reader can
//! briefly see the key in both tables; `get` checks the persistent table
//! first, so it still sees exactly one value.

use crate::error::{CacheError, Result};
use crate::storage::snapshot::{self, Record};
use crate::storage::{DeleteHook, EntryTable, Expiry, Item, SnapshotError, Ttl, Value};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One of the two tables behind the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Keys written without a TTL
    Persistent,
    /// Keys written with a TTL
    Volatile,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Persistent => "persistent",
            Bucket::Volatile => "volatile",
        }
    }

    /// Snapshot file for this bucket: `<base>.persistent` or `<base>.volatile`.
    pub fn snapshot_path(self, base: &Path) -> PathBuf {
        let mut path = base.as_os_str().to_owned();
        path.push(".");
        path.push(self.as_str());
        PathBuf::from(path)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketMode {
    /// One table with a uniform default expiration
    Single,
    /// Separate persistent and volatile tables
    Dual,
}

/// The cache's tables and the routing rules between them.
#[derive(Debug, Clone)]
pub enum Buckets {
    Single(Arc<EntryTable>),
    Dual {
        persistent: Arc<EntryTable>,
        volatile: Arc<EntryTable>,
    },
}

impl Buckets {
    /// Builds the tables for the given default expiration.
    ///
    /// `Some(ttl)` selects single mode; `None` selects dual mode. Seeded items
    /// with a deadline go to the volatile table, the rest to the persistent one.
    pub fn new(default_expiration: Option<Duration>, seed: HashMap<String, Item>) -> Self {
        match default_expiration {
            Some(ttl) => Buckets::Single(Arc::new(EntryTable::with_entries(
                "single",
                Some(ttl),
                seed,
            ))),
            None => {
                let (volatile, persistent): (HashMap<_, _>, HashMap<_, _>) = seed
                    .into_iter()
                    .partition(|(_, item)| item.expires_at.is_some());

                Buckets::Dual {
                    persistent: Arc::new(EntryTable::with_entries(
                        Bucket::Persistent.as_str(),
                        None,
                        persistent,
                    )),
                    volatile: Arc::new(EntryTable::with_entries(
                        Bucket::Volatile.as_str(),
                        None,
                        volatile,
                    )),
                }
            }
        }
    }

    pub fn mode(&self) -> BucketMode {
        match self {
            Buckets::Single(_) => BucketMode::Single,
            Buckets::Dual { .. } => BucketMode::Dual,
        }
    }

    /// The table that receives `set` writes.
    pub fn persistent(&self) -> &Arc<EntryTable> {
        match self {
            Buckets::Single(table) => table,
            Buckets::Dual { persistent, .. } => persistent,
        }
    }

    /// The table that receives `setex` writes and is swept for expiry.
    pub fn volatile(&self) -> &Arc<EntryTable> {
        match self {
            Buckets::Single(table) => table,
            Buckets::Dual { volatile, .. } => volatile,
        }
    }

    /// Every distinct table with its bucket label, persistent first.
    pub fn tables(&self) -> Vec<(Bucket, &Arc<EntryTable>)> {
        match self {
            Buckets::Single(table) => vec![(Bucket::Persistent, table)],
            Buckets::Dual {
                persistent,
                volatile,
            } => vec![(Bucket::Persistent, persistent), (Bucket::Volatile, volatile)],
        }
    }

    /// Stores a key without a TTL (single mode: with the default TTL).
    pub fn set(&self, key: &str, value: Value) {
        match self {
            Buckets::Single(table) => table.set(key, value, Expiry::Default),
            Buckets::Dual {
                persistent,
                volatile,
            } => {
                persistent.set(key, value, Expiry::Never);
                volatile.discard(key);
            }
        }
    }

    /// Stores a key with an explicit TTL.
    pub fn setex(&self, key: &str, value: Value, ttl: Duration) {
        match self {
            Buckets::Single(table) => table.set(key, value, Expiry::After(ttl)),
            Buckets::Dual {
                persistent,
                volatile,
            } => {
                volatile.set(key, value, Expiry::After(ttl));
                persistent.discard(key);
            }
        }
    }

    /// Stores a key without a TTL unless either table holds it.
    pub fn setnx(&self, key: &str, value: Value) -> Result<()> {
        match self {
            Buckets::Single(table) => table.set_if_absent(key, value, Expiry::Default),
            Buckets::Dual {
                persistent,
                volatile,
            } => {
                if volatile.contains(key) {
                    return Err(CacheError::AlreadyExists(key.to_string()));
                }
                persistent.set_if_absent(key, value, Expiry::Never)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Buckets::Single(table) => table.get(key),
            Buckets::Dual {
                persistent,
                volatile,
            } => persistent.get(key).or_else(|| volatile.get(key)),
        }
    }

    /// Deletes from every table, running the hook for the removed copy.
    pub fn del(&self, key: &str) -> Option<Value> {
        let mut removed = None;
        for (_, table) in self.tables() {
            if let Some(value) = table.delete_detached(key) {
                removed = Some(value);
            }
        }
        removed
    }

    /// Unlinks from every table; hooks run on the tables' drain cycles.
    pub fn unlink(&self, key: &str) -> bool {
        let mut removed = false;
        for (_, table) in self.tables() {
            removed |= table.unlink(key);
        }
        removed
    }

    /// Increments in the persistent table, falling back to the volatile one
    /// when the key is not there.
    pub fn incr_by(&self, key: &str, delta: i64) -> Result<Value> {
        match self {
            Buckets::Single(table) => table.incr_by(key, delta),
            Buckets::Dual {
                persistent,
                volatile,
            } => match persistent.incr_by(key, delta) {
                Err(CacheError::NotFound(_)) => volatile.incr_by(key, delta),
                other => other,
            },
        }
    }

    /// Remaining lifetime. Keys held in the persistent table report
    /// `Ttl::Never`.
    pub fn ttl(&self, key: &str) -> Option<Ttl> {
        match self {
            Buckets::Single(table) => table.ttl(key),
            Buckets::Dual {
                persistent,
                volatile,
            } => volatile
                .ttl(key)
                .or_else(|| persistent.contains(key).then_some(Ttl::Never)),
        }
    }

    pub fn keys(&self, pattern: &str) -> Result<Vec<(String, Value)>> {
        let mut matches = Vec::new();
        for (_, table) in self.tables() {
            matches.extend(table.keys_matching(pattern)?);
        }
        Ok(matches)
    }

    pub fn len(&self) -> usize {
        self.tables().iter().map(|(_, table)| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for (_, table) in self.tables() {
            table.clear();
        }
    }

    pub fn set_delete_hook(&self, hook: DeleteHook) {
        for (_, table) in self.tables() {
            table.set_delete_hook(Arc::clone(&hook));
        }
    }

    pub fn pending_unlinks(&self) -> usize {
        self.tables()
            .iter()
            .map(|(_, table)| table.unlinked_len())
            .sum()
    }

    /// Saves one table to its bucket's snapshot file.
    pub fn save_bucket(&self, bucket: Bucket, base: &Path) -> Result<usize> {
        let table = match bucket {
            Bucket::Persistent => self.persistent(),
            Bucket::Volatile => self.volatile(),
        };
        let path = bucket.snapshot_path(base);
        table
            .save_file(&path)
            .map_err(|source| CacheError::SaveFailed {
                bucket,
                path,
                source,
            })
    }

    /// Loads the snapshot files written by [`Buckets::save_bucket`].
    ///
    /// Both files are read before anything is inserted, in either mode, and
    /// a missing file counts as empty. In dual mode records are routed like
    /// seeded items: those with a deadline to the volatile table, the rest
    /// to the persistent one. A record is skipped when its key is live in either
    /// table. Records from readable files are inserted even when another
    /// file fails; the first failure is then returned.
    ///
    /// # Returns
    ///
    /// The total number of entries inserted.
    pub fn load(&self, base: &Path) -> Result<usize> {
        let mut records = Vec::new();
        let mut first_error = None;

        for bucket in [Bucket::Persistent, Bucket::Volatile] {
            let path = bucket.snapshot_path(base);
            match snapshot::read_file(&path) {
                Ok(mut read) => records.append(&mut read),
                Err(SnapshotError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(bucket = %bucket, path = %path.display(), "No snapshot file");
                }
                Err(source) => {
                    warn!(bucket = %bucket, path = %path.display(), error = %source, "Unreadable snapshot");
                    if first_error.is_none() {
                        first_error = Some(CacheError::LoadFailed {
                            bucket,
                            path,
                            source,
                        });
                    }
                }
            }
        }

        let loaded = match self {
            Buckets::Single(table) => table.restore(records),
            Buckets::Dual {
                persistent,
                volatile,
            } => {
                let (expiring, plain): (Vec<Record>, Vec<Record>) = records
                    .into_iter()
                    .partition(|record| record.expires_at_ms.is_some());

                let plain = plain
                    .into_iter()
                    .filter(|record| !volatile.contains(&record.key))
                    .collect();
                let mut loaded = persistent.restore(plain);

                let expiring = expiring
                    .into_iter()
                    .filter(|record| !persistent.contains(&record.key))
                    .collect();
                loaded += volatile.restore(expiring);
                loaded
            }
        };

        match first_error {
            Some(e) => Err(e),
            None => Ok(loaded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn dual() -> Buckets {
        Buckets::new(None, HashMap::new())
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(dual().mode(), BucketMode::Dual);

        let single = Buckets::new(Some(Duration::from_secs(5)), HashMap::new());
        assert_eq!(single.mode(), BucketMode::Single);
        assert!(Arc::ptr_eq(single.persistent(), single.volatile()));
        assert_eq!(single.tables().len(), 1);
    }

    #[test]
    fn test_set_and_setex_move_between_buckets() {
        let buckets = dual();

        buckets.setex("key", Value::from("short"), Duration::from_secs(60));
        assert!(buckets.volatile().contains("key"));
        assert!(!buckets.persistent().contains("key"));

        buckets.set("key", Value::from("long"));
        assert!(buckets.persistent().contains("key"));
        assert!(!buckets.volatile().contains("key"));
        assert_eq!(buckets.len(), 1);

        buckets.setex("key", Value::from("short again"), Duration::from_secs(60));
        assert!(!buckets.persistent().contains("key"));
        assert_eq!(buckets.get("key"), Some(Value::from("short again")));
    }

    #[test]
    fn test_setnx_checks_both_buckets() {
        let buckets = dual();

        buckets.setex("key", Value::from("v1"), Duration::from_secs(60));
        assert!(matches!(
            buckets.setnx("key", Value::from("v2")),
            Err(CacheError::AlreadyExists(_))
        ));
        assert!(buckets.setnx("other", Value::from("v3")).is_ok());
        assert!(buckets.persistent().contains("other"));
    }

    #[test]
    fn test_ttl_routing() {
        let buckets = dual();

        buckets.set("forever", Value::from(1i32));
        buckets.setex("brief", Value::from(2i32), Duration::from_secs(60));

        assert_eq!(buckets.ttl("forever"), Some(Ttl::Never));
        assert!(matches!(buckets.ttl("brief"), Some(Ttl::Remaining(d)) if d <= Duration::from_secs(60)));
        assert_eq!(buckets.ttl("missing"), None);
    }

    #[test]
    fn test_incr_falls_back_to_volatile() {
        let buckets = dual();

        buckets.setex("n", Value::I16(10), Duration::from_secs(60));
        assert_eq!(buckets.incr_by("n", 5).unwrap(), Value::I16(15));

        assert!(matches!(
            buckets.incr_by("missing", 1),
            Err(CacheError::NotFound(_))
        ));

        buckets.set("text", Value::from("x"));
        assert!(matches!(
            buckets.incr_by("text", 1),
            Err(CacheError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_del_and_unlink_cover_both_buckets() {
        let buckets = dual();

        buckets.set("a", Value::from("1"));
        buckets.setex("b", Value::from("2"), Duration::from_secs(60));

        assert_eq!(buckets.del("a"), Some(Value::from("1")));
        assert!(buckets.unlink("b"));
        assert!(!buckets.unlink("b"));
        assert!(buckets.is_empty());
        assert_eq!(buckets.pending_unlinks(), 1);
    }

    #[test]
    fn test_keys_union() {
        let buckets = dual();

        buckets.set("user:1", Value::from("a"));
        buckets.setex("user:2", Value::from("b"), Duration::from_secs(60));
        buckets.set("order:1", Value::from("c"));

        let mut keys: Vec<String> = buckets
            .keys("^user:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["user:1", "user:2"]);
        assert!(buckets.keys("(").is_err());
    }

    #[test]
    fn test_single_mode_applies_default_ttl() {
        let buckets = Buckets::new(Some(Duration::from_millis(20)), HashMap::new());

        buckets.set("key", Value::from("v"));
        assert!(matches!(buckets.ttl("key"), Some(Ttl::Remaining(_))));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(buckets.get("key"), None);
    }

    #[test]
    fn test_seed_routing() {
        let mut seed = HashMap::new();
        seed.insert("plain".to_string(), Item::new(Value::from("p")));
        seed.insert(
            "timed".to_string(),
            Item::with_ttl(Value::from("t"), Duration::from_secs(60)),
        );

        let buckets = Buckets::new(None, seed);
        assert!(buckets.persistent().contains("plain"));
        assert!(buckets.volatile().contains("timed"));
        assert_eq!(buckets.len(), 2);
    }

    #[test]
    fn test_snapshot_paths() {
        let base = Path::new("/var/lib/tidekv/dump");
        assert_eq!(
            Bucket::Persistent.snapshot_path(base),
            PathBuf::from("/var/lib/tidekv/dump.persistent")
        );
        assert_eq!(
            Bucket::Volatile.snapshot_path(base),
            PathBuf::from("/var/lib/tidekv/dump.volatile")
        );
    }

    #[test]
    fn test_load_missing_files_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("absent");

        assert_eq!(dual().load(&base).unwrap(), 0);
        let single = Buckets::new(Some(Duration::from_secs(60)), HashMap::new());
        assert_eq!(single.load(&base).unwrap(), 0);
    }

    #[test]
    fn test_load_tries_every_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dump");

        let source = dual();
        source.set("p", Value::from("1"));
        source.save_bucket(Bucket::Persistent, &base).unwrap();
        std::fs::write(Bucket::Volatile.snapshot_path(&base), b"garbage").unwrap();

        let target = dual();
        let err = target.load(&base).unwrap_err();
        assert!(matches!(
            err,
            CacheError::LoadFailed { bucket: Bucket::Volatile, .. }
        ));
        assert_eq!(target.get("p"), Some(Value::from("1")));
    }

    #[test]
    fn test_load_skips_keys_live_in_other_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dump");

        let source = dual();
        source.setex("k", Value::from("old"), Duration::from_secs(60));
        source.set("q", Value::from("old"));
        source.save_bucket(Bucket::Persistent, &base).unwrap();
        source.save_bucket(Bucket::Volatile, &base).unwrap();

        let target = dual();
        target.set("k", Value::from("live"));
        target.setex("q", Value::from("live"), Duration::from_secs(60));

        assert_eq!(target.load(&base).unwrap(), 0);
        assert_eq!(target.len(), 2);
        assert!(!target.volatile().contains("k"));
        assert!(!target.persistent().contains("q"));
        assert_eq!(target.ttl("k"), Some(Ttl::Never));
        assert_eq!(target.get("q"), Some(Value::from("live")));
    }

    #[test]
    fn test_load_routes_by_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dump");

        let single = Buckets::new(Some(Duration::from_secs(60)), HashMap::new());
        single.set("a", Value::from("1"));
        single.save_bucket(Bucket::Persistent, &base).unwrap();

        let target = dual();
        assert_eq!(target.load(&base).unwrap(), 1);
        assert!(target.volatile().contains("a"));
        assert!(!target.persistent().contains("a"));
    }
}
