//! Expiring Entry Table
//!
//! An [`EntryTable`] is one lock-protected map from key to [`Item`]. It is the
//! unit of locking in the cache: every operation takes the table's `RwLock`
//! once, and nothing is ever called back while the lock is held.
//!
//! ## Expiry
//!
//! Keys with a deadline are expired in two ways:
//! 1. **Lazy**: every lookup checks the deadline, so an expired entry is never
//!    returned even if no sweep has run yet.
//! 2. **Active**: [`EntryTable::sweep_expired`] removes entries in deadline
//!    order, visiting at most `budget` of them per call so the write lock is
//!    only ever held for a bounded time.
//!
//! ```text
//!   entries   HashMap<String, Item>           lookups
//!   deadlines BTreeSet<(Instant, String)>     sweeps, soonest first
//! ```
//!
//! ## Deletion Hook
//!
//! A single optional hook observes deletions. It is cloned out of the table
//! under the lock and invoked after the lock is released: inline for `delete`,
//! on a blocking worker for sweeps, and from the drain cycle for `unlink`.

use crate::error::{CacheError, Result};
use crate::storage::snapshot::{self, Record, SnapshotError};
use crate::storage::unlink::UnlinkQueue;
use crate::storage::value::{IncrError, Value};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Entries visited per active-expiry pass.
pub const DEFAULT_SWEEP_BUDGET: usize = 20;

/// How long a written entry should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Use the table's default TTL (which may be "never")
    Default,
    /// Never expire, whatever the table default
    Never,
    /// Expire this long after the write
    After(Duration),
}

/// Remaining lifetime of a live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Never,
    Remaining(Duration),
}

/// A stored value with optional expiry time.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub value: Value,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
}

impl Item {
    /// Creates an item without expiry.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Creates an item expiring `ttl` from now.
    pub fn with_ttl(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// An item is expired once its deadline is strictly in the past.
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now > exp).unwrap_or(false)
    }

    pub fn ttl(&self) -> Ttl {
        match self.expires_at {
            Some(exp) => Ttl::Remaining(exp.saturating_duration_since(Instant::now())),
            None => Ttl::Never,
        }
    }
}

/// Observer for deleted entries: `(key, previous value)`.
pub type DeleteHook = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Entries currently stored, including expired ones not yet swept
    pub keys: usize,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    /// Entries removed by active expiry
    pub expired: u64,
    /// Unlinked entries still waiting for their hook
    pub pending_unlinks: usize,
}

/// Everything behind the table lock.
#[derive(Default)]
struct TableState {
    entries: HashMap<String, Item>,
    deadlines: BTreeSet<(Instant, String)>,
    hook: Option<DeleteHook>,
}

impl TableState {
    fn insert(&mut self, key: String, item: Item) -> Option<Item> {
        let old = self.remove(&key);
        if let Some(exp) = item.expires_at {
            self.deadlines.insert((exp, key.clone()));
        }
        self.entries.insert(key, item);
        old
    }

    fn remove(&mut self, key: &str) -> Option<Item> {
        let item = self.entries.remove(key)?;
        if let Some(exp) = item.expires_at {
            self.deadlines.remove(&(exp, key.to_string()));
        }
        Some(item)
    }

    #[inline]
    fn live(&self, key: &str, now: Instant) -> Option<&Item> {
        self.entries.get(key).filter(|item| !item.is_expired_at(now))
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}

/// A single expiring key-value table.
///
/// # Thread Safety
///
/// Designed to be wrapped in an `Arc` and shared between the executor, the
/// read handlers and the background cleaners. All operations are thread-safe.
///
/// # Example
///
/// ```
/// use tidekv::storage::{EntryTable, Expiry, Value};
/// use std::time::Duration;
///
/// let table = EntryTable::new("example", None);
/// table.set("name", Value::from("Ariz"), Expiry::Default);
/// assert_eq!(table.get("name"), Some(Value::from("Ariz")));
///
/// table.set("session", Value::from("abc123"), Expiry::After(Duration::from_secs(60)));
/// assert!(table.contains("session"));
/// ```
pub struct EntryTable {
    /// Name used in logs
    name: &'static str,
    /// TTL applied by `Expiry::Default`
    default_ttl: Option<Duration>,
    state: RwLock<TableState>,
    unlinked: UnlinkQueue,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for EntryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryTable")
            .field("name", &self.name)
            .field("default_ttl", &self.default_ttl)
            .field("keys", &self.len())
            .field("pending_unlinks", &self.unlinked.len())
            .finish()
    }
}

impl EntryTable {
    /// Creates an empty table. `default_ttl = None` means entries written
    /// with `Expiry::Default` never expire.
    pub fn new(name: &'static str, default_ttl: Option<Duration>) -> Self {
        Self::with_entries(name, default_ttl, HashMap::new())
    }

    /// Creates a table pre-seeded with `entries`.
    pub fn with_entries(
        name: &'static str,
        default_ttl: Option<Duration>,
        entries: HashMap<String, Item>,
    ) -> Self {
        let mut state = TableState::default();
        for (key, item) in entries {
            state.insert(key, item);
        }

        Self {
            name,
            default_ttl,
            state: RwLock::new(state),
            unlinked: UnlinkQueue::new(),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Registers the deletion hook, replacing any previous one.
    pub fn set_delete_hook(&self, hook: DeleteHook) {
        self.state.write().hook = Some(hook);
    }

    fn deadline(&self, expiry: Expiry) -> Option<Instant> {
        let ttl = match expiry {
            Expiry::Default => self.default_ttl,
            Expiry::Never => None,
            Expiry::After(ttl) => Some(ttl),
        };
        ttl.and_then(|ttl| Instant::now().checked_add(ttl))
    }

    /// Inserts or overwrites an entry.
    pub fn set(&self, key: impl Into<String>, value: Value, expiry: Expiry) {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let item = Item {
            value,
            expires_at: self.deadline(expiry),
        };
        self.state.write().insert(key.into(), item);
    }

    /// Inserts an entry only if no live entry exists for the key.
    ///
    /// An expired entry that has not been swept yet counts as absent.
    pub fn set_if_absent(&self, key: impl Into<String>, value: Value, expiry: Expiry) -> Result<()> {
        let key = key.into();
        let item = Item {
            value,
            expires_at: self.deadline(expiry),
        };

        let mut state = self.state.write();
        if state.live(&key, Instant::now()).is_some() {
            return Err(CacheError::AlreadyExists(key));
        }
        self.set_count.fetch_add(1, Ordering::Relaxed);
        state.insert(key, item);
        Ok(())
    }

    /// Gets the value for a key, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        self.state
            .read()
            .live(key, Instant::now())
            .map(|item| item.value.clone())
    }

    /// Gets the full item (value and deadline) for a live key.
    pub fn get_item(&self, key: &str) -> Option<Item> {
        self.state.read().live(key, Instant::now()).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().live(key, Instant::now()).is_some()
    }

    /// Remaining lifetime of a live key.
    pub fn ttl(&self, key: &str) -> Option<Ttl> {
        self.state.read().live(key, Instant::now()).map(Item::ttl)
    }

    /// Adds `delta` to an integer value in place, keeping its width and its
    /// deadline. The stored value is left untouched on any error.
    pub fn incr_by(&self, key: &str, delta: i64) -> Result<Value> {
        let mut state = self.state.write();
        let now = Instant::now();

        let item = state
            .entries
            .get_mut(key)
            .filter(|item| !item.is_expired_at(now))
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;

        let kind = item.value.kind();
        let next = item.value.checked_incr(delta).map_err(|e| match e {
            IncrError::Overflow => CacheError::Overflow {
                key: key.to_string(),
                kind,
                delta,
            },
            IncrError::NotAnInteger => CacheError::TypeMismatch {
                key: key.to_string(),
                kind,
            },
        })?;

        item.value = next.clone();
        Ok(next)
    }

    /// Deletes a key, running the deletion hook with its previous value.
    ///
    /// The hook runs on the calling thread after the lock is released, so it
    /// may freely call back into this table.
    ///
    /// # Returns
    ///
    /// The removed value, or `None` if the key was absent or already expired.
    pub fn delete(&self, key: &str) -> Option<Value> {
        let (value, hook) = self.take(key)?;
        if let Some(hook) = hook {
            hook(key, &value);
        }
        Some(value)
    }

    /// Deletes a key and hands the deletion hook to a blocking worker, so a
    /// slow hook never holds up the caller.
    pub fn delete_detached(&self, key: &str) -> Option<Value> {
        let (value, hook) = self.take(key)?;
        if let Some(hook) = hook {
            spawn_hooks(hook, vec![(key.to_string(), value.clone())]);
        }
        Some(value)
    }

    fn take(&self, key: &str) -> Option<(Value, Option<DeleteHook>)> {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write();
        let removed = state.remove(key).filter(|item| !item.is_expired())?;
        Some((removed.value, state.hook.clone()))
    }

    /// Removes a key without notifying the hook. Used when a key moves to the
    /// other bucket rather than leaving the cache.
    pub fn discard(&self, key: &str) -> bool {
        self.state.write().remove(key).is_some()
    }

    /// Removes a key now and queues its hook for the next drain cycle.
    ///
    /// # Returns
    ///
    /// Returns `true` if a live key was removed.
    pub fn unlink(&self, key: &str) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let removed = self.state.write().remove(key).filter(|item| !item.is_expired());
        match removed {
            Some(item) => {
                self.unlinked.push_back(key.to_string(), item.value);
                true
            }
            None => false,
        }
    }

    /// Runs the deletion hook for every queued unlink, once each.
    ///
    /// # Returns
    ///
    /// The number of queued entries flushed.
    pub fn drain_unlinked(&self) -> usize {
        let pending = self.unlinked.take_all();
        if pending.is_empty() {
            return 0;
        }

        let count = pending.len();
        let hook = self.state.read().hook.clone();
        if let Some(hook) = hook {
            for (key, value) in &pending {
                hook(key, value);
            }
        }

        debug!(table = self.name, drained = count, "Flushed unlinked keys");
        count
    }

    /// Number of unlinked entries waiting for the drain cycle.
    pub fn unlinked_len(&self) -> usize {
        self.unlinked.len()
    }

    /// Returns every live entry whose key matches the regular expression.
    ///
    /// The pattern is unanchored: `user` matches `user:1` and `superuser`.
    pub fn keys_matching(&self, pattern: &str) -> Result<Vec<(String, Value)>> {
        let regex = Regex::new(pattern)?;
        let now = Instant::now();

        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .filter(|(key, item)| !item.is_expired_at(now) && regex.is_match(key))
            .map(|(key, item)| (key.clone(), item.value.clone()))
            .collect())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry. The deletion hook is not invoked.
    pub fn clear(&self) {
        self.state.write().clear();
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            keys: self.len(),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
            pending_unlinks: self.unlinked.len(),
        }
    }

    /// Removes up to `budget` expired entries, soonest deadline first.
    ///
    /// Stops early at the first entry that is still live, so a pass over a
    /// table with nothing to expire costs one index lookup. Hooks for the
    /// removed entries run together on a blocking worker after the lock is
    /// released; the caller never waits for them.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn sweep_expired(&self, budget: usize) -> usize {
        let now = Instant::now();

        let (victims, hook) = {
            let mut state = self.state.write();
            let mut victims = Vec::new();

            while victims.len() < budget {
                match state.deadlines.first() {
                    Some((deadline, _)) if *deadline < now => {}
                    _ => break,
                }
                let Some((_, key)) = state.deadlines.pop_first() else {
                    break;
                };
                if let Some(item) = state.entries.remove(&key) {
                    victims.push((key, item.value));
                }
            }

            (victims, state.hook.clone())
        };

        let expired = victims.len();
        if expired > 0 {
            self.expired_count
                .fetch_add(expired as u64, Ordering::Relaxed);
            trace!(table = self.name, expired = expired, "Swept expired keys");

            if let Some(hook) = hook {
                spawn_hooks(hook, victims);
            }
        }

        expired
    }

    /// Live entries as snapshot records with wall-clock deadlines.
    fn records(&self) -> Vec<Record> {
        let now = Instant::now();
        let wall = SystemTime::now();

        let state = self.state.read();
        state
            .entries
            .iter()
            .filter(|(_, item)| !item.is_expired_at(now))
            .map(|(key, item)| Record {
                key: key.clone(),
                value: item.value.clone(),
                expires_at_ms: item
                    .expires_at
                    .map(|exp| unix_ms(wall + exp.saturating_duration_since(now))),
            })
            .collect()
    }

    /// Writes the live entries to `writer`.
    ///
    /// # Returns
    ///
    /// The number of entries written.
    pub fn save<W: Write>(&self, mut writer: W) -> std::result::Result<usize, SnapshotError> {
        let records = self.records();
        let encoded = snapshot::encode(&records)?;
        writer.write_all(&encoded)?;
        writer.flush()?;
        Ok(records.len())
    }

    /// Merges a snapshot into the table.
    ///
    /// Loaded entries only fill gaps: a key that already has a live entry
    /// keeps it. Entries whose deadline passed while on disk are skipped.
    ///
    /// # Returns
    ///
    /// The number of entries inserted.
    pub fn load<R: Read>(&self, reader: R) -> std::result::Result<usize, SnapshotError> {
        Ok(self.restore(snapshot::read(reader)?))
    }

    /// Inserts decoded snapshot records under the same rules as
    /// [`EntryTable::load`].
    ///
    /// # Returns
    ///
    /// The number of entries inserted.
    pub fn restore(&self, records: Vec<Record>) -> usize {
        let now = Instant::now();
        let wall_ms = unix_ms(SystemTime::now());
        let mut loaded = 0;

        let mut state = self.state.write();
        for record in records {
            let expires_at = match record.expires_at_ms {
                None => None,
                Some(ms) if ms <= wall_ms => continue,
                Some(ms) => now.checked_add(Duration::from_millis(ms - wall_ms)),
            };
            if state.live(&record.key, now).is_some() {
                continue;
            }
            state.insert(
                record.key,
                Item {
                    value: record.value,
                    expires_at,
                },
            );
            loaded += 1;
        }

        loaded
    }

    /// Saves to `path`, writing a sibling `.tmp` file first and renaming it
    /// into place.
    pub fn save_file(&self, path: &Path) -> std::result::Result<usize, SnapshotError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        let file = File::create(&tmp)?;
        let saved = self.save(BufWriter::new(file))?;
        fs::rename(&tmp, path)?;

        debug!(table = self.name, path = %path.display(), saved = saved, "Saved snapshot");
        Ok(saved)
    }

    pub fn load_file(&self, path: &Path) -> std::result::Result<usize, SnapshotError> {
        let file = File::open(path)?;
        let loaded = self.load(BufReader::new(file))?;

        debug!(table = self.name, path = %path.display(), loaded = loaded, "Loaded snapshot");
        Ok(loaded)
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Runs the hook for a batch of swept entries off the sweeping thread.
fn spawn_hooks(hook: DeleteHook, victims: Vec<(String, Value)>) {
    let run = move || {
        for (key, value) in &victims {
            hook(key, value);
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(run);
        }
        Err(_) => {
            std::thread::spawn(run);
        }
    }
}
