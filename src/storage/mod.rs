//! Storage Module
//!
//! The building blocks under the cache: typed values, the expiring entry
//! table, the deferred-deletion queue, the snapshot format and the background
//! cleaners that keep tables tidy.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 EntryTable                   │
//! │  RwLock<entries + deadline index + hook>     │
//! │  UnlinkQueue (Mutex<VecDeque>)               │
//! └──────────────────────────────────────────────┘
//!        ▲ sweep_expired          ▲ drain_unlinked
//!        │                        │
//!  ┌─────┴──────┐          ┌──────┴────────┐
//!  │  sweeper   │          │ unlink drainer│
//!  │  Cleaner   │          │   Cleaner     │
//!  └────────────┘          └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use tidekv::storage::{EntryTable, Expiry, Ttl, Value};
//! use std::time::Duration;
//!
//! let table = EntryTable::new("example", None);
//! table.set("hits", Value::U32(41), Expiry::Default);
//! assert_eq!(table.incr_by("hits", 1).unwrap(), Value::U32(42));
//! assert_eq!(table.ttl("hits"), Some(Ttl::Never));
//!
//! table.set("token", Value::from("abc"), Expiry::After(Duration::from_secs(3600)));
//! assert!(matches!(table.ttl("token"), Some(Ttl::Remaining(_))));
//! ```

pub mod expiry;
pub mod snapshot;
pub mod table;
pub mod unlink;
pub mod value;

// Re-export commonly used types
pub use expiry::{CleanFn, Cleaner};
pub use snapshot::{Record, SnapshotError};
pub use table::{
    DeleteHook, EntryTable, Expiry, Item, TableStats, Ttl, DEFAULT_SWEEP_BUDGET,
};
pub use unlink::{UnlinkQueue, Unlinked};
pub use value::{IncrError, Value, ValueKind};
