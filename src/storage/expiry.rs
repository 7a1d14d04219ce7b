//! Background Cleaners
//!
//! A [`Cleaner`] is a Tokio task that ticks at a fixed interval and runs one
//! maintenance pass over an [`EntryTable`] per tick. Each cache runs two kinds:
//!
//! - the **sweeper**, which calls [`EntryTable::sweep_expired`] with a small
//!   budget. Lookups already hide expired entries (lazy expiry), so the sweeper
//!   only exists to reclaim memory for keys nobody reads again.
//! - the **unlink drainer**, which calls [`EntryTable::drain_unlinked`] so
//!   deletion hooks for unlinked keys run on their own cadence.
//!
//! ```text
//!        interval tick
//!   ┌──────────────────────┐
//!   │        Cleaner       │──── op(&table) ───▶ EntryTable
//!   └──────────┬───────────┘
//!              │ watch::channel(false → true)
//!          stop / Drop
//! ```
//!
//! A pass runs synchronously on the task. Both built-in passes are bounded,
//! so a tick never holds a table lock for long.

use crate::storage::table::EntryTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

/// One maintenance pass. Returns how many entries it handled.
pub type CleanFn = Arc<dyn Fn(&EntryTable) -> usize + Send + Sync>;

/// A handle to a running cleaner task.
///
/// When this handle is dropped, the task is told to stop.
pub struct Cleaner {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("name", &self.name)
            .field("stopped", &*self.shutdown_tx.borrow())
            .finish()
    }
}

impl Cleaner {
    /// Starts a cleaner running `op` against `table` every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        name: &'static str,
        table: Arc<EntryTable>,
        interval: Duration,
        op: CleanFn,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(cleaner_loop(name, table, interval, op, shutdown_rx));

        info!(
            cleaner = name,
            interval_ms = interval.as_millis() as u64,
            "Background cleaner started"
        );

        Self {
            name,
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Starts the active-expiry sweeper for `table`.
    pub fn sweeper(table: Arc<EntryTable>, interval: Duration, budget: usize) -> Self {
        Self::start(
            "sweeper",
            table,
            interval,
            Arc::new(move |table: &EntryTable| table.sweep_expired(budget)),
        )
    }

    /// Starts the drain cycle that runs deletion hooks for unlinked keys.
    pub fn unlink_drainer(table: Arc<EntryTable>, interval: Duration) -> Self {
        Self::start(
            "unlink-drainer",
            table,
            interval,
            Arc::new(|table: &EntryTable| table.drain_unlinked()),
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the task to stop after its current pass.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!(cleaner = self.name, "Background cleaner stopping");
        }
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn cleaner_loop(
    name: &'static str,
    table: Arc<EntryTable>,
    period: Duration,
    op: CleanFn,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!(cleaner = name, table = table.name(), "Cleaner received shutdown signal");
                    return;
                }
            }
        }

        let handled = op(&table);
        if handled > 0 {
            debug!(
                cleaner = name,
                table = table.name(),
                handled = handled,
                keys_remaining = table.len(),
                "Cleaner pass finished"
            );
        } else {
            trace!(cleaner = name, table = table.name(), "Cleaner pass found nothing");
        }
    }
}
