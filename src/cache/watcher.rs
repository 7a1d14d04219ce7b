//! Watcher Daemon
//!
//! A user-supplied periodic callback against the whole cache.
//!
//! ```text
//!                replace_watch_op
//!  Unconfigured ─────────────────▶ Stopped ◀──────────┐
//!                                   │   ▲              │ replace_watch_op
//!                     start_watching│   │stop_watching │ (stops first)
//!                                   ▼   │              │
//!                                  Running ────────────┘
//! ```
//!
//! The callback runs inline on the loop task, never spawned. A loop started
//! after a non-waiting stop first waits for the previous loop to exit, so two
//! callbacks never overlap. The loop only holds a weak reference to the cache
//! and exits once the cache is gone.

use crate::cache::{Cache, CacheInner};
use crate::error::{CacheError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// A watch callback. Errors and panics are logged and the loop carries on.
pub type WatchOp = Arc<dyn Fn(Cache) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
struct WatchConfig {
    interval: Duration,
    op: WatchOp,
}

struct WatchLoop {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchLoop {
    /// Spawns a loop that starts ticking once `previous` has exited.
    fn spawn(config: WatchConfig, cache: Weak<CacheInner>, previous: Option<JoinHandle<()>>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            watch_loop(config, cache, stop_rx).await;
        });
        Self { stop_tx, task }
    }

    /// Signals the loop and waits until it has exited.
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

enum WatcherState {
    Unconfigured,
    /// The handle is a loop told to stop that may not have exited yet.
    Stopped(WatchConfig, Option<JoinHandle<()>>),
    Running(WatchConfig, WatchLoop),
}

impl WatcherState {
    fn name(&self) -> &'static str {
        match self {
            WatcherState::Unconfigured => "unconfigured",
            WatcherState::Stopped(..) => "stopped",
            WatcherState::Running(..) => "running",
        }
    }
}

/// Owns the watcher state machine for one cache.
pub(crate) struct Watcher {
    state: Mutex<WatcherState>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.try_lock() {
            Ok(state) => state.name(),
            Err(_) => "busy",
        };
        f.debug_struct("Watcher").field("state", &state).finish()
    }
}

impl Watcher {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WatcherState::Unconfigured),
        }
    }

    /// Installs a new callback. A running loop is stopped first and the
    /// watcher is left stopped.
    pub(crate) async fn replace(&self, interval: Duration, op: WatchOp) {
        let mut state = self.state.lock().await;

        let draining = match mem::replace(&mut *state, WatcherState::Unconfigured) {
            WatcherState::Running(_, running) => {
                running.stop().await;
                None
            }
            WatcherState::Stopped(_, draining) => draining,
            WatcherState::Unconfigured => None,
        };
        *state = WatcherState::Stopped(WatchConfig { interval, op }, draining);

        debug!(interval_ms = interval.as_millis() as u64, "Watch operation replaced");
    }

    pub(crate) async fn start(&self, cache: Weak<CacheInner>) -> Result<()> {
        let mut state = self.state.lock().await;

        match mem::replace(&mut *state, WatcherState::Unconfigured) {
            WatcherState::Unconfigured => Err(CacheError::WatcherUnconfigured),
            WatcherState::Running(config, running) => {
                *state = WatcherState::Running(config, running);
                Err(CacheError::WatcherRunning)
            }
            WatcherState::Stopped(config, draining) => {
                let running = WatchLoop::spawn(config.clone(), cache, draining);
                *state = WatcherState::Running(config, running);
                info!("Watcher started");
                Ok(())
            }
        }
    }

    /// Stops the loop and waits for it to exit. Also waits for a loop left
    /// behind by [`Watcher::stop_async`].
    ///
    /// Must not be awaited from inside a watch callback: the loop would be
    /// waiting on itself.
    pub(crate) async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        match mem::replace(&mut *state, WatcherState::Unconfigured) {
            WatcherState::Running(config, running) => {
                running.stop().await;
                *state = WatcherState::Stopped(config, None);
                info!("Watcher stopped");
                Ok(())
            }
            WatcherState::Stopped(config, Some(draining)) => {
                let _ = draining.await;
                *state = WatcherState::Stopped(config, None);
                Err(CacheError::WatcherStopped)
            }
            other => {
                let err = not_running(&other);
                *state = other;
                Err(err)
            }
        }
    }

    /// Signals the loop to stop without waiting for it to exit.
    ///
    /// The state lock is released right away, so the callback that asked to
    /// stop may go on to query or restart the watcher. A restarted loop waits
    /// for this one to exit before its first tick.
    pub(crate) async fn stop_async(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        match mem::replace(&mut *state, WatcherState::Unconfigured) {
            WatcherState::Running(config, running) => {
                let _ = running.stop_tx.send(true);
                *state = WatcherState::Stopped(config, Some(running.task));
                info!("Watcher stop requested");
                Ok(())
            }
            other => {
                let err = not_running(&other);
                *state = other;
                Err(err)
            }
        }
    }

    pub(crate) async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, WatcherState::Running(..))
    }
}

fn not_running(state: &WatcherState) -> CacheError {
    match state {
        WatcherState::Unconfigured => CacheError::WatcherUnconfigured,
        _ => CacheError::WatcherStopped,
    }
}

async fn watch_loop(
    config: WatchConfig,
    cache: Weak<CacheInner>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(time::Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            result = stop_rx.changed() => {
                if result.is_err() || *stop_rx.borrow() {
                    debug!("Watcher received stop signal");
                    return;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let Some(inner) = cache.upgrade() else {
            debug!("Cache dropped, watcher exiting");
            return;
        };

        let op = Arc::clone(&config.op);
        let tick = async move { op(Cache { inner }).await };

        match AssertUnwindSafe(tick).catch_unwind().await {
            Ok(Ok(())) => trace!("Watch operation finished"),
            Ok(Err(e)) => warn!(error = %e, "Watch operation failed"),
            Err(_) => error!("Watch operation panicked"),
        }
    }
}
