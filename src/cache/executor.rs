//! Job Executor
//!
//! Every cache operation becomes a [`Job`] on one bounded queue with a single
//! consumer. The consumer applies mutations itself, one at a time and in
//! queue order, so writes are totally ordered without a lock spanning both
//! tables. Reads are handed to spawned tasks, at most `read_concurrency` at
//! once; when every read slot is busy the consumer waits for a permit.
//!
//! ```text
//!  submit ──▶ [ job | job | job | ... ] ──▶ consumer
//!                                             │
//!                        mutation ────────────┤ applied inline
//!                                             │
//!                        read ──▶ permit ──▶ tokio::spawn
//! ```
//!
//! A [`Job::Shutdown`] closes the queue, runs whatever was already queued,
//! waits for in-flight reads to finish and then acknowledges.

use crate::cache::buckets::Buckets;
use crate::error::{CacheError, Result};
use crate::storage::{Ttl, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, trace};

/// Operation code of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Set,
    Setex,
    Setnx,
    Del,
    Unlink,
    Incr,
    Incrby,
    Get,
    Ttl,
    Shutdown,
}

impl Op {
    /// Mutations run inline on the consumer, in submission order.
    pub fn is_mutation(self) -> bool {
        !matches!(self, Op::Get | Op::Ttl | Op::Shutdown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Set => "set",
            Op::Setex => "setex",
            Op::Setnx => "setnx",
            Op::Del => "del",
            Op::Unlink => "unlink",
            Op::Incr => "incr",
            Op::Incrby => "incrby",
            Op::Get => "get",
            Op::Ttl => "ttl",
            Op::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work. Jobs that produce a result carry the sending half of a
/// oneshot channel; the rest are fire-and-forget.
#[derive(Debug)]
pub enum Job {
    Set {
        key: String,
        value: Value,
    },
    Setex {
        key: String,
        value: Value,
        ttl: Duration,
    },
    Setnx {
        key: String,
        value: Value,
        done: oneshot::Sender<Result<()>>,
    },
    Del {
        key: String,
    },
    Unlink {
        key: String,
    },
    Incr {
        key: String,
        done: oneshot::Sender<Result<Value>>,
    },
    /// `delta` is parsed by the consumer, so a bad argument is reported
    /// through `done` like any other failure
    Incrby {
        key: String,
        delta: String,
        done: oneshot::Sender<Result<Value>>,
    },
    Get {
        key: String,
        done: oneshot::Sender<Option<Value>>,
    },
    Ttl {
        key: String,
        done: oneshot::Sender<Option<Ttl>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

impl Job {
    pub fn op(&self) -> Op {
        match self {
            Job::Set { .. } => Op::Set,
            Job::Setex { .. } => Op::Setex,
            Job::Setnx { .. } => Op::Setnx,
            Job::Del { .. } => Op::Del,
            Job::Unlink { .. } => Op::Unlink,
            Job::Incr { .. } => Op::Incr,
            Job::Incrby { .. } => Op::Incrby,
            Job::Get { .. } => Op::Get,
            Job::Ttl { .. } => Op::Ttl,
            Job::Shutdown { .. } => Op::Shutdown,
        }
    }
}

/// Handle to the consumer task.
#[derive(Debug)]
pub struct Executor {
    jobs: mpsc::Sender<Job>,
    read_concurrency: usize,
}

impl Executor {
    /// Spawns the consumer. Must be called from within a Tokio runtime.
    pub fn start(buckets: Buckets, queue_capacity: usize, read_concurrency: usize) -> Self {
        let read_concurrency = read_concurrency.max(1);
        let (jobs, rx) = mpsc::channel(queue_capacity.max(1));

        tokio::spawn(consume(buckets, rx, read_concurrency));

        debug!(
            queue_capacity = queue_capacity,
            read_concurrency = read_concurrency,
            "Job executor started"
        );

        Self {
            jobs,
            read_concurrency,
        }
    }

    /// Queues a job, waiting for space if the queue is full.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| CacheError::ExecutorStopped)
    }

    /// Drains the queue and stops the consumer.
    ///
    /// Jobs queued before the call still run; jobs submitted afterwards fail
    /// with [`CacheError::ExecutorStopped`]. Resolves once the last in-flight
    /// read has completed.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.submit(Job::Shutdown { done }).await?;
        rx.await.map_err(|_| CacheError::ExecutorStopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.jobs.is_closed()
    }

    pub fn read_concurrency(&self) -> usize {
        self.read_concurrency
    }
}

async fn consume(buckets: Buckets, mut rx: mpsc::Receiver<Job>, read_concurrency: usize) {
    let reads = Arc::new(Semaphore::new(read_concurrency));

    while let Some(job) = rx.recv().await {
        let done = match job {
            Job::Shutdown { done } => done,
            job => {
                dispatch(&buckets, job, &reads).await;
                continue;
            }
        };

        rx.close();
        let mut waiters = vec![done];
        let mut drained = 0usize;
        while let Some(job) = rx.recv().await {
            match job {
                Job::Shutdown { done } => waiters.push(done),
                job => {
                    drained += 1;
                    dispatch(&buckets, job, &reads).await;
                }
            }
        }

        let permits = u32::try_from(read_concurrency).unwrap_or(u32::MAX);
        let _all_reads_done = reads.acquire_many(permits).await;

        info!(drained = drained, "Job executor drained and stopped");
        for done in waiters {
            let _ = done.send(());
        }
        return;
    }

    debug!("Job queue closed, executor exiting");
}

async fn dispatch(buckets: &Buckets, job: Job, reads: &Arc<Semaphore>) {
    trace!(op = %job.op(), "Dispatching job");

    match job {
        Job::Set { key, value } => buckets.set(&key, value),
        Job::Setex { key, value, ttl } => buckets.setex(&key, value, ttl),
        Job::Setnx { key, value, done } => {
            let _ = done.send(buckets.setnx(&key, value));
        }
        Job::Del { key } => {
            buckets.del(&key);
        }
        Job::Unlink { key } => {
            buckets.unlink(&key);
        }
        Job::Incr { key, done } => {
            let _ = done.send(buckets.incr_by(&key, 1));
        }
        Job::Incrby { key, delta, done } => {
            let result = parse_delta(&delta).and_then(|delta| buckets.incr_by(&key, delta));
            let _ = done.send(result);
        }
        job @ (Job::Get { .. } | Job::Ttl { .. }) => {
            // The semaphore is never closed, so acquiring only waits.
            let Ok(permit) = Arc::clone(reads).acquire_owned().await else {
                return;
            };
            let buckets = buckets.clone();
            tokio::spawn(async move {
                read(&buckets, job);
                drop(permit);
            });
        }
        Job::Shutdown { done } => {
            let _ = done.send(());
        }
    }
}

fn read(buckets: &Buckets, job: Job) {
    match job {
        Job::Get { key, done } => {
            let _ = done.send(buckets.get(&key));
        }
        Job::Ttl { key, done } => {
            let _ = done.send(buckets.ttl(&key));
        }
        other => debug!(op = %other.op(), "Ignoring non-read job on read path"),
    }
}

fn parse_delta(delta: &str) -> Result<i64> {
    delta
        .trim()
        .parse()
        .map_err(|_| CacheError::Syntax(format!("'{}' is not a valid increment", delta)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn buckets() -> Buckets {
        Buckets::new(None, HashMap::new())
    }

    async fn get(executor: &Executor, key: &str) -> Option<Value> {
        let (done, rx) = oneshot::channel();
        executor
            .submit(Job::Get {
                key: key.to_string(),
                done,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[test]
    fn test_op_classification() {
        for op in [
            Op::Set,
            Op::Setex,
            Op::Setnx,
            Op::Del,
            Op::Unlink,
            Op::Incr,
            Op::Incrby,
        ] {
            assert!(op.is_mutation(), "{} should be a mutation", op);
        }
        assert!(!Op::Get.is_mutation());
        assert!(!Op::Ttl.is_mutation());
    }

    #[test]
    fn test_parse_delta() {
        assert_eq!(parse_delta("3").unwrap(), 3);
        assert_eq!(parse_delta(" -12 ").unwrap(), -12);
        assert!(matches!(parse_delta("three"), Err(CacheError::Syntax(_))));
        assert!(matches!(parse_delta("1.5"), Err(CacheError::Syntax(_))));
    }

    #[tokio::test]
    async fn test_reads_see_prior_writes() {
        let executor = Executor::start(buckets(), 16, 4);

        executor
            .submit(Job::Set {
                key: "a".to_string(),
                value: Value::from("1"),
            })
            .await
            .unwrap();
        assert_eq!(get(&executor, "a").await, Some(Value::from("1")));

        executor
            .submit(Job::Del {
                key: "a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(get(&executor, "a").await, None);
    }

    #[tokio::test]
    async fn test_mutations_apply_in_order() {
        let executor = Executor::start(buckets(), 8, 2);

        executor
            .submit(Job::Set {
                key: "n".to_string(),
                value: Value::I32(0),
            })
            .await
            .unwrap();

        let mut pending = Vec::new();
        for _ in 0..100 {
            let (done, rx) = oneshot::channel();
            executor
                .submit(Job::Incr {
                    key: "n".to_string(),
                    done,
                })
                .await
                .unwrap();
            pending.push(rx);
        }

        // Each increment observes every earlier one
        for (i, rx) in pending.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap().unwrap(), Value::I32(i as i32 + 1));
        }
    }

    #[tokio::test]
    async fn test_incrby_reports_syntax_error() {
        let executor = Executor::start(buckets(), 8, 2);

        let (done, rx) = oneshot::channel();
        executor
            .submit(Job::Incrby {
                key: "n".to_string(),
                delta: "lots".to_string(),
                done,
            })
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(CacheError::Syntax(_))));
    }

    #[tokio::test]
    async fn test_single_read_slot_still_serves_all_reads() {
        let executor = Executor::start(buckets(), 4, 1);

        executor
            .submit(Job::Set {
                key: "k".to_string(),
                value: Value::U8(1),
            })
            .await
            .unwrap();

        let mut pending = Vec::new();
        for _ in 0..50 {
            let (done, rx) = oneshot::channel();
            executor
                .submit(Job::Get {
                    key: "k".to_string(),
                    done,
                })
                .await
                .unwrap();
            pending.push(rx);
        }
        for rx in pending {
            assert_eq!(rx.await.unwrap(), Some(Value::U8(1)));
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let buckets = buckets();
        let executor = Executor::start(buckets.clone(), 256, 2);

        for i in 0..200 {
            executor
                .submit(Job::Set {
                    key: format!("key{}", i),
                    value: Value::from(i as i64),
                })
                .await
                .unwrap();
        }
        executor.shutdown().await.unwrap();

        assert_eq!(buckets.len(), 200);
        assert!(executor.is_stopped());
        assert!(matches!(
            executor
                .submit(Job::Del {
                    key: "key0".to_string()
                })
                .await,
            Err(CacheError::ExecutorStopped)
        ));
        assert!(matches!(
            executor.shutdown().await,
            Err(CacheError::ExecutorStopped)
        ));
    }
}
