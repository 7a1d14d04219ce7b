//! Command Handler
//!
//! Turns decoded [`Request`]s into [`Cache`] calls and the results into
//! [`Reply`]s. Every failure becomes a reply status; nothing here ends a
//! connection.
//!
//! ## Operations
//!
//! | op       | fields              | reply                         |
//! |----------|---------------------|-------------------------------|
//! | `set`    | key, val, [kind]    | ok                            |
//! | `setex`  | key, val, exp, [kind] | ok                          |
//! | `setnx`  | key, val, [kind]    | ok / exists                   |
//! | `get`    | key                 | value + kind / nil            |
//! | `del`    | key                 | ok                            |
//! | `unlink` | key                 | ok                            |
//! | `incr`   | key                 | new value                     |
//! | `incrby` | key, val (delta)    | new value                     |
//! | `ttl`    | key                 | ttl_ms (-1 = never) / nil     |
//! | `keys`   | key (regex)         | keys + count                  |
//! | `cnt`    |                     | count                         |
//! | `save`   |                     | count                         |
//! | `load`   |                     | count                         |
//! | `cls`    |                     | ok                            |
//! | `ping`   | [key]               | `PONG` or the key             |
//!
//! Snapshots always go to the server's configured path; clients can't
//! choose where files are written.

use crate::cache::Cache;
use crate::error::CacheError;
use crate::protocol::{OpCode, Reply, Request, Status};
use crate::storage::{Value, ValueKind};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Executes requests against a shared [`Cache`].
#[derive(Debug, Clone)]
pub struct CommandHandler {
    cache: Cache,
    /// Base path for `save` / `load`; `None` disables them
    snapshot_path: Option<PathBuf>,
}

impl CommandHandler {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            snapshot_path: None,
        }
    }

    pub fn with_snapshot_path(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_path = path;
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Executes a request and returns the reply.
    pub async fn execute(&self, request: Request) -> Reply {
        let op = request.op;
        match self.dispatch(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(op = ?op, error = %e, "Request failed");
                Reply::error(&e)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Reply, CacheError> {
        let cache = &self.cache;

        match request.op {
            OpCode::Ping => Ok(if request.key.is_empty() {
                Reply::text("PONG")
            } else {
                Reply::text(request.key)
            }),

            OpCode::Set => {
                let value = parse_value(&request)?;
                cache.set(request.key, value).await?;
                Ok(Reply::ok())
            }

            OpCode::Setex => {
                let value = parse_value(&request)?;
                let ttl = parse_exp(request.exp.as_deref())?;
                cache.setex(request.key, value, ttl).await?;
                Ok(Reply::ok())
            }

            OpCode::Setnx => {
                let value = parse_value(&request)?;
                let key = request.key;
                if cache.setnx(key.as_str(), value).await? {
                    Ok(Reply::ok())
                } else {
                    Err(CacheError::AlreadyExists(key))
                }
            }

            OpCode::Get => Ok(match cache.get(request.key).await? {
                Some(value) => Reply::value(&value),
                None => Reply::nil(),
            }),

            OpCode::Del => {
                cache.del(request.key).await?;
                Ok(Reply::ok())
            }

            OpCode::Unlink => {
                cache.unlink(request.key).await?;
                Ok(Reply::ok())
            }

            OpCode::Incr => Ok(Reply::value(&cache.incr(request.key).await?)),

            OpCode::Incrby => {
                let delta = required(request.val, "val")?;
                Ok(Reply::value(&cache.incrby(request.key, delta).await?))
            }

            OpCode::Ttl => Ok(match cache.ttl(request.key).await? {
                Some(ttl) => Reply::ttl(ttl),
                None => Reply::nil(),
            }),

            OpCode::Keys => Ok(Reply::keys(cache.keys(&request.key)?)),

            OpCode::Cnt => Ok(Reply::count(cache.count())),

            OpCode::Cls => {
                cache.clear();
                Ok(Reply::ok())
            }

            OpCode::Save => {
                let Some(path) = &self.snapshot_path else {
                    return Ok(snapshots_disabled());
                };
                let saved = cache.save(path).await.into_result().map_err(|e| {
                    warn!(error = %e, "Snapshot save failed");
                    e
                })?;
                Ok(Reply::count(saved))
            }

            OpCode::Load => {
                let Some(path) = &self.snapshot_path else {
                    return Ok(snapshots_disabled());
                };
                Ok(Reply::count(cache.load(path).await?))
            }
        }
    }
}

fn snapshots_disabled() -> Reply {
    Reply::failure(Status::Unavailable, "snapshots are not configured")
}

fn required(field: Option<String>, name: &str) -> Result<String, CacheError> {
    field.ok_or_else(|| CacheError::Syntax(format!("missing '{}'", name)))
}

/// Builds the value from `val`, typed by `kind` (default `str`).
fn parse_value(request: &Request) -> Result<Value, CacheError> {
    let text = request
        .val
        .as_deref()
        .ok_or_else(|| CacheError::Syntax("missing 'val'".to_string()))?;
    Value::parse(request.kind.unwrap_or(ValueKind::Str), text).map_err(CacheError::Syntax)
}

/// TTL in milliseconds, as sent in `exp`.
fn parse_exp(exp: Option<&str>) -> Result<Duration, CacheError> {
    let exp = exp.ok_or_else(|| CacheError::Syntax("missing 'exp'".to_string()))?;
    match exp.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(CacheError::Syntax(format!(
            "'{}' is not a valid expiration in milliseconds",
            exp
        ))),
    }
}
