//! Redis implementation of QueueStore
//!
//! Production store using Redis with:
//! - `BRPOP` across queue lists for the blocking pop
//! - `LPUSH` for tail append (lists are consumed from the right)
//! - A Lua script for the atomic due-pop from a schedule set
//! - `ZADD` for scoring

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::{Client, RedisError, Script};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::store::*;

/// Finds the lowest-scored due member and removes it in the same script run,
/// so concurrent fetchers can never both receive it.
const POP_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if due[1] then
  redis.call('ZREM', KEYS[1], due[1])
  return due[1]
end
return false
"#;

/// Redis implementation of QueueStore
///
/// Short commands share one auto-reconnecting [`ConnectionManager`]. A
/// `BRPOP` holds its connection for up to the timeout, so blocking pops check
/// out a dedicated connection from a small idle list and return it after the
/// call. The list grows to the number of concurrent pops; a connection is
/// discarded only when its command fails at the connection level.
///
/// # Example
///
/// ```ignore
/// use corral_fetch::RedisQueueStore;
///
/// let store = RedisQueueStore::connect("redis://localhost:6379").await?;
/// ```
#[derive(Clone)]
pub struct RedisQueueStore {
    client: Client,
    manager: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    pop_due: Script,
}

impl RedisQueueStore {
    /// Connect to Redis at the given URL
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = Client::open(redis_url.as_ref()).map_err(connection_error)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(connection_error)?;

        Ok(Self {
            client,
            manager,
            blocking: Arc::new(Mutex::new(Vec::new())),
            pop_due: Script::new(POP_DUE_SCRIPT),
        })
    }

    /// Blocking-pop connections currently parked for reuse
    pub fn idle_blocking_connections(&self) -> usize {
        self.blocking.lock().len()
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let parked = self.blocking.lock().pop();
        match parked {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(connection_error),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().push(conn);
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self), level = "trace")]
    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let mut conn = self.checkout_blocking().await?;

        let popped: Result<Option<(String, String)>, RedisError> = ::redis::cmd("BRPOP")
            .arg(keys)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await;

        match popped {
            Ok(popped) => {
                self.checkin_blocking(conn);
                Ok(popped)
            }
            Err(e) => {
                if !is_connection_failure(&e) {
                    self.checkin_blocking(conn);
                }
                Err(command_error(e))
            }
        }
    }

    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn push(&self, key: &str, messages: &[String]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut conn = self.manager.clone();
        let _: i64 = ::redis::cmd("LPUSH")
            .arg(key)
            .arg(messages)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn pop_due_below(&self, key: &str, ceiling: f64) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let due: Option<String> = self
            .pop_due
            .key(key)
            .arg(ceiling)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(due)
    }

    #[instrument(skip(self, message))]
    async fn add_scored(&self, key: &str, score: f64, message: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = ::redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(())
    }
}

fn connection_error(e: RedisError) -> StoreError {
    debug!("Redis connection failed: {}", e);
    StoreError::Connection(e.to_string())
}

fn is_connection_failure(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
}

fn command_error(e: RedisError) -> StoreError {
    if is_connection_failure(&e) {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}
