use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info, instrument};
use warden_core::{AtomicStore, GuardedMutation, StoreError, TtlStatus};

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Resets the ttl of KEYS[1] to ARGV[2] milliseconds only while it still holds ARGV[1].
const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed store.
///
/// Conditional writes use `SET NX PX`; the guarded mutations run as Lua scripts
/// so the compare and the write happen in one server-side step. Commands go
/// through a multiplexed [`ConnectionManager`], which reconnects on its own.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    compare_and_delete: Script,
    compare_and_pexpire: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::InvalidArgument(format!("Invalid Redis URL: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        info!("Connected to Redis store");
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_pexpire: Script::new(COMPARE_AND_PEXPIRE),
        }
    }
}

/// Largest expiry Redis accepts for `PX`/`PEXPIRE` (a signed 64-bit count).
const MAX_TTL_MILLIS: u64 = i64::MAX as u64;

/// Milliseconds for `PX`/`PEXPIRE`; Redis rejects a zero expiry.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_TTL_MILLIS)
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    fn store_type(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        debug!("SET NX {} -> {}", key, reply.is_some());
        Ok(reply.is_some())
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_mutate(
        &self,
        key: &str,
        expected: &str,
        mutation: GuardedMutation,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let affected: i64 = match mutation {
            GuardedMutation::Delete => {
                self.compare_and_delete
                    .key(key)
                    .arg(expected)
                    .invoke_async(&mut conn)
                    .await
            }
            GuardedMutation::Expire(ttl) => {
                self.compare_and_pexpire
                    .key(key)
                    .arg(expected)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn)
                    .await
            }
        }
        .map_err(map_redis_error)?;

        debug!("Guarded {} on {} -> {}", mutation.name(), key, affected);
        Ok(affected == 1)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ttl(&self, key: &str) -> Result<TtlStatus, StoreError> {
        let mut conn = self.connection.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(TtlStatus::from_millis(millis))
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(count > 0)
    }
}
