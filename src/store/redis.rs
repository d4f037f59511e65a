use crate::store::{Snapshot, Store, MAX_WINDOW};
use actix_web::http::StatusCode;
use actix_web::rt::time::Instant;
use actix_web::ResponseError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

const BITFIELD_ENCODING: &str = "u63";
const BITFIELD_OFFSET: u8 = 0;
const SCAN_BATCH: usize = 500;

// Every record kind lives in its own namespace, so no identifier can name another's record
const COUNTER_NAMESPACE: &str = "count:";
const LOG_NAMESPACE: &str = "log:";
const SEQUENCE_NAMESPACE: &str = "seq:";

// KEYS[1] counter; ARGV[1] max; ARGV[2] window (ms)
static INCREMENT_BELOW: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local count = redis.call('BITFIELD', KEYS[1], 'GET', 'u63', 0)[1]
local admitted = 0
if count < tonumber(ARGV[1]) then
    count = redis.call('BITFIELD', KEYS[1], 'OVERFLOW', 'SAT', 'INCRBY', 'u63', 0, 1)[1]
    redis.call('PEXPIRE', KEYS[1], ARGV[2], 'NX')
    admitted = 1
end
return {admitted, count, redis.call('PTTL', KEYS[1])}
",
    )
});

// Timestamps are taken from the server clock, so that processes with skewed clocks agree.

// KEYS[1] sorted set of timestamps, KEYS[2] member sequence;
// ARGV[1] window (ms), ARGV[2] max
static APPEND_WITHIN: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local window = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local admitted = 0
if count < tonumber(ARGV[2]) then
    local seq = redis.call('INCR', KEYS[2])
    redis.call('ZADD', KEYS[1], now, now .. '-' .. seq)
    redis.call('PEXPIRE', KEYS[1], window)
    redis.call('PEXPIRE', KEYS[2], window)
    count = count + 1
    admitted = 1
end
local reset = 0
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
    reset = tonumber(oldest[2]) + window - now
end
return {admitted, count, reset}
",
    )
});

// KEYS[1] sorted set of timestamps; ARGV[1] window (ms)
static COUNT_WITHIN: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local window = tonumber(ARGV[1])
local cutoff = '(' .. (now - window)
local count = redis.call('ZCOUNT', KEYS[1], cutoff, '+inf')
local reset = 0
local oldest = redis.call('ZRANGEBYSCORE', KEYS[1], cutoff, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
if oldest[2] then
    reset = tonumber(oldest[2]) + window - now
end
return {count, reset}
",
    )
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[error("Unexpected negative TTL response for the rate limit key")]
    NegativeTtl,
    #[error("The redis store has been closed")]
    Closed,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Redis(_) | Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
            Error::NegativeTtl => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A [Store] that keeps usage records in Redis.
///
/// Counters use Redis' atomic increment and native key expiry, so every identifier has its own
/// window and several processes may safely share the same records.
#[derive(Clone)]
pub struct RedisStore {
    // Taken on close, dropping this store's handle on the connection
    connection: Arc<Mutex<Option<ConnectionManager>>>,
    key_prefix: Option<String>,
}

impl RedisStore {
    /// Create a RedisStoreBuilder.
    ///
    /// # Arguments
    ///
    /// * `connection`: A Redis connection manager
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_admission_control::store::redis::RedisStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisStore::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    fn make_key(&self, namespace: &str, key: &str) -> String {
        let prefix = self.key_prefix.as_deref().unwrap_or_default();
        format!("{prefix}{namespace}{key}")
    }

    fn counter_key(&self, key: &str) -> String {
        self.make_key(COUNTER_NAMESPACE, key)
    }

    fn log_key(&self, key: &str) -> String {
        self.make_key(LOG_NAMESPACE, key)
    }

    fn sequence_key(&self, key: &str) -> String {
        self.make_key(SEQUENCE_NAMESPACE, key)
    }

    fn connection(&self) -> Result<ConnectionManager, Error> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::Closed)
    }
}

fn reset_after(ttl_ms: i64) -> Instant {
    Instant::now() + Duration::from_millis(ttl_ms.max(0) as u64)
}

fn window_ms(window: Duration) -> u64 {
    (window.min(MAX_WINDOW).as_millis() as u64).max(1)
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    ///
    /// Records are stored under `{prefix}count:{key}`, `{prefix}log:{key}` and `{prefix}seq:{key}`.
    ///
    /// Without a prefix [Store::reset_all] deletes every key in the database.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisStore {
        RedisStore {
            connection: Arc::new(Mutex::new(Some(self.connection))),
            key_prefix: self.key_prefix,
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    type Error = Error;

    async fn increment(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
    ) -> Result<Snapshot, Self::Error> {
        let key = self.counter_key(key);
        let mut con = self.connection()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Increment the rate limit count
            .cmd("BITFIELD")
            .arg(&key)
            .arg("OVERFLOW")
            .arg("SAT")
            .arg("INCRBY")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(amount)
            // Set the key to expire (only if it doesn't already have an expiry)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms(window))
            .arg("NX")
            .ignore()
            // Return time-to-live of key
            .cmd("PTTL")
            .arg(&key);

        let (counts, ttl): (Vec<u64>, i64) = pipe.query_async(&mut con).await?;
        if ttl < 0 {
            return Err(Error::NegativeTtl);
        }
        let count = counts.first().copied().unwrap_or_default();
        Ok(Snapshot {
            count,
            reset: reset_after(ttl),
        })
    }

    async fn increment_below(
        &self,
        key: &str,
        max: u64,
        window: Duration,
    ) -> Result<(bool, Snapshot), Self::Error> {
        let key = self.counter_key(key);
        let mut con = self.connection()?;
        let (admitted, count, ttl): (u8, u64, i64) = INCREMENT_BELOW
            .key(&key)
            .arg(max)
            .arg(window_ms(window))
            .invoke_async(&mut con)
            .await?;
        Ok((
            admitted == 1,
            Snapshot {
                count,
                reset: reset_after(ttl),
            },
        ))
    }

    async fn get(&self, key: &str) -> Result<Snapshot, Self::Error> {
        let key = self.counter_key(key);
        let mut con = self.connection()?;

        let mut pipe = redis::pipe();
        pipe.cmd("BITFIELD")
            .arg(&key)
            .arg("GET")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .cmd("PTTL")
            .arg(&key);

        // An absent key reads as zero with a TTL of -2
        let (counts, ttl): (Vec<u64>, i64) = pipe.query_async(&mut con).await?;
        Ok(Snapshot {
            count: counts.first().copied().unwrap_or_default(),
            reset: reset_after(ttl),
        })
    }

    async fn decrement(&self, key: &str) -> Result<(), Self::Error> {
        let key = self.counter_key(key);
        let mut con = self.connection()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Decrement the rate limit count
            .cmd("BITFIELD")
            .arg(&key)
            .arg("OVERFLOW")
            .arg("SAT")
            .arg("INCRBY")
            .arg(BITFIELD_ENCODING)
            .arg(BITFIELD_OFFSET)
            .arg(-1)
            .ignore()
            // Set the key to expire immediately, if it doesn't already have an expiry
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(0)
            .arg("NX")
            .ignore();

        let () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn append_within(
        &self,
        key: &str,
        max: u64,
        window: Duration,
    ) -> Result<(bool, Snapshot), Self::Error> {
        let log_key = self.log_key(key);
        let sequence_key = self.sequence_key(key);
        let mut con = self.connection()?;
        let (admitted, count, reset): (u8, u64, i64) = APPEND_WITHIN
            .key(&log_key)
            .key(&sequence_key)
            .arg(window_ms(window))
            .arg(max)
            .invoke_async(&mut con)
            .await?;
        Ok((
            admitted == 1,
            Snapshot {
                count,
                reset: reset_after(reset),
            },
        ))
    }

    async fn get_log(&self, key: &str, window: Duration) -> Result<Snapshot, Self::Error> {
        let log_key = self.log_key(key);
        let mut con = self.connection()?;
        // Only timestamps newer than the start of the window are counted
        let (count, reset): (u64, i64) = COUNT_WITHIN
            .key(&log_key)
            .arg(window_ms(window))
            .invoke_async(&mut con)
            .await?;
        Ok(Snapshot {
            count,
            reset: reset_after(reset),
        })
    }

    /// Note that the key prefix (if set) is automatically included, you do not need to prepend
    /// it yourself.
    async fn reset_key(&self, key: &str) -> Result<(), Self::Error> {
        let keys = vec![
            self.counter_key(key),
            self.log_key(key),
            self.sequence_key(key),
        ];
        let mut con = self.connection()?;
        let () = con.del(keys).await?;
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), Self::Error> {
        let pattern = format!("{}*", self.key_prefix.as_deref().unwrap_or_default());
        let mut con = self.connection()?;
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut con)
                .await?;
            if !keys.is_empty() {
                let () = con.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    /// Drops the connection manager shared by every clone of this store.
    ///
    /// Operations already in flight keep their own handle, the connection closes once they
    /// complete (and once any [ConnectionManager] clones held outside this store are dropped).
    async fn close(&self) -> Result<(), Self::Error> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if connection.is_some() {
            log::debug!("Redis rate limit store closed");
        }
        Ok(())
    }
}
