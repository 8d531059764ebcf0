use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use redis::{Connection, RedisResult, Script};

use super::CacheBackend;
use crate::Result;

const TRY_ACQUIRE_OR_EXTEND: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
elseif current == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

const RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const SCAN_COUNT: usize = 100;

/// [`CacheBackend`] backed by Redis, shared by every SDK instance pointed at the same server.
///
/// Locks are implemented with Lua scripts so that check-and-set is atomic on the server.
pub struct RedisBackend {
    client: redis::Client,
    connection: Mutex<Option<Connection>>,
    timeout: Duration,
    try_acquire: Script,
    release: Script,
}

impl RedisBackend {
    /// Default connect, read and write timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Create a backend for the server at `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// The connection is established lazily and re-established after an error.
    pub fn open(url: &str) -> Result<RedisBackend> {
        Ok(RedisBackend {
            client: redis::Client::open(url)?,
            connection: Mutex::new(None),
            timeout: RedisBackend::DEFAULT_TIMEOUT,
            try_acquire: Script::new(TRY_ACQUIRE_OR_EXTEND),
            release: Script::new(RELEASE),
        })
    }

    /// Override connect, read and write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> RedisBackend {
        self.timeout = timeout;
        self
    }

    fn connect(&self) -> RedisResult<Connection> {
        let connection = self.client.get_connection_with_timeout(self.timeout)?;
        connection.set_read_timeout(Some(self.timeout))?;
        connection.set_write_timeout(Some(self.timeout))?;
        Ok(connection)
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T> {
        let mut slot = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => self.connect()?,
        };
        let result = f(&mut connection)?;
        // Only a connection that just worked goes back to the slot.
        *slot = Some(connection);
        Ok(result)
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so that `prefix` is matched literally by `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

impl CacheBackend for RedisBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query(conn)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| redis::cmd("DEL").arg(key).query(conn))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = glob_escape(prefix);
        self.with_connection(|conn| {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(conn)?;
                keys.extend(batch);
                if next == 0 {
                    return Ok(keys);
                }
                cursor = next;
            }
        })
    }

    fn try_acquire_or_extend_lock(&self, lock: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.with_connection(|conn| {
            let acquired: i64 = self
                .try_acquire
                .key(lock)
                .arg(holder)
                .arg(millis(ttl))
                .invoke(conn)?;
            Ok(acquired == 1)
        })
    }

    fn release_lock(&self, lock: &str, holder: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let released: i64 = self.release.key(lock).arg(holder).invoke(conn)?;
            Ok(released == 1)
        })
    }
}
