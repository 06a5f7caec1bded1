//! Redis lock backend shared by every worker

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;

use sc_core::error::LockError;
use sc_core::traits::LockBackend;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Lock backend storing leases as expiring Redis keys
#[derive(Clone)]
pub struct RedisLockBackend {
    conn: MultiplexedConnection,
}

impl RedisLockBackend {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_error)?;
        Ok(Self { conn })
    }

    /// Use an existing connection
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_millis(lease))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(reply.is_some())
    }

    async fn extend(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}

/// PX rejects 0, so round sub-millisecond leases up
fn lease_millis(lease: Duration) -> u64 {
    (lease.as_millis() as u64).max(1)
}

fn backend_error(err: redis::RedisError) -> LockError {
    LockError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_millis_never_zero() {
        assert_eq!(lease_millis(Duration::from_micros(10)), 1);
        assert_eq!(lease_millis(Duration::from_secs(10)), 10_000);
    }
}
