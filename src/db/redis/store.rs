use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

use crate::db::store::{StateStore, StoreKey, Versioned};
use crate::error::{AppError, AppResult};

/// Compare-and-swap on a hash `{v: version, d: data}`.
/// ARGV: expected version ('' = absent), new version, data, ttl ms (0 = none)
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'v')
if (current == false and ARGV[1] == '') or current == ARGV[1] then
    redis.call('HSET', KEYS[1], 'v', ARGV[2], 'd', ARGV[3])
    if tonumber(ARGV[4]) > 0 then
        redis.call('PEXPIRE', KEYS[1], ARGV[4])
    else
        redis.call('PERSIST', KEYS[1])
    end
    return 1
end
return 0
"#;

/// Creates a Redis client for the state store
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Redis-backed `StateStore`.
///
/// Plain records are strings written with `PSETEX`; versioned records are
/// hashes updated atomically by a Lua script, which is what lets many
/// stateless request handlers share breaker and limiter state safely.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: Script,
}

impl RedisStore {
    /// Connects through a `ConnectionManager`, which reconnects on failure
    /// and is cheap to clone into every handler
    pub async fn new(client: Client) -> AppResult<Self> {
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis state store");
        Ok(Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
        })
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|ttl| (ttl.as_millis() as u64).max(1)).unwrap_or(0)
}

#[async_trait::async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &StoreKey) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key.to_string()).await?;
        Ok(value)
    }

    async fn put(&self, key: &StoreKey, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(_) => {
                let _: () = conn
                    .pset_ex(key.to_string(), value, ttl_millis(ttl))
                    .await?;
            }
            None => {
                let _: () = conn.set(key.to_string(), value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key.to_string()).await?;
        Ok(())
    }

    async fn get_versioned(&self, key: &StoreKey) -> AppResult<Option<Versioned>> {
        let mut conn = self.conn.clone();
        let (version, value): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(key.to_string())
            .arg("v")
            .arg("d")
            .query_async(&mut conn)
            .await?;

        match (version, value) {
            (Some(version), Some(value)) => {
                let version = version.parse::<u64>().map_err(|e| {
                    AppError::Internal(format!("Corrupt version for {}: {}", key, e))
                })?;
                Ok(Some(Versioned { value, version }))
            }
            _ => Ok(None),
        }
    }

    async fn put_if_version(
        &self,
        key: &StoreKey,
        value: &str,
        expected: Option<u64>,
        ttl: Option<Duration>,
    ) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let expected_arg = expected.map(|v| v.to_string()).unwrap_or_default();
        let next_version = expected.map_or(1, |v| v + 1);

        let written: i32 = self
            .cas
            .key(key.to_string())
            .arg(expected_arg)
            .arg(next_version)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        if written == 0 {
            tracing::debug!(key = %key, expected = ?expected, "Versioned write lost the race");
        }

        Ok(written == 1)
    }
}

// Integration tests against a live Redis; run with REDIS_URL set and `--ignored`
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> RedisStore {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let client = create_redis_client(&redis_url).unwrap();
        RedisStore::new(client).await.unwrap()
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::from_secs(2))), 2000);
        assert_eq!(ttl_millis(Some(Duration::from_micros(10))), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_get_missing_key() {
        let store = store().await;
        let key = StoreKey::Recommendation("nonexistent_key_12345".to_string());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_put_and_get() {
        let store = store().await;
        let key = StoreKey::Recommendation("test_put_and_get".to_string());

        store
            .put(&key, "payload", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some("payload".to_string()));

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_compare_and_swap() {
        let store = store().await;
        let key = StoreKey::Breaker("test_cas".to_string());
        store.delete(&key).await.unwrap();

        assert!(store.put_if_version(&key, "a", None, None).await.unwrap());
        assert!(!store.put_if_version(&key, "b", None, None).await.unwrap());
        assert!(store.put_if_version(&key, "c", Some(1), None).await.unwrap());

        let current = store.get_versioned(&key).await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.value, "c");

        store.delete(&key).await.unwrap();
    }
}
