use super::CacheStore;
use crate::core::Result;
use ::redis::{AsyncCommands, AsyncIter};
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Redis-backed cache store
///
/// Uses a [`ConnectionManager`], which multiplexes commands over one connection and
/// reconnects on failure, so a single handle can be shared by every cache in the process.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    url: String,
}

impl RedisStore {
    /// Connect to `redis://{host}:{port}/{db}`
    pub async fn connect(host: &str, port: u16, db: i64) -> Result<Self> {
        let url = format!("redis://{}:{}/{}", host, port, db);
        Self::connect_url(&url).await
    }

    /// Connect using a full redis URL
    pub async fn connect_url(url: &str) -> Result<Self> {
        info!("Connecting to redis at {}", url);
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Build a `SCAN MATCH` pattern matching every key that starts with `prefix`
pub(crate) fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        debug!("GET key={} found={}", key, value.is_some());
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        debug!("SET key={}, size={}, ttl={:?}", key, value.len(), ttl_secs);
        match ttl_secs {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value.as_ref(), secs).await?,
            None => conn.set::<_, _, ()>(key, value.as_ref()).await?,
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let mut conn = self.conn.clone();
        let mut iter: AsyncIter<'_, String> = conn.scan_match(prefix_pattern(prefix)).await?;
        let mut keys = BTreeSet::new();
        while let Some(key) = iter.next_item().await {
            keys.insert(key);
        }
        debug!("SCAN prefix={} found={}", prefix, keys.len());
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: usize = conn.del(keys.to_vec()).await?;
        debug!("DEL count={} deleted={}", keys.len(), deleted);
        Ok(deleted)
    }

    async fn close(&self) -> Result<()> {
        // The connection manager closes its socket once the last clone is dropped
        info!("Releasing redis connection to {}", self.url);
        Ok(())
    }
}
