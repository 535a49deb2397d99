//! [`KvStore`] implementation on top of a Redis server.

use std::fmt;

use redis::aio::ConnectionManager;

use super::{KvStore, StoreResult};
use crate::config::CacheConfig;

/// A [`KvStore`] on top of a Redis server.
///
/// Each entry is a Redis hash. The connection manager multiplexes all calls over one connection
/// and reconnects transparently after failures.
#[derive(Clone)]
pub struct RedisStore {
    url: String,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connects to the server described by `config`.
    pub async fn connect(config: &CacheConfig) -> StoreResult<Self> {
        let url = config.url();
        let client = redis::Client::open(url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        tracing::debug!(%url, "connected to lifecycle cache");
        Ok(Self { url, connection })
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[tracing::instrument(level = "trace", fields(key = %key), skip_all)]
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }

        let mut connection = self.connection.clone();
        cmd.query_async::<()>(&mut connection).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn random_key(&self) -> StoreResult<Option<String>> {
        let mut connection = self.connection.clone();
        let key = redis::cmd("RANDOMKEY")
            .query_async::<Option<String>>(&mut connection)
            .await?;
        Ok(key)
    }

    #[tracing::instrument(level = "trace", fields(key = %key), skip_all)]
    async fn get_fields(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }

        let mut connection = self.connection.clone();
        let values = cmd.query_async::<Vec<Option<String>>>(&mut connection).await?;
        Ok(values)
    }

    #[tracing::instrument(level = "trace", fields(key = %key), skip_all)]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut connection = self.connection.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", fields(key = %key), skip_all)]
    async fn counter(&self, key: &str) -> StoreResult<u64> {
        let mut connection = self.connection.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<u64>>(&mut connection)
            .await?;
        Ok(value.unwrap_or(0))
    }

    #[tracing::instrument(level = "trace", fields(key = %key, delta = delta), skip_all)]
    async fn incr_by(&self, key: &str, delta: u64) -> StoreResult<u64> {
        let mut connection = self.connection.clone();
        let value = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async::<u64>(&mut connection)
            .await?;
        Ok(value)
    }
}
