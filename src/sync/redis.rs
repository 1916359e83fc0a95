//! Redis implementation of [`SyncBackend`]
//!
//! Commands go through a multiplexed [`ConnectionManager`]. Blocking stream
//! reads get a connection of their own so they never stall other commands.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use tracing::info;

use super::backend::{StreamMessage, SyncBackend};
use crate::error::Result;

/// Name of the single field carrying an event in each stream message
const EVENT_FIELD: &str = "event";

const DEL_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisSyncBackend {
    commands: ConnectionManager,
    reader: ConnectionManager,
    del_if_equals: Script,
}

impl RedisSyncBackend {
    /// Connect to `url`, e.g. `redis://127.0.0.1:6379/0`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        let reader = ConnectionManager::new(client).await?;
        info!("Connected sync backend to {}", url);
        Ok(Self {
            commands,
            reader,
            del_if_equals: Script::new(DEL_IF_EQUALS),
        })
    }
}

#[async_trait]
impl SyncBackend for RedisSyncBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.commands.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.commands.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.commands.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.commands.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.commands.clone();
        let removed: i64 = self
            .del_if_equals
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.commands.clone();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.commands.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.commands.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut conn = self.commands.clone();
        Ok(conn.scard(key).await?)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.commands.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn xadd(&self, stream: &str, payload: &str, max_len: Option<usize>) -> Result<String> {
        let mut conn = self.commands.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        let id: String = cmd
            .arg("*")
            .arg(EVENT_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.reader.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| StreamMessage {
                payload: entry.get::<String>(EVENT_FIELD).unwrap_or_default(),
                id: entry.id,
            })
            .collect())
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.commands.clone();
        let acked: usize = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }
}
