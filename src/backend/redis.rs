//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于Redis的共享键值存储实现。

use super::kv::{AdmissionArgs, AdmissionKeys, KvStore, ReadCursor, StreamRecord};
use super::redis_provider::{DefaultRedisProvider, RedisProvider};
use crate::config::RedisConfig;
use crate::error::Result;
use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// 比较并删除：只有持有者本人才能释放锁
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// 秒杀准入脚本
///
/// KEYS: stock, sale, buyers, stream
/// ARGV: userId, itemId, orderId, nowMillis, issuedAt
const ADMISSION_SCRIPT: &str = r#"
local window = redis.call('HMGET', KEYS[2], 'begin', 'end')
local now = tonumber(ARGV[4])
if window[1] and now < tonumber(window[1]) then
    return -1
end
if window[2] and now > tonumber(window[2]) then
    return -2
end
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 1
end
local stock = tonumber(raw)
if not stock then
    return redis.error_reply('stock value at ' .. KEYS[1] .. ' is not a number')
end
if stock <= 0 then
    return 1
end
if redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then
    return 2
end
redis.call('INCRBY', KEYS[1], -1)
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('XADD', KEYS[4], '*', 'orderId', ARGV[3], 'userId', ARGV[1], 'itemId', ARGV[2], 'issuedAt', ARGV[5])
return 0
"#;

/// Redis键值存储
///
/// 普通命令共用一个多路复用连接；阻塞的队列读取使用独立连接，
/// 避免 `XREADGROUP BLOCK` 阻塞同一连接上的其他命令。
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    blocking_manager: ConnectionManager,
    compare_and_delete: Arc<redis::Script>,
    admission: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisStore")
    }
}

fn px(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl RedisStore {
    /// 按配置连接Redis
    #[instrument(skip(config), level = "info", name = "init_redis_store", fields(mode = ?config.mode))]
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        Self::new_with_provider(config, Arc::new(DefaultRedisProvider)).await
    }

    /// 使用指定的连接提供者创建存储
    pub async fn new_with_provider(
        config: &RedisConfig,
        provider: Arc<dyn RedisProvider>,
    ) -> Result<Self> {
        let (client, manager) = provider.connect(config).await?;
        let blocking_manager = client.get_connection_manager().await?;
        debug!("Redis store connected");
        Ok(Self {
            client,
            manager,
            blocking_manager,
            compare_and_delete: Arc::new(redis::Script::new(COMPARE_AND_DELETE_SCRIPT)),
            admission: Arc::new(redis::Script::new(ADMISSION_SCRIPT)),
        })
    }

    /// 获取原始Redis客户端
    pub fn raw_client(&self) -> &Client {
        &self.client
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    #[instrument(skip(self, keys), level = "debug", fields(key_count = keys.len()))]
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn())
            .await?;
        Ok(values)
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(px(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(px(ttl))
            .query_async(&mut self.conn())
            .await?;
        debug!("SET NX PX result: success={}", result.is_some());
        Ok(result.is_some())
    }

    #[instrument(skip(self), level = "debug")]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed == 1)
    }

    #[instrument(skip(self), level = "debug")]
    async fn incr(&self, key: &str) -> Result<i64> {
        Ok(self.conn().incr(key, 1).await?)
    }

    #[instrument(skip(self, fields), level = "debug")]
    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let _: () = self.conn().hset_multiple(key, fields).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.conn().sadd(key, member).await?;
        Ok(added > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: i64 = self.conn().zadd(key, member, score).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.conn().zscore(key, member).await?)
    }

    #[instrument(skip(self, keys), level = "debug", fields(item = args.item_id, user = args.user_id))]
    async fn eval_admission(&self, keys: &AdmissionKeys, args: &AdmissionArgs) -> Result<i64> {
        let code: i64 = self
            .admission
            .key(&keys.stock)
            .key(&keys.sale)
            .key(&keys.buyers)
            .key(&keys.stream)
            .arg(args.user_id)
            .arg(args.item_id)
            .arg(args.order_id)
            .arg(args.now_millis)
            .arg(&args.issued_at)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(code)
    }

    #[instrument(skip(self, fields), level = "debug")]
    async fn stream_add(&self, stream: &str, fields: &[(&str, String)]) -> Result<String> {
        Ok(self.conn().xadd(stream, "*", fields).await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<()> {
        let created: redis::RedisResult<()> =
            self.conn().xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {} already exists on {}", group, stream);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>> {
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let (id, mut conn) = match cursor {
            ReadCursor::New => {
                if let Some(block) = block {
                    options = options.block(block.as_millis() as usize);
                }
                (">", self.blocking_manager.clone())
            }
            ReadCursor::Pending => ("0", self.conn()),
        };

        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[id], &options).await?;

        let mut records = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let mut fields = HashMap::with_capacity(entry.map.len());
                for (field, value) in entry.map {
                    let value: String = redis::from_redis_value(&value)?;
                    fields.insert(field, value);
                }
                records.push(StreamRecord {
                    id: entry.id,
                    fields,
                });
            }
        }
        Ok(records)
    }

    #[instrument(skip(self), level = "debug")]
    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<u64> {
        Ok(self.conn().xack(stream, group, &[id]).await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ping(&self) -> Result<()> {
        let response: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        debug!("Redis ping response: {}", response);
        Ok(())
    }
}
