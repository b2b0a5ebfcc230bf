//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了全局唯一、按时间递增的订单号生成器。

use crate::backend::KvStore;
use crate::error::Result;
use crate::recovery::RetryPolicy;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// 起始时间戳：2022-01-01T00:00:00Z
pub const BEGIN_TIMESTAMP: i64 = 1_640_995_200;

/// 序列号位数
pub const COUNT_BITS: u32 = 32;

/// ID生成器接口
#[async_trait]
pub trait IdGenerator: Send + Sync {
    /// 为指定业务前缀生成下一个ID
    async fn next_id(&self, prefix: &str) -> Result<i64>;
}

/// 基于共享计数器的ID生成器
///
/// ID = (距起始时间的秒数 << 32) | 当日序列号，
/// 序列号来自按天划分的计数键。
#[derive(Clone)]
pub struct IdWorker {
    store: Arc<dyn KvStore>,
    namespace: String,
    retry: RetryPolicy,
}

impl IdWorker {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 计数键，例如 `flashguard:icr:order:2025:03:01`
    pub fn counter_key(&self, prefix: &str, date: &str) -> String {
        format!("{}:icr:{}:{}", self.namespace, prefix, date)
    }
}

/// 拼接时间戳与序列号
pub fn compose_id(timestamp: i64, sequence: i64) -> i64 {
    (timestamp << COUNT_BITS) | (sequence & 0xFFFF_FFFF)
}

#[async_trait]
impl IdGenerator for IdWorker {
    async fn next_id(&self, prefix: &str) -> Result<i64> {
        let now = Utc::now();
        let timestamp = now.timestamp() - BEGIN_TIMESTAMP;
        let key = self.counter_key(prefix, &now.format("%Y:%m:%d").to_string());
        let store = self.store.clone();
        let sequence = self.retry.run("id counter incr", || store.incr(&key)).await?;
        Ok(compose_id(timestamp, sequence))
    }
}
