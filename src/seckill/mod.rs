//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了秒杀下单链路：原子准入、订单入队与异步落库。

pub mod admission;
pub mod consumer;
pub mod id_worker;
pub mod ticket;

pub use admission::{AdmissionExecutor, AdmissionOutcome, RejectReason};
pub use consumer::OrderConsumer;
pub use id_worker::{IdGenerator, IdWorker};
pub use ticket::OrderTicket;

use crate::backend::{AdmissionKeys, KvStore};
use crate::config::Config;
use crate::database::{OrderApplier, OrderRepository};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

/// 秒杀相关的键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeckillKeys {
    namespace: String,
    stream: String,
}

impl SeckillKeys {
    pub fn new(namespace: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            stream: stream.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.global.key_namespace, &config.seckill.stream)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 订单队列名
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// 库存计数键
    pub fn stock(&self, item_id: i64) -> String {
        format!("{}:seckill:stock:{}", self.namespace, item_id)
    }

    /// 秒杀时间窗口键
    pub fn sale(&self, item_id: i64) -> String {
        format!("{}:seckill:sale:{}", self.namespace, item_id)
    }

    /// 已下单用户集合键
    pub fn buyers(&self, item_id: i64) -> String {
        format!("{}:seckill:order:{}", self.namespace, item_id)
    }

    /// 用户下单锁键
    pub fn order_lock(&self, user_id: i64) -> String {
        format!("{}:lock:order:{}", self.namespace, user_id)
    }

    pub fn admission(&self, item_id: i64) -> AdmissionKeys {
        AdmissionKeys {
            stock: self.stock(item_id),
            sale: self.sale(item_id),
            buyers: self.buyers(item_id),
            stream: self.stream.clone(),
        }
    }
}

/// 秒杀活动
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    pub item_id: i64,
    pub stock: i32,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// 秒杀服务
///
/// 组合准入执行器与订单仓储，提供发布活动和下单入口。
#[derive(Clone)]
pub struct SeckillService {
    store: Arc<dyn KvStore>,
    repository: OrderRepository,
    keys: SeckillKeys,
    admission: AdmissionExecutor,
}

impl SeckillService {
    pub fn new(
        store: Arc<dyn KvStore>,
        repository: OrderRepository,
        ids: Arc<dyn IdGenerator>,
        config: &Config,
    ) -> Self {
        let keys = SeckillKeys::from_config(config);
        let admission =
            AdmissionExecutor::new(store.clone(), ids, keys.clone(), &config.seckill.id_prefix);
        Self {
            store,
            repository,
            keys,
            admission,
        }
    }

    pub fn keys(&self) -> &SeckillKeys {
        &self.keys
    }

    pub fn repository(&self) -> &OrderRepository {
        &self.repository
    }

    /// 发布秒杀活动
    ///
    /// 先写数据库再写库存计数与时间窗口。
    #[instrument(skip(self), level = "info", fields(item = sale.item_id))]
    pub async fn publish_sale(&self, sale: &Sale) -> Result<()> {
        if sale.stock < 0 {
            return Err(CacheError::ConfigError(format!(
                "stock for item {} cannot be negative",
                sale.item_id
            )));
        }
        if sale.end < sale.begin {
            return Err(CacheError::ConfigError(format!(
                "sale window for item {} ends before it begins",
                sale.item_id
            )));
        }

        let begin = sale.begin.timestamp_millis();
        let end = sale.end.timestamp_millis();
        self.repository
            .upsert_voucher(sale.item_id, sale.stock, begin, end)
            .await?;
        self.store
            .set(&self.keys.stock(sale.item_id), &sale.stock.to_string())
            .await?;
        self.store
            .hset_multiple(
                &self.keys.sale(sale.item_id),
                &[("begin", begin.to_string()), ("end", end.to_string())],
            )
            .await?;
        info!(
            "Published sale for item {} with stock {} ({} - {})",
            sale.item_id, sale.stock, sale.begin, sale.end
        );
        Ok(())
    }

    /// 秒杀下单
    pub async fn admit(&self, item_id: i64, user_id: i64) -> Result<AdmissionOutcome> {
        self.admission.admit(item_id, user_id).await
    }

    /// 用户是否已有该商品的订单（数据库）
    pub async fn has_order(&self, user_id: i64, item_id: i64) -> Result<bool> {
        self.repository.has_order(user_id, item_id).await
    }
}
