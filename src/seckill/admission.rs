//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了秒杀准入：一次原子脚本完成时间窗口、库存与一人一单校验。

use super::id_worker::IdGenerator;
use super::ticket::OrderTicket;
use super::SeckillKeys;
use crate::backend::{AdmissionArgs, KvStore};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// 准入拒绝原因
///
/// 这些是业务结果而非错误，不应重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 秒杀尚未开始
    NotStarted,
    /// 秒杀已经结束
    Ended,
    /// 库存不足
    SoldOut,
    /// 不能重复下单
    Duplicate,
}

impl RejectReason {
    /// 脚本返回码
    pub fn code(&self) -> i64 {
        match self {
            RejectReason::NotStarted => -1,
            RejectReason::Ended => -2,
            RejectReason::SoldOut => 1,
            RejectReason::Duplicate => 2,
        }
    }

    /// 解析脚本返回码，`0` 与未知返回码返回 `None`
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(RejectReason::NotStarted),
            -2 => Some(RejectReason::Ended),
            1 => Some(RejectReason::SoldOut),
            2 => Some(RejectReason::Duplicate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotStarted => "not_started",
            RejectReason::Ended => "ended",
            RejectReason::SoldOut => "sold_out",
            RejectReason::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            RejectReason::NotStarted => "秒杀尚未开始",
            RejectReason::Ended => "秒杀已经结束",
            RejectReason::SoldOut => "库存不足",
            RejectReason::Duplicate => "不能重复下单",
        };
        f.write_str(message)
    }
}

/// 准入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// 已预留库存，订单已入队
    Admitted(OrderTicket),
    /// 被拒绝
    Rejected(RejectReason),
}

impl AdmissionOutcome {
    /// 与脚本一致的返回码
    pub fn code(&self) -> i64 {
        match self {
            AdmissionOutcome::Admitted(_) => 0,
            AdmissionOutcome::Rejected(reason) => reason.code(),
        }
    }

    pub fn order_id(&self) -> Option<i64> {
        match self {
            AdmissionOutcome::Admitted(ticket) => Some(ticket.order_id),
            AdmissionOutcome::Rejected(_) => None,
        }
    }
}

/// 准入执行器
#[derive(Clone)]
pub struct AdmissionExecutor {
    store: Arc<dyn KvStore>,
    ids: Arc<dyn IdGenerator>,
    keys: SeckillKeys,
    id_prefix: String,
}

impl AdmissionExecutor {
    pub fn new(
        store: Arc<dyn KvStore>,
        ids: Arc<dyn IdGenerator>,
        keys: SeckillKeys,
        id_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ids,
            keys,
            id_prefix: id_prefix.into(),
        }
    }

    /// 秒杀下单准入
    ///
    /// 先生成订单号，再执行原子脚本；成功时订单已进入队列。
    /// 脚本会修改库存，存储故障时直接返回错误，不做重试。
    #[instrument(skip(self), level = "debug")]
    pub async fn admit(&self, item_id: i64, user_id: i64) -> Result<AdmissionOutcome> {
        let order_id = self.ids.next_id(&self.id_prefix).await?;
        let issued_at = Utc::now();
        let args = AdmissionArgs {
            user_id,
            item_id,
            order_id,
            now_millis: issued_at.timestamp_millis(),
            issued_at: issued_at.to_rfc3339(),
        };

        let started = Instant::now();
        let code = self
            .store
            .eval_admission(&self.keys.admission(item_id), &args)
            .await?;
        GLOBAL_METRICS.record_duration("seckill", "admit", started.elapsed().as_secs_f64());

        if code == 0 {
            GLOBAL_METRICS.record_admission("admitted");
            debug!("Admitted user {} for item {} as order {}", user_id, item_id, order_id);
            return Ok(AdmissionOutcome::Admitted(OrderTicket {
                order_id,
                user_id,
                item_id,
                issued_at,
            }));
        }

        match RejectReason::from_code(code) {
            Some(reason) => {
                GLOBAL_METRICS.record_admission(reason.as_str());
                debug!("Rejected user {} for item {}: {}", user_id, item_id, reason);
                Ok(AdmissionOutcome::Rejected(reason))
            }
            None => Err(CacheError::StoreUnavailable(format!(
                "admission script returned unexpected code {}",
                code
            ))),
        }
    }
}
