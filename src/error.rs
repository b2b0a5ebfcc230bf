//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存、分布式锁与秒杀下单链路的错误类型。

use thiserror::Error;

/// 系统错误类型枚举
///
/// 覆盖缓存重建、分布式锁、共享存储与数据库的失败情况。
/// 业务性的下单拒绝（未开始、已结束、库存不足、重复下单）不是错误，
/// 见 [`crate::seckill::RejectReason`]。
#[derive(Error, Debug)]
pub enum CacheError {
    /// 互斥重建等待超时：重建线程可能已崩溃或写缓存失败，调用方可重试
    #[error("Cache rebuild timed out for key {key} after {attempts} polls")]
    CacheRebuildTimeout { key: String, attempts: u32 },

    /// 释放了不属于自己的锁（锁已过期并被他人获取）
    #[error("Lock {0} is not owned by this holder")]
    LockNotOwned(String),

    /// 锁被其他持有者占用
    #[error("Lock {0} is held by another owner")]
    LockContended(String),

    /// 共享存储或数据库暂时不可用
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 队列中的订单消息无法解析
    #[error("Malformed order ticket {id}: {reason}")]
    MalformedTicket { id: String, reason: String },

    /// Sea-ORM数据库错误
    #[error("Sea-ORM error: {0}")]
    SeaOrmError(#[from] sea_orm::DbErr),

    /// Redis错误
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// IO错误
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// 关闭错误
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

impl CacheError {
    /// 是否为可重试的瞬时故障
    ///
    /// 只有幂等操作（读缓存、计数器自增等）才应依据此结果重试，
    /// 扣减库存的脚本永远不重试。
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::StoreUnavailable(_) | CacheError::Timeout(_) => true,
            CacheError::RedisError(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
            }
            CacheError::SeaOrmError(sea_orm::DbErr::Conn(_))
            | CacheError::SeaOrmError(sea_orm::DbErr::ConnectionAcquire(_)) => true,
            _ => false,
        }
    }
}

/// 操作结果类型别名
pub type Result<T> = std::result::Result<T, CacheError>;
