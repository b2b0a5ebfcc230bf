//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于共享键值存储的分布式锁。
//!
//! 获取锁是一次 `SET NX PX`，释放锁是一次原子的比较并删除，
//! 只有持有者本人能删除锁。锁没有续约机制，调用方需保证TTL
//! 大于临界区的最长执行时间。

use crate::backend::KvStore;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

lazy_static! {
    /// 进程标识，同一进程内的所有锁持有者共享
    static ref PROCESS_ID: String = uuid::Uuid::new_v4().simple().to_string();
}

/// 锁凭证
///
/// 由 [`DistributedLock::try_acquire`] 签发，释放时出示。
/// 持有者标识由进程标识与本次获取的随机标识组成，
/// 同一进程内的两个凭证也不会相同。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    owner: String,
    ttl: Duration,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// 分布式锁
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// 尝试获取锁（单次尝试，不阻塞）
    ///
    /// # 参数
    ///
    /// * `key` - 锁键
    /// * `ttl` - 锁的过期时间，不能为零
    ///
    /// # 返回值
    ///
    /// 获取成功返回锁凭证，锁已被他人持有返回 `None`
    #[instrument(skip(self), level = "debug")]
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        if ttl.is_zero() {
            return Err(CacheError::ConfigError(format!(
                "lock ttl for {} must be greater than zero",
                key
            )));
        }

        let owner = format!("{}-{}", *PROCESS_ID, uuid::Uuid::new_v4().simple());
        let granted = self.store.set_nx_px(key, &owner, ttl).await?;
        if granted {
            GLOBAL_METRICS.record_lock("acquired");
            debug!("Lock acquired: key={}, ttl={:?}", key, ttl);
            Ok(Some(LockToken {
                key: key.to_string(),
                owner,
                ttl,
            }))
        } else {
            GLOBAL_METRICS.record_lock("contended");
            debug!("Lock contended: key={}", key);
            Ok(None)
        }
    }

    /// 释放锁
    ///
    /// 锁已过期并被他人获取时返回 [`CacheError::LockNotOwned`]，不会删除他人的锁。
    #[instrument(skip(self, token), level = "debug", fields(key = %token.key))]
    pub async fn release(&self, token: &LockToken) -> Result<()> {
        if self
            .store
            .compare_and_delete(&token.key, &token.owner)
            .await?
        {
            debug!("Lock released: key={}", token.key);
            Ok(())
        } else {
            GLOBAL_METRICS.record_lock("not_owned");
            warn!(
                "Lock {} was no longer owned at release (expired after {:?})",
                token.key, token.ttl
            );
            Err(CacheError::LockNotOwned(token.key.clone()))
        }
    }

    /// 释放锁并记录失败，用于所有退出路径上的清理
    pub async fn release_quietly(&self, token: &LockToken) {
        if let Err(e) = self.release(token).await {
            match e {
                CacheError::LockNotOwned(_) => {}
                other => warn!("Failed to release lock {}: {}", token.key, other),
            }
        }
    }
}
