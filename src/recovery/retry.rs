//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了幂等存储操作的有界重试策略。

use crate::config::RedisConfig;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// 计算重试延迟的工具函数 (指数退避)
pub fn calculate_retry_delay(attempt: u32, base_delay_ms: u64) -> Duration {
    let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
    Duration::from_millis(delay)
}

/// 有界重试策略
///
/// 只能用于幂等操作：读缓存、计数器自增、创建消费者组。
/// 扣减库存的准入脚本不得经过这里。
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 基础退避（毫秒）
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
        }
    }
}

impl From<&RedisConfig> for RetryPolicy {
    fn from(config: &RedisConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
        }
    }

    /// 执行操作，遇到瞬时错误时按指数退避重试
    ///
    /// 非瞬时错误立即返回；重试耗尽后返回最后一次的错误。
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = calculate_retry_delay(attempt, self.base_delay_ms);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation,
                        attempt + 1,
                        self.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
