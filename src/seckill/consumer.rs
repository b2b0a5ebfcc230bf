//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了订单队列消费者。
//!
//! 以消费者组方式读取订单消息，在用户锁保护下落库，提交成功后才确认。
//! 处理失败或进程重启时，先从头重放本消费者未确认的消息，再继续读取新消息。

use super::ticket::OrderTicket;
use super::SeckillKeys;
use crate::backend::{KvStore, ReadCursor, StreamRecord};
use crate::config::SeckillConfig;
use crate::database::{ApplyOutcome, OrderApplier};
use crate::error::{CacheError, Result};
use crate::lock::DistributedLock;
use crate::metrics::GLOBAL_METRICS;
use crate::recovery::RetryPolicy;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 订单队列消费者
#[derive(Clone)]
pub struct OrderConsumer {
    store: Arc<dyn KvStore>,
    applier: Arc<dyn OrderApplier>,
    lock: DistributedLock,
    keys: SeckillKeys,
    config: SeckillConfig,
    retry: RetryPolicy,
}

impl OrderConsumer {
    pub fn new(
        store: Arc<dyn KvStore>,
        applier: Arc<dyn OrderApplier>,
        keys: SeckillKeys,
        config: SeckillConfig,
    ) -> Self {
        Self {
            lock: DistributedLock::new(store.clone()),
            store,
            applier,
            keys,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.config.consumer
    }

    /// 创建消费者组（幂等）
    pub async fn init(&self) -> Result<()> {
        let store = self.store.clone();
        let stream = self.keys.stream().to_string();
        let group = self.config.group.clone();
        self.retry
            .run("stream group create", || {
                store.stream_group_create(&stream, &group)
            })
            .await
    }

    /// 在独立任务中运行，直到 `cancel` 被触发
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// 消费主循环
    ///
    /// 启动时先处理pending消息；读取或处理失败后进入pending恢复。
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.init().await?;
        info!(
            "Order consumer {} started on {} (group {})",
            self.config.consumer,
            self.keys.stream(),
            self.config.group
        );

        self.drain_pending(&cancel).await;

        while !cancel.is_cancelled() {
            let records = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.read(ReadCursor::New) => read,
            };

            let failed = match records {
                Ok(records) => {
                    let mut failed = false;
                    for record in &records {
                        if let Err(e) = self.process_record(record).await {
                            error!("处理订单异常 id={}: {}", record.id, e);
                            failed = true;
                            break;
                        }
                    }
                    failed
                }
                Err(e) => {
                    error!("读取订单队列失败: {}", e);
                    true
                }
            };

            if failed && !cancel.is_cancelled() {
                self.drain_pending(&cancel).await;
            }
        }

        info!("Order consumer {} stopped", self.config.consumer);
        Ok(())
    }

    async fn read(&self, cursor: ReadCursor) -> Result<Vec<StreamRecord>> {
        let block = match cursor {
            ReadCursor::New => Some(self.config.block()),
            ReadCursor::Pending => None,
        };
        self.store
            .stream_read_group(
                self.keys.stream(),
                &self.config.group,
                &self.config.consumer,
                cursor,
                self.config.read_count,
                block,
            )
            .await
    }

    /// 重放本消费者未确认的消息，直到pending列表为空或被取消
    ///
    /// 返回成功处理的消息数。失败的消息在退避后重试。
    pub async fn drain_pending(&self, cancel: &CancellationToken) -> usize {
        let mut processed = 0;
        while !cancel.is_cancelled() {
            let outcome = match self.read(ReadCursor::Pending).await {
                Ok(records) if records.is_empty() => break,
                Ok(records) => {
                    let mut outcome = Ok(());
                    for record in &records {
                        match self.process_record(record).await {
                            Ok(()) => processed += 1,
                            Err(e) => {
                                outcome = Err(e);
                                break;
                            }
                        }
                    }
                    outcome
                }
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                error!("处理pending-list异常: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.recovery_backoff()) => {}
                }
            }
        }
        if processed > 0 {
            info!("Recovered {} pending order(s)", processed);
        }
        processed
    }

    /// 处理一条消息，成功后确认
    ///
    /// 无法解析的消息记录错误后直接确认，重试也不会成功。
    #[instrument(skip(self, record), level = "debug", fields(id = %record.id))]
    pub async fn process_record(&self, record: &StreamRecord) -> Result<()> {
        match OrderTicket::from_record(record) {
            Ok(ticket) => {
                let outcome = match self.handle_ticket(&ticket).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        GLOBAL_METRICS.record_order("failed");
                        return Err(e);
                    }
                };
                GLOBAL_METRICS.record_order(outcome.as_str());
                if outcome == ApplyOutcome::OutOfStock {
                    warn!(
                        "Order {} dropped: item {} has no stock left in the database",
                        ticket.order_id, ticket.item_id
                    );
                }
            }
            Err(e @ CacheError::MalformedTicket { .. }) => {
                error!("Dropping malformed order message: {}", e);
                GLOBAL_METRICS.record_order("malformed");
            }
            Err(e) => return Err(e),
        }

        self.store
            .stream_ack(self.keys.stream(), &self.config.group, &record.id)
            .await?;
        debug!("Acknowledged {}", record.id);
        Ok(())
    }

    /// 在用户锁保护下落库
    ///
    /// 锁被占用时返回 [`CacheError::LockContended`]，消息保持未确认，由恢复流程重试。
    pub async fn handle_ticket(&self, ticket: &OrderTicket) -> Result<ApplyOutcome> {
        let lock_key = self.keys.order_lock(ticket.user_id);
        let Some(token) = self
            .lock
            .try_acquire(&lock_key, self.config.order_lock_ttl())
            .await?
        else {
            return Err(CacheError::LockContended(lock_key));
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.apply_locked(ticket))
            .catch_unwind()
            .await;
        self.lock.release_quietly(&token).await;
        GLOBAL_METRICS.record_duration("seckill", "apply", started.elapsed().as_secs_f64());
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn apply_locked(&self, ticket: &OrderTicket) -> Result<ApplyOutcome> {
        if self
            .applier
            .has_order(ticket.user_id, ticket.item_id)
            .await?
        {
            debug!(
                "用户 {} 已购买过商品 {}，跳过订单 {}",
                ticket.user_id, ticket.item_id, ticket.order_id
            );
            return Ok(ApplyOutcome::Duplicate);
        }
        self.applier.apply_ticket(ticket).await
    }
}
