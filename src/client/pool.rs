//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存异步重建使用的有界工作池。
//!
//! 固定数量的工作任务共享一个有界队列。队列满时任务在提交方执行，
//! 压力回到触发重建的调用方，既不无限排队也不丢弃任务。

use crate::error::{CacheError, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 重建任务
pub type RebuildJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 任务提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// 已进入队列
    Queued,
    /// 队列已满，已在提交方执行完毕
    RanInline,
}

async fn run_guarded(job: RebuildJob) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("Cache rebuild job panicked");
    }
}

/// 缓存重建工作池
pub struct RebuildPool {
    sender: RwLock<Option<mpsc::Sender<RebuildJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl RebuildPool {
    /// 创建工作池并启动工作任务，必须在 tokio 运行时内调用
    ///
    /// # 参数
    ///
    /// * `workers` - 常驻工作任务数量
    /// * `capacity` - 等待队列容量
    /// * `shutdown_timeout` - 关闭时等待队列排空的最长时间
    pub fn new(workers: usize, capacity: usize, shutdown_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::channel::<RebuildJob>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        match job {
                            Some(job) => run_guarded(job).await,
                            None => break,
                        }
                    }
                    debug!("cache-rebuild-{} stopped", index);
                })
            })
            .collect();

        Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(handles),
            shutdown_timeout,
        }
    }

    /// 提交重建任务
    ///
    /// 队列满时在当前任务中直接执行；工作池已关闭时返回错误，任务不会执行。
    pub async fn submit(&self, job: RebuildJob) -> Result<Submitted> {
        let sender = self.sender.read().await.clone();
        let Some(sender) = sender else {
            return Err(CacheError::ShutdownError(
                "rebuild pool is shut down".to_string(),
            ));
        };

        match sender.try_send(job) {
            Ok(()) => Ok(Submitted::Queued),
            Err(mpsc::error::TrySendError::Full(job)) => {
                debug!("Rebuild queue is full, running job on caller");
                run_guarded(job).await;
                Ok(Submitted::RanInline)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CacheError::ShutdownError(
                "rebuild pool is shut down".to_string(),
            )),
        }
    }

    pub async fn is_shut_down(&self) -> bool {
        self.sender.read().await.is_none()
    }

    /// 关闭工作池
    ///
    /// 停止接收新任务，等待已排队的任务执行完毕后回收工作任务。
    /// 超时后中止剩余任务并返回 [`CacheError::Timeout`]。
    pub async fn shutdown(&self) -> Result<()> {
        if self.sender.write().await.take().is_none() {
            return Ok(());
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(handles)).await
        {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Rebuild worker ended abnormally: {}", e);
                    }
                }
                info!("Rebuild pool shut down");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                Err(CacheError::Timeout(format!(
                    "rebuild pool did not drain within {:?}",
                    self.shutdown_timeout
                )))
            }
        }
    }
}
