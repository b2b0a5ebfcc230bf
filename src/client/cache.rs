//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了旁路缓存引擎，提供缓存穿透、互斥重建与逻辑过期三种查询策略。

use super::entry::{Cached, CacheStrategy, KeySpace, LogicalEntry, Lookup, TOMBSTONE};
use super::pool::{RebuildJob, RebuildPool};
use crate::backend::KvStore;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::lock::{DistributedLock, LockToken};
use crate::metrics::GLOBAL_METRICS;
use crate::recovery::RetryPolicy;
use crate::serialization::{JsonSerializer, Serializer};
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

/// 缓存预热结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// 成功写入的条目数
    pub loaded: usize,
    /// 数据源中不存在的条目数
    pub missing: usize,
    /// 加载或写入失败的条目数
    pub failed: usize,
}

enum WarmupOutcome {
    Loaded,
    Missing,
    Failed,
}

/// 在 ±20% 范围内随机化TTL，避免大量缓存同时过期
fn jittered(ttl: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    ttl.mul_f64(factor)
}

fn logical_expiry(ttl: Duration) -> Result<chrono::DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| CacheError::ConfigError(format!("logical ttl out of range: {}", e)))?;
    Ok(Utc::now() + ttl)
}

/// 编码逻辑过期条目，写入时存储层不设置过期
fn encode_logical<T: Serialize>(
    serializer: &JsonSerializer,
    data: Option<&T>,
    ttl: Duration,
) -> Result<String> {
    let entry = LogicalEntry::new(data, logical_expiry(ttl)?);
    serializer.serialize(&entry)
}

async fn write_logical(store: &dyn KvStore, key: &str, payload: Result<String>) -> Result<()> {
    store.set(key, &payload?).await
}

/// 旁路缓存客户端
///
/// 持有自己的重建工作池，使用完毕后调用 [`CacheClient::shutdown`]。
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn KvStore>,
    lock: DistributedLock,
    serializer: JsonSerializer,
    retry: RetryPolicy,
    config: CacheConfig,
    pool: Arc<RebuildPool>,
}

impl CacheClient {
    /// 创建缓存客户端，必须在 tokio 运行时内调用
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        let pool = RebuildPool::new(
            config.rebuild_workers,
            config.rebuild_queue_capacity,
            Duration::from_millis(config.shutdown_timeout_ms),
        );
        Self {
            lock: DistributedLock::new(store.clone()),
            store,
            serializer: JsonSerializer::new(),
            retry: RetryPolicy::default(),
            config,
            pool: Arc::new(pool),
        }
    }

    /// 设置读缓存的重试策略
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 设置序列化器
    pub fn with_serializer(mut self, serializer: JsonSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn read(&self, key: &str) -> Result<Cached> {
        let store = self.store.clone();
        let raw = self.retry.run("cache get", || store.get(key)).await?;
        Ok(Cached::from(raw))
    }

    /// 写入带TTL的缓存值
    #[instrument(skip(self, value), level = "debug")]
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let payload = self.serializer.serialize(value)?;
        self.store.set_ex(key, &payload, ttl).await
    }

    /// 写入逻辑过期的缓存值
    #[instrument(skip(self, value), level = "debug")]
    pub async fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let payload = encode_logical(&self.serializer, Some(value), ttl);
        write_logical(self.store.as_ref(), key, payload).await
    }

    /// 删除缓存
    ///
    /// 写路径先更新数据源再调用此方法。
    #[instrument(skip(self), level = "debug")]
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        self.store.delete(key).await
    }

    async fn write_tombstone(&self, key: &str) -> Result<()> {
        self.store
            .set_ex(key, TOMBSTONE, self.config.null_ttl())
            .await
    }

    /// 缓存穿透防护查询
    ///
    /// 未命中时直接查询数据源；数据不存在时写入短TTL的墓碑。
    ///
    /// # 参数
    ///
    /// * `space` - 键空间
    /// * `id` - 数据ID
    /// * `loader` - 数据源查询
    /// * `ttl` - 缓存时间
    #[instrument(skip(self, space, id, loader), level = "debug", fields(key_prefix = %space.key_prefix, id = %id))]
    pub async fn query_pass_through<T, ID, F, Fut>(
        &self,
        space: &KeySpace,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = space.key(&id);
        match self.read(&key).await? {
            Cached::Value(json) => {
                GLOBAL_METRICS.record_lookup("pass_through", "hit");
                return Ok(Some(self.serializer.deserialize(&json)?));
            }
            Cached::Tombstone => {
                GLOBAL_METRICS.record_lookup("pass_through", "absent");
                return Ok(None);
            }
            Cached::Missing => {}
        }

        GLOBAL_METRICS.record_lookup("pass_through", "miss");
        match loader(id).await? {
            Some(value) => {
                self.set(&key, &value, ttl).await?;
                Ok(Some(value))
            }
            None => {
                debug!("Caching tombstone for {}", key);
                self.write_tombstone(&key).await?;
                Ok(None)
            }
        }
    }

    /// 互斥锁重建查询
    ///
    /// 未命中时只有抢到重建锁的调用方查询数据源，其余调用方轮询缓存。
    /// 轮询次数耗尽返回 [`CacheError::CacheRebuildTimeout`]。
    #[instrument(skip(self, space, id, loader), level = "debug", fields(key_prefix = %space.key_prefix, id = %id))]
    pub async fn query_mutex<T, ID, F, Fut>(
        &self,
        space: &KeySpace,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = space.key(&id);
        match self.read(&key).await? {
            Cached::Value(json) => {
                GLOBAL_METRICS.record_lookup("mutex", "hit");
                return Ok(Some(self.serializer.deserialize(&json)?));
            }
            Cached::Tombstone => {
                GLOBAL_METRICS.record_lookup("mutex", "absent");
                return Ok(None);
            }
            Cached::Missing => {}
        }

        let lock_key = space.lock_key(&id);
        let Some(token) = self
            .lock
            .try_acquire(&lock_key, self.config.lock_ttl())
            .await?
        else {
            GLOBAL_METRICS.record_lookup("mutex", "wait");
            return self.wait_for_rebuild(&key).await;
        };

        // 释放锁之前不让 panic 越过这里
        let outcome = AssertUnwindSafe(self.rebuild_under_lock(&key, id, loader, ttl))
            .catch_unwind()
            .await;
        self.lock.release_quietly(&token).await;
        match outcome {
            Ok(result) => {
                GLOBAL_METRICS.record_rebuild(
                    "mutex",
                    if result.is_ok() { "success" } else { "failure" },
                );
                result
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn rebuild_under_lock<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        // 双重检查：等锁期间可能已被他人重建
        match self.read(key).await? {
            Cached::Value(json) => return self.serializer.deserialize(&json).map(Some),
            Cached::Tombstone => return Ok(None),
            Cached::Missing => {}
        }

        match loader(id).await? {
            Some(value) => {
                self.set(key, &value, ttl).await?;
                Ok(Some(value))
            }
            None => {
                self.write_tombstone(key).await?;
                Ok(None)
            }
        }
    }

    async fn wait_for_rebuild<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let base = self.config.mutex_base_backoff_ms;
        let max_retries = self.config.mutex_max_retries;
        for attempt in 0..max_retries {
            let delay = Duration::from_millis(base * (1 + u64::from(attempt) / 5));
            tokio::time::sleep(delay).await;
            match self.read(key).await? {
                Cached::Value(json) => return self.serializer.deserialize(&json).map(Some),
                Cached::Tombstone => return Ok(None),
                Cached::Missing => {}
            }
        }

        warn!(
            "等待缓存重建超时 key={}，重建方可能异常或写缓存失败",
            key
        );
        GLOBAL_METRICS.record_lookup("mutex", "timeout");
        Err(CacheError::CacheRebuildTimeout {
            key: key.to_string(),
            attempts: max_retries,
        })
    }

    /// 逻辑过期重建查询
    ///
    /// 从不阻塞等待数据源：未预热的键返回 [`Lookup::Cold`]，
    /// 已过期的条目返回旧值并在后台刷新，同一键同时只有一个刷新任务。
    #[instrument(skip(self, space, id, loader), level = "debug", fields(key_prefix = %space.key_prefix, id = %id))]
    pub async fn query_logical_expire<T, ID, F, Fut>(
        &self,
        space: &KeySpace,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Lookup<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        ID: Display + Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let key = space.key(&id);
        let entry: LogicalEntry<T> = match self.read(&key).await? {
            Cached::Value(json) => self.serializer.deserialize(&json)?,
            Cached::Missing | Cached::Tombstone => {
                GLOBAL_METRICS.record_lookup("logical_expire", "cold");
                return Ok(Lookup::Cold);
            }
        };

        if !entry.is_expired_at(Utc::now()) {
            let lookup = Lookup::from(entry.data);
            GLOBAL_METRICS.record_lookup("logical_expire", lookup.outcome());
            return Ok(lookup);
        }

        let stale = match entry.data {
            Some(value) => Lookup::Stale(value),
            None => Lookup::Absent,
        };
        GLOBAL_METRICS.record_lookup("logical_expire", stale.outcome());

        let lock_key = space.lock_key(&id);
        let Some(token) = self
            .lock
            .try_acquire(&lock_key, self.config.lock_ttl())
            .await?
        else {
            // 已有刷新任务
            return Ok(stale);
        };

        // 双重检查：上一个刷新任务可能刚完成并释放了锁
        match self.read_logical::<T>(&key).await {
            Ok(Some(latest)) if !latest.is_expired_at(Utc::now()) => {
                info!("Logical entry {} was refreshed concurrently", key);
                self.lock.release_quietly(&token).await;
                return Ok(Lookup::from(latest.data));
            }
            Ok(_) => {}
            Err(e) => {
                self.lock.release_quietly(&token).await;
                return Err(e);
            }
        }

        let job = self.logical_rebuild_job(key, id, loader, ttl, token.clone());
        if let Err(e) = self.pool.submit(job).await {
            warn!("Failed to schedule cache rebuild: {}", e);
            self.lock.release_quietly(&token).await;
        }
        Ok(stale)
    }

    async fn read_logical<T: DeserializeOwned>(&self, key: &str) -> Result<Option<LogicalEntry<T>>> {
        match self.read(key).await? {
            Cached::Value(json) => self.serializer.deserialize(&json).map(Some),
            Cached::Missing | Cached::Tombstone => Ok(None),
        }
    }

    fn logical_rebuild_job<T, ID, F, Fut>(
        &self,
        key: String,
        id: ID,
        loader: F,
        ttl: Duration,
        token: LockToken,
    ) -> RebuildJob
    where
        T: Serialize + Send + 'static,
        ID: Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let store = self.store.clone();
        let serializer = self.serializer.clone();
        let lock = self.lock.clone();

        Box::pin(async move {
            let loaded = AssertUnwindSafe(async move { loader(id).await })
                .catch_unwind()
                .await;
            match loaded {
                Ok(Ok(value)) => {
                    let payload = encode_logical(&serializer, value.as_ref(), ttl);
                    drop(value);
                    match write_logical(store.as_ref(), &key, payload).await {
                        Ok(()) => {
                            debug!("Logical entry {} refreshed", key);
                            GLOBAL_METRICS.record_rebuild("logical_expire", "success");
                        }
                        Err(e) => {
                            warn!("Failed to write refreshed entry {}: {}", key, e);
                            GLOBAL_METRICS.record_rebuild("logical_expire", "failure");
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("Async cache rebuild for {} failed: {}", key, e);
                    GLOBAL_METRICS.record_rebuild("logical_expire", "failure");
                }
                Err(_) => {
                    error!("Async cache rebuild for {} panicked", key);
                    GLOBAL_METRICS.record_rebuild("logical_expire", "failure");
                }
            }
            lock.release_quietly(&token).await;
        })
    }

    /// 按策略查询
    pub async fn query<T, ID, F, Fut>(
        &self,
        strategy: CacheStrategy,
        space: &KeySpace,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Lookup<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        ID: Display + Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        match strategy {
            CacheStrategy::PassThrough => self
                .query_pass_through(space, id, loader, ttl)
                .await
                .map(Lookup::from),
            CacheStrategy::Mutex => self
                .query_mutex(space, id, loader, ttl)
                .await
                .map(Lookup::from),
            CacheStrategy::LogicalExpire => {
                self.query_logical_expire(space, id, loader, ttl).await
            }
        }
    }

    /// 批量查询
    ///
    /// 未命中的ID通过一次批量加载取回；写入时TTL随机化 ±20%，
    /// 数据源未返回的ID写入墓碑。命中墓碑的ID视为不存在，不再加载。
    #[instrument(skip(self, ids, loader), level = "debug", fields(key_prefix = %space.key_prefix, count = ids.len()))]
    pub async fn batch_query<T, ID, F, Fut>(
        &self,
        space: &KeySpace,
        ids: Vec<ID>,
        loader: F,
        ttl: Duration,
    ) -> Result<HashMap<ID, T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Display + Hash + Eq + Clone,
        F: FnOnce(Vec<ID>) -> Fut,
        Fut: Future<Output = Result<HashMap<ID, T>>>,
    {
        let mut result = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(result);
        }

        let keys: Vec<String> = ids.iter().map(|id| space.key(id)).collect();
        let store = self.store.clone();
        let values = self.retry.run("cache mget", || store.mget(&keys)).await?;

        // 重复的ID只加载、写入一次
        let mut seen = HashSet::with_capacity(ids.len());
        let mut missed = Vec::new();
        let (mut hits, mut absent) = (0_u64, 0_u64);
        for (id, raw) in ids.into_iter().zip(values) {
            if !seen.insert(id.clone()) {
                continue;
            }
            match Cached::from(raw) {
                Cached::Value(json) => {
                    result.insert(id, self.serializer.deserialize(&json)?);
                    hits += 1;
                }
                Cached::Tombstone => absent += 1,
                Cached::Missing => missed.push(id),
            }
        }
        GLOBAL_METRICS.record_lookups("batch", "hit", hits);
        GLOBAL_METRICS.record_lookups("batch", "absent", absent);
        GLOBAL_METRICS.record_lookups("batch", "miss", missed.len() as u64);

        if missed.is_empty() {
            return Ok(result);
        }
        debug!("Batch query loading {} missed ids", missed.len());

        let mut loaded = loader(missed.clone()).await?;
        for id in missed {
            let key = space.key(&id);
            match loaded.remove(&id) {
                Some(value) => {
                    self.set(&key, &value, jittered(ttl)).await?;
                    result.insert(id, value);
                }
                None => self.write_tombstone(&key).await?,
            }
        }
        Ok(result)
    }

    /// 缓存预热
    ///
    /// 在重建工作池上为每个ID写入逻辑过期条目。单个ID失败只记录日志，不影响整体。
    #[instrument(skip(self, ids, loader), level = "info", fields(key_prefix = %space.key_prefix, count = ids.len()))]
    pub async fn warm_up<T, ID, F, Fut>(
        &self,
        space: &KeySpace,
        ids: Vec<ID>,
        loader: F,
        ttl: Duration,
    ) -> Result<WarmupReport>
    where
        T: Serialize + Send + 'static,
        ID: Display + Send + 'static,
        F: Fn(ID) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let mut pending = Vec::with_capacity(ids.len());
        for id in ids {
            let key = space.key(&id);
            let loader = loader.clone();
            let store = self.store.clone();
            let serializer = self.serializer.clone();
            let (tx, rx) = oneshot::channel();

            let job: RebuildJob = Box::pin(async move {
                let loaded = AssertUnwindSafe(async move { loader(id).await })
                    .catch_unwind()
                    .await;
                let outcome = match loaded {
                    Ok(Ok(Some(value))) => {
                        let payload = encode_logical(&serializer, Some(&value), ttl);
                        drop(value);
                        match write_logical(store.as_ref(), &key, payload).await {
                            Ok(()) => WarmupOutcome::Loaded,
                            Err(e) => {
                                warn!("缓存预热失败 key={}: {}", key, e);
                                WarmupOutcome::Failed
                            }
                        }
                    }
                    Ok(Ok(None)) => WarmupOutcome::Missing,
                    Ok(Err(e)) => {
                        warn!("缓存预热失败 key={}: {}", key, e);
                        WarmupOutcome::Failed
                    }
                    Err(_) => {
                        error!("缓存预热 key={} panicked", key);
                        WarmupOutcome::Failed
                    }
                };
                let _ = tx.send(outcome);
            });
            self.pool.submit(job).await?;
            pending.push(rx);
        }

        let mut report = WarmupReport::default();
        for outcome in futures::future::join_all(pending).await {
            match outcome {
                Ok(WarmupOutcome::Loaded) => report.loaded += 1,
                Ok(WarmupOutcome::Missing) => report.missing += 1,
                Ok(WarmupOutcome::Failed) | Err(_) => report.failed += 1,
            }
        }
        info!(
            "Warm-up finished: loaded={}, missing={}, failed={}",
            report.loaded, report.missing, report.failed
        );
        Ok(report)
    }

    /// 关闭重建工作池，等待已排队的重建完成
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.shutdown().await
    }
}
