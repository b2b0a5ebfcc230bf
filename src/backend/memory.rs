//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了进程内的键值存储实现。
//!
//! 语义与 Redis 实现保持一致（过期、原子脚本、消费者组与pending列表），
//! 用于测试和无需共享状态的单机部署。所有操作在同一把互斥锁下完成，
//! 因此每个组合操作都是原子的。

use super::kv::{AdmissionArgs, AdmissionKeys, KvStore, ReadCursor, StreamRecord};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// 已投递的最大序号
    last_delivered: u64,
    /// 未确认消息：序号 -> 消费者
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    entries: BTreeMap<u64, StreamRecord>,
    index: HashMap<String, u64>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: HashMap<String, String>) -> String {
        self.next_seq += 1;
        let seq = self.next_seq;
        let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq);
        self.index.insert(id.clone(), seq);
        self.entries.insert(
            seq,
            StreamRecord {
                id: id.clone(),
                fields,
            },
        );
        id
    }
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Entry>,
    streams: HashMap<String, StreamState>,
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::StoreUnavailable(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

impl State {
    /// 读取未过期的键，过期键在访问时惰性删除
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .keys
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.keys.remove(key);
            return None;
        }
        self.keys.get_mut(key)
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Str(s), ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn put_str(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.keys.insert(
            key.to_string(),
            Entry {
                data: Data::Str(value),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        let current = match self.get_str(key)? {
            Some(s) => s.parse::<i64>().map_err(|_| {
                CacheError::StoreUnavailable(format!(
                    "value at {} is not an integer or out of range",
                    key
                ))
            })?,
            None => 0,
        };
        let next = current + delta;
        // INCR 保留原有过期时间
        let expires_at = self.live(key).and_then(|e| e.expires_at);
        self.keys.insert(
            key.to_string(),
            Entry {
                data: Data::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        if self.live(key).is_none() {
            self.keys.insert(
                key.to_string(),
                Entry {
                    data: Data::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.keys.get_mut(key) {
            Some(Entry {
                data: Data::Hash(h),
                ..
            }) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut HashSet<String>> {
        if self.live(key).is_none() {
            self.keys.insert(
                key.to_string(),
                Entry {
                    data: Data::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.keys.get_mut(key) {
            Some(Entry {
                data: Data::Set(s), ..
            }) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn is_member(&mut self, key: &str, member: &str) -> Result<bool> {
        match self.live(key) {
            None => Ok(false),
            Some(Entry {
                data: Data::Set(s), ..
            }) => Ok(s.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamRecord>> {
        let state = self.streams.get_mut(stream).ok_or_else(|| {
            CacheError::StoreUnavailable(format!("NOGROUP no such key '{}'", stream))
        })?;
        let group_state = state.groups.get_mut(group).ok_or_else(|| {
            CacheError::StoreUnavailable(format!(
                "NOGROUP no such consumer group '{}' for key '{}'",
                group, stream
            ))
        })?;

        let mut records = Vec::new();
        match cursor {
            ReadCursor::New => {
                let fresh: Vec<u64> = state
                    .entries
                    .range(group_state.last_delivered + 1..)
                    .take(count)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in fresh {
                    group_state.last_delivered = seq;
                    group_state.pending.insert(seq, consumer.to_string());
                    if let Some(record) = state.entries.get(&seq) {
                        records.push(record.clone());
                    }
                }
            }
            ReadCursor::Pending => {
                for (seq, owner) in group_state.pending.iter() {
                    if records.len() >= count {
                        break;
                    }
                    if owner != consumer {
                        continue;
                    }
                    if let Some(record) = state.entries.get(seq) {
                        records.push(record.clone());
                    }
                }
            }
        }
        Ok(records)
    }
}

/// 内存键值存储
///
/// 克隆后的实例共享同一份数据，可用来模拟多个进程或进程重启。
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列中的消息总数
    pub async fn stream_len(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// 消费者组中未确认的消息数
    pub async fn pending_len(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// 键的剩余存活时间，键不存在或未设置过期时返回 `None`
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock().await;
        state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.state.lock().await.get_str(key)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut state = self.state.lock().await;
        // MGET 对类型不符的键返回空
        Ok(keys
            .iter()
            .map(|k| state.get_str(k).ok().flatten())
            .collect())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.state
            .lock()
            .await
            .put_str(key, value.to_string(), Some(ttl));
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state.lock().await.put_str(key, value.to_string(), None);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.live(key).is_some();
        state.keys.remove(key);
        Ok(existed)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.put_str(key, value.to_string(), Some(ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let matches = matches!(
            state.live(key),
            Some(Entry { data: Data::Str(s), .. }) if s.as_str() == expected
        );
        if matches {
            state.keys.remove(key);
        }
        Ok(matches)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.state.lock().await.incr_by(key, 1)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut state = self.state.lock().await;
        let hash = state.hash_mut(key)?;
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock().await;
        match state.live(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                data: Data::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.set_mut(key)?.insert(member.to_string()))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.state.lock().await.is_member(key, member)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.live(key).is_none() {
            state.keys.insert(
                key.to_string(),
                Entry {
                    data: Data::SortedSet(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match state.keys.get_mut(key) {
            Some(Entry {
                data: Data::SortedSet(z),
                ..
            }) => {
                z.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut state = self.state.lock().await;
        match state.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::SortedSet(z),
                ..
            }) => Ok(z.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn eval_admission(&self, keys: &AdmissionKeys, args: &AdmissionArgs) -> Result<i64> {
        let mut state = self.state.lock().await;

        let window = match state.live(&keys.sale) {
            Some(Entry {
                data: Data::Hash(h),
                ..
            }) => h.clone(),
            Some(_) => return Err(wrong_type(&keys.sale)),
            None => HashMap::new(),
        };
        let bound = |field: &str| window.get(field).and_then(|v| v.parse::<i64>().ok());
        if bound("begin").is_some_and(|begin| args.now_millis < begin) {
            return Ok(-1);
        }
        if bound("end").is_some_and(|end| args.now_millis > end) {
            return Ok(-2);
        }

        // 缺失的库存视为售罄，非整数库存与脚本一样报错
        let stock = match state.get_str(&keys.stock)? {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                CacheError::StoreUnavailable(format!(
                    "stock value at {} is not a number",
                    keys.stock
                ))
            })?,
        };
        if stock <= 0 {
            return Ok(1);
        }
        let user = args.user_id.to_string();
        if state.is_member(&keys.buyers, &user)? {
            return Ok(2);
        }

        state.incr_by(&keys.stock, -1)?;
        state.set_mut(&keys.buyers)?.insert(user.clone());
        let fields = HashMap::from([
            ("orderId".to_string(), args.order_id.to_string()),
            ("userId".to_string(), user),
            ("itemId".to_string(), args.item_id.to_string()),
            ("issuedAt".to_string(), args.issued_at.clone()),
        ]);
        state
            .streams
            .entry(keys.stream.clone())
            .or_default()
            .append(fields);
        drop(state);
        self.appended.notify_waiters();
        Ok(0)
    }

    async fn stream_add(&self, stream: &str, fields: &[(&str, String)]) -> Result<String> {
        let fields = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        let id = {
            let mut state = self.state.lock().await;
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .append(fields)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(());
        }
        // 与 XGROUP CREATE ... 0 一致：新组从队列开头消费
        stream_state
            .groups
            .insert(group.to_string(), GroupState::default());
        Ok(())
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>> {
        let deadline = match (cursor, block) {
            (ReadCursor::New, Some(block)) => Some(Instant::now() + block),
            _ => None,
        };

        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self
                .state
                .lock()
                .await
                .read_group(stream, group, consumer, cursor, count)?;
            if !records.is_empty() {
                return Ok(records);
            }

            let Some(deadline) = deadline else {
                return Ok(records);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(seq) = stream_state.index.get(id).copied() else {
            return Ok(0);
        };
        let removed = stream_state
            .groups
            .get_mut(group)
            .and_then(|g| g.pending.remove(&seq))
            .is_some();
        Ok(u64::from(removed))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
