//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存条目、查询结果与键空间等基础类型。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// 缓存墓碑：确认数据不存在时写入的空值
pub const TOMBSTONE: &str = "";

/// 缓存重建策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// 缓存空值防穿透，不做重建协调
    PassThrough,
    /// 互斥锁重建：阻塞等待，强一致
    Mutex,
    /// 逻辑过期重建：返回旧值，异步刷新
    LogicalExpire,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::PassThrough => "pass_through",
            CacheStrategy::Mutex => "mutex",
            CacheStrategy::LogicalExpire => "logical_expire",
        }
    }
}

/// 缓存查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// 命中有效值
    Hit(T),
    /// 命中逻辑过期的旧值，刷新已在后台进行或已被他人接管
    Stale(T),
    /// 确认不存在（墓碑）
    Absent,
    /// 逻辑过期模式下键未预热，不会同步加载
    Cold,
}

impl<T> Lookup<T> {
    /// 取出值（命中或旧值）
    pub fn into_value(self) -> Option<T> {
        match self {
            Lookup::Hit(v) | Lookup::Stale(v) => Some(v),
            Lookup::Absent | Lookup::Cold => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Lookup::Hit(v) | Lookup::Stale(v) => Some(v),
            Lookup::Absent | Lookup::Cold => None,
        }
    }

    pub fn is_cold(&self) -> bool {
        matches!(self, Lookup::Cold)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Lookup::Stale(_))
    }

    pub(crate) fn outcome(&self) -> &'static str {
        match self {
            Lookup::Hit(_) => "hit",
            Lookup::Stale(_) => "stale",
            Lookup::Absent => "absent",
            Lookup::Cold => "cold",
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Hit(v),
            None => Lookup::Absent,
        }
    }
}

/// 带逻辑过期时间的缓存载荷
///
/// 存储层不设置TTL，是否过期由 `expire_time` 判断。`data` 为空表示逻辑墓碑。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogicalEntry<T> {
    pub data: Option<T>,
    pub expire_time: DateTime<Utc>,
}

impl<T> LogicalEntry<T> {
    pub fn new(data: Option<T>, expire_time: DateTime<Utc>) -> Self {
        Self { data, expire_time }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }
}

/// 键空间：数据键前缀与重建锁键前缀
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    pub key_prefix: String,
    pub lock_prefix: String,
}

impl KeySpace {
    pub fn new(key_prefix: impl Into<String>, lock_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            lock_prefix: lock_prefix.into(),
        }
    }

    pub fn key(&self, id: &impl Display) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    pub fn lock_key(&self, id: &impl Display) -> String {
        format!("{}{}", self.lock_prefix, id)
    }
}

/// 缓存中读到的原始值
#[derive(Debug, PartialEq)]
pub(crate) enum Cached {
    Missing,
    Tombstone,
    Value(String),
}

impl From<Option<String>> for Cached {
    fn from(raw: Option<String>) -> Self {
        match raw {
            None => Cached::Missing,
            Some(s) if s == TOMBSTONE => Cached::Tombstone,
            Some(s) => Cached::Value(s),
        }
    }
}
