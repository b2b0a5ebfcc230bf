//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存值的序列化机制。
//!
//! 共享存储中的值都是字符串，序列化结果永远不为空串，
//! 空串保留给缓存墓碑（确认不存在）。

pub mod json;

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};

pub use json::JsonSerializer;

/// 序列化器特征
///
/// 定义序列化和反序列化操作的接口
pub trait Serializer: Send + Sync {
    /// 序列化值为存储文本
    fn serialize<T: Serialize>(&self, value: &T) -> Result<String>;

    /// 从存储文本反序列化值
    fn deserialize<T: DeserializeOwned>(&self, data: &str) -> Result<T>;
}
