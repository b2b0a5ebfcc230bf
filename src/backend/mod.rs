//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了共享键值存储后端，包括存储接口、Redis实现与内存实现。

pub mod kv;
pub mod memory;
pub mod redis;
pub mod redis_provider;

pub use kv::{AdmissionArgs, AdmissionKeys, KvStore, ReadCursor, StreamRecord};
pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use redis_provider::{DefaultRedisProvider, RedisProvider};
