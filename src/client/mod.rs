//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了旁路缓存客户端的接口和实现。

pub mod cache;
pub mod entry;
pub mod pool;

pub use cache::{CacheClient, WarmupReport};
pub use entry::{CacheStrategy, KeySpace, LogicalEntry, Lookup, TOMBSTONE};
pub use pool::{RebuildJob, RebuildPool, Submitted};
