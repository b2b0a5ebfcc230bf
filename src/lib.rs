//! flashguard - 缓存防护与秒杀下单组件
//!
//! 提供三种缓存查询策略（缓存空值、互斥重建、逻辑过期）、
//! 基于Redis的分布式锁，以及原子准入加异步落库的秒杀下单链路。

#![doc(html_root_url = "https://docs.rs/flashguard/0.1.0")]

pub use serde;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use tokio;

pub mod backend;
pub mod cli;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod recovery;
pub mod seckill;
pub mod serialization;
pub mod telemetry;

// Re-export commonly used items
pub use backend::{KvStore, MemoryStore, RedisStore};
pub use client::{CacheClient, CacheStrategy, KeySpace, Lookup};
pub use config::Config;
pub use error::{CacheError, Result};
pub use lock::{DistributedLock, LockToken};
pub use seckill::{AdmissionOutcome, OrderConsumer, RejectReason, SeckillService};

/// flashguard 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
