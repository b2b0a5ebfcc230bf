//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了系统的配置结构和解析逻辑。

use crate::error::{CacheError, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;

/// 顶层配置
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub config_version: Option<u32>,
    pub global: GlobalConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub seckill: SeckillConfig,
    pub database: DatabaseConfig,
}

/// 全局配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GlobalConfig {
    /// 服务名称，用于日志与链路追踪
    pub service_name: String,
    /// 所有共享存储键的命名空间前缀
    pub key_namespace: String,
    /// 日志过滤表达式（EnvFilter语法）
    pub log_filter: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            service_name: "flashguard".to_string(),
            key_namespace: "flashguard".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

/// Redis配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis模式
    pub mode: RedisMode,
    /// 连接字符串
    pub connection_string: SecretString,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// Redis 密码（可选）
    pub password: Option<SecretString>,
    /// 是否启用 TLS
    pub enable_tls: bool,
    /// 哨兵配置
    pub sentinel: Option<SentinelConfig>,
    /// 幂等命令的最大重试次数
    pub max_retries: u32,
    /// 重试基础退避（毫秒）
    pub retry_base_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Standalone,
            connection_string: SecretString::new("redis://localhost:6379".to_string().into()),
            connection_timeout_ms: 5000,
            password: None,
            enable_tls: false,
            sentinel: None,
            max_retries: 3,
            retry_base_delay_ms: 50,
        }
    }
}

/// 哨兵配置
#[derive(Deserialize, Clone, Debug)]
pub struct SentinelConfig {
    /// 主节点名称
    pub master_name: String,
    /// 哨兵节点列表
    pub nodes: Vec<String>,
}

/// Redis模式枚举
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    /// 单机模式
    #[default]
    Standalone,
    /// 哨兵模式
    Sentinel,
}

/// 缓存引擎配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    /// 空值（墓碑）缓存时间（秒），用于防止缓存穿透
    pub null_ttl_secs: u64,
    /// 重建锁的过期时间（秒）
    pub lock_ttl_secs: u64,
    /// 互斥重建时未抢到锁的最大轮询次数
    pub mutex_max_retries: u32,
    /// 互斥重建轮询的基础间隔（毫秒）
    pub mutex_base_backoff_ms: u64,
    /// 异步重建线程池的常驻工作者数量
    pub rebuild_workers: usize,
    /// 异步重建队列容量，满时由调用方执行
    pub rebuild_queue_capacity: usize,
    /// 关闭重建线程池的等待时间（毫秒）
    pub shutdown_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            null_ttl_secs: 120,
            lock_ttl_secs: 10,
            mutex_max_retries: 25,
            mutex_base_backoff_ms: 20,
            rebuild_workers: 5,
            rebuild_queue_capacity: 100,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl CacheConfig {
    pub fn null_ttl(&self) -> Duration {
        Duration::from_secs(self.null_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// 秒杀链路配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SeckillConfig {
    /// 订单队列（Redis Stream）名称
    pub stream: String,
    /// 消费者组名称
    pub group: String,
    /// 当前进程的消费者名称，同组内不同进程必须不同
    pub consumer: String,
    /// 单次读取的消息条数
    pub read_count: usize,
    /// 队列为空时的阻塞读取时间（毫秒）
    pub block_ms: u64,
    /// 用户下单锁的过期时间（秒）
    pub order_lock_ttl_secs: u64,
    /// 处理pending消息失败后的退避时间（毫秒）
    pub recovery_backoff_ms: u64,
    /// 订单号生成的业务前缀
    pub id_prefix: String,
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            stream: "stream.orders".to_string(),
            group: "g1".to_string(),
            consumer: "c1".to_string(),
            read_count: 1,
            block_ms: 2000,
            order_lock_ttl_secs: 10,
            recovery_backoff_ms: 20,
            id_prefix: "order".to_string(),
        }
    }
}

impl SeckillConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn order_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.order_lock_ttl_secs)
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }
}

/// 数据库配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库连接字符串（sqlite/mysql/postgres）
    pub url: String,
    /// 连接池最大连接数
    pub max_connections: u32,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 启动时是否自动建表
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            connect_timeout_secs: 30,
            auto_migrate: true,
        }
    }
}

impl Config {
    /// 从TOML字符串解析并验证配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| CacheError::ConfigError(e.to_string()))?;
        config.validate().map_err(CacheError::ConfigError)?;
        Ok(config)
    }

    /// 从TOML文件加载并验证配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保所有值都在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(version) = self.config_version {
            if version > CONFIG_VERSION {
                return Err(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                ));
            }
        }

        if self.global.key_namespace.is_empty() {
            return Err("global.key_namespace cannot be empty".to_string());
        }

        // Redis
        if !(100..=30000).contains(&self.redis.connection_timeout_ms) {
            return Err("redis.connection_timeout_ms must be between 100 and 30000 ms".to_string());
        }
        if self.redis.mode == RedisMode::Sentinel && self.redis.sentinel.is_none() {
            return Err("redis.sentinel must be set when mode is sentinel".to_string());
        }

        // 缓存引擎
        let cache = &self.cache;
        if cache.null_ttl_secs == 0 {
            return Err("cache.null_ttl_secs cannot be zero".to_string());
        }
        if cache.lock_ttl_secs == 0 {
            return Err("cache.lock_ttl_secs cannot be zero".to_string());
        }
        if cache.mutex_max_retries == 0 {
            return Err("cache.mutex_max_retries cannot be zero".to_string());
        }
        if cache.mutex_base_backoff_ms == 0 || cache.mutex_base_backoff_ms > 10_000 {
            return Err("cache.mutex_base_backoff_ms must be between 1 and 10000 ms".to_string());
        }
        if cache.rebuild_workers == 0 || cache.rebuild_workers > 256 {
            return Err("cache.rebuild_workers must be between 1 and 256".to_string());
        }
        if cache.rebuild_queue_capacity == 0 {
            return Err("cache.rebuild_queue_capacity cannot be zero".to_string());
        }

        // 秒杀
        let seckill = &self.seckill;
        if seckill.stream.is_empty() || seckill.group.is_empty() || seckill.consumer.is_empty()
        {
            return Err("seckill.stream, seckill.group and seckill.consumer are required".to_string());
        }
        if seckill.read_count == 0 || seckill.read_count > 1000 {
            return Err("seckill.read_count must be between 1 and 1000".to_string());
        }
        if !(1..=60000).contains(&seckill.block_ms) {
            return Err("seckill.block_ms must be between 1 and 60000 ms".to_string());
        }
        if seckill.order_lock_ttl_secs == 0 {
            return Err("seckill.order_lock_ttl_secs cannot be zero".to_string());
        }

        // 数据库
        if self.database.url.is_empty() {
            return Err("database.url cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("database.max_connections cannot be zero".to_string());
        }

        Ok(())
    }
}
