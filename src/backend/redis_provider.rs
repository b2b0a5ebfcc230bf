//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了Redis连接提供者接口和默认实现。

use crate::{
    config::{RedisConfig, RedisMode},
    error::{CacheError, Result},
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use secrecy::ExposeSecret;
use tokio::time::{timeout, Duration};

/// Redis连接提供者
///
/// 负责按部署模式建立客户端与连接管理器，测试中可替换为自定义实现
#[async_trait]
pub trait RedisProvider: Send + Sync {
    async fn get_standalone_client(&self, config: &RedisConfig)
        -> Result<(Client, ConnectionManager)>;
    async fn get_sentinel_client(&self, config: &RedisConfig)
        -> Result<(Client, ConnectionManager)>;

    /// 按配置的模式建立连接
    async fn connect(&self, config: &RedisConfig) -> Result<(Client, ConnectionManager)> {
        match config.mode {
            RedisMode::Standalone => self.get_standalone_client(config).await,
            RedisMode::Sentinel => self.get_sentinel_client(config).await,
        }
    }
}

pub struct DefaultRedisProvider;

impl DefaultRedisProvider {
    fn standalone_url(config: &RedisConfig) -> String {
        let raw = config.connection_string.expose_secret();
        if config.enable_tls && !raw.starts_with("rediss://") {
            raw.replace("redis://", "rediss://")
        } else {
            raw.to_string()
        }
    }

    fn sentinel_url(config: &RedisConfig) -> Result<String> {
        let sentinel_config = config.sentinel.as_ref().ok_or_else(|| {
            CacheError::ConfigError("Sentinel configuration is missing".to_string())
        })?;

        // redis+sentinel://[:password@]host:port[,host:port][/service_name]
        let mut url = "redis+sentinel://".to_string();
        if let Some(password) = &config.password {
            url.push_str(&format!(":{}@", password.expose_secret()));
        }

        let nodes: Vec<String> = sentinel_config
            .nodes
            .iter()
            .map(|n| {
                n.trim_start_matches("redis://")
                    .trim_start_matches("redis+sentinel://")
                    .to_string()
            })
            .collect();
        if nodes.is_empty() {
            return Err(CacheError::ConfigError(
                "No sentinel nodes provided".to_string(),
            ));
        }

        url.push_str(&nodes.join(","));
        url.push('/');
        url.push_str(&sentinel_config.master_name);
        Ok(url)
    }

    async fn open(url: &str, connection_timeout_ms: u64) -> Result<(Client, ConnectionManager)> {
        let client = Client::open(url)?;
        let manager = timeout(
            Duration::from_millis(connection_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| {
            CacheError::StoreUnavailable(format!(
                "Redis connection timed out after {}ms",
                connection_timeout_ms
            ))
        })??;
        Ok((client, manager))
    }
}

#[async_trait]
impl RedisProvider for DefaultRedisProvider {
    async fn get_standalone_client(
        &self,
        config: &RedisConfig,
    ) -> Result<(Client, ConnectionManager)> {
        let url = Self::standalone_url(config);
        Self::open(&url, config.connection_timeout_ms).await
    }

    async fn get_sentinel_client(
        &self,
        config: &RedisConfig,
    ) -> Result<(Client, ConnectionManager)> {
        tracing::info!("Initializing Sentinel client with automatic failover support");
        let url = Self::sentinel_url(config)?;
        Self::open(&url, config.connection_timeout_ms).await
    }
}
