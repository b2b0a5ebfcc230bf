//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了订单消费命令的实现。

use crate::cli::{open_repository, open_store, ConsumeArgs};
use crate::config::Config;
use crate::metrics::get_metrics_string;
use crate::recovery::RetryPolicy;
use crate::seckill::{OrderConsumer, SeckillKeys};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn execute(mut config: Config, args: &ConsumeArgs) -> Result<()> {
    if let Some(ref consumer) = args.consumer {
        config.seckill.consumer = consumer.clone();
    }

    let store = open_store(&config).await?;
    let repository = open_repository(&config).await?;

    let consumer = OrderConsumer::new(
        store,
        Arc::new(repository),
        SeckillKeys::from_config(&config),
        config.seckill.clone(),
    )
    .with_retry(RetryPolicy::from(&config.redis));

    let cancel = CancellationToken::new();
    let handle = consumer.spawn(cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping order consumer");
    cancel.cancel();

    handle.await.context("Order consumer task panicked")??;
    println!("{}", get_metrics_string());
    Ok(())
}
