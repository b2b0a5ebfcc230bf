//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了发布秒杀活动命令的实现。

use crate::cli::{open_repository, open_store, PublishSaleArgs};
use crate::config::Config;
use crate::seckill::{IdWorker, Sale, SeckillService};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid RFC 3339 timestamp '{}'", value))?
        .with_timezone(&Utc))
}

pub async fn execute(config: &Config, args: &PublishSaleArgs) -> Result<()> {
    let begin = match args.begin {
        Some(ref begin) => parse_time(begin)?,
        None => Utc::now(),
    };
    let end = parse_time(&args.end)?;

    let store = open_store(config).await?;
    let repository = open_repository(config).await?;
    let ids = Arc::new(IdWorker::new(store.clone(), &config.global.key_namespace));
    let service = SeckillService::new(store, repository, ids, config);

    let sale = Sale {
        item_id: args.item,
        stock: args.stock,
        begin,
        end,
    };
    service.publish_sale(&sale).await?;

    println!(
        "Published item {} with stock {} from {} to {}",
        sale.item_id, sale.stock, sale.begin, sale.end
    );
    Ok(())
}
