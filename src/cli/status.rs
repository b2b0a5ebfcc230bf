//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了状态查询命令的实现。

use crate::cli::{open_repository, open_store, StatusArgs};
use crate::config::Config;
use crate::seckill::SeckillKeys;
use anyhow::Result;

pub async fn execute(config: &Config, args: &StatusArgs) -> Result<()> {
    println!("=== flashguard status ===\n");

    let store = match open_store(config).await {
        Ok(store) => {
            let state = if store.ping().await.is_ok() { "✅ HEALTHY" } else { "⚠️ UNREACHABLE" };
            println!("Redis:    {}", state);
            Some(store)
        }
        Err(e) => {
            println!("Redis:    ❌ {}", e);
            None
        }
    };

    let repository = match open_repository(config).await {
        Ok(repository) => {
            println!("Database: ✅ HEALTHY");
            Some(repository)
        }
        Err(e) => {
            println!("Database: ❌ {}", e);
            None
        }
    };

    let Some(item) = args.item else {
        return Ok(());
    };
    println!("\nItem {}:", item);
    let keys = SeckillKeys::from_config(config);

    if let Some(store) = store {
        let stock = store.get(&keys.stock(item)).await?;
        println!("  Redis stock:    {}", stock.as_deref().unwrap_or("-"));
    }
    if let Some(repository) = repository {
        match repository.find_voucher(item).await? {
            Some(voucher) => println!("  Database stock: {}", voucher.stock),
            None => println!("  Database stock: -"),
        }
        println!(
            "  Orders:         {}",
            repository.orders_for_item(item).await?.len()
        );
    }
    Ok(())
}
