//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::backend::{KvStore, RedisStore};
use crate::config::Config;
use crate::database::{self, OrderRepository};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "flashguard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        default_value = "flashguard.toml",
        help = "Path to the TOML configuration file"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "consume", about = "Run the order consumer until interrupted")]
    Consume(ConsumeArgs),

    #[command(name = "publish-sale", about = "Publish or update a flash-sale item")]
    PublishSale(PublishSaleArgs),

    #[command(name = "status", about = "Check store and database connectivity")]
    Status(StatusArgs),
}

#[derive(Parser, Debug)]
pub struct ConsumeArgs {
    #[arg(long, help = "Override the consumer name from the configuration")]
    pub consumer: Option<String>,
}

#[derive(Parser, Debug)]
pub struct PublishSaleArgs {
    #[arg(long, help = "Item (voucher) id")]
    pub item: i64,

    #[arg(long, help = "Initial stock")]
    pub stock: i32,

    #[arg(long, help = "Sale start, RFC 3339 (defaults to now)")]
    pub begin: Option<String>,

    #[arg(long, help = "Sale end, RFC 3339")]
    pub end: String,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[arg(long, help = "Also show the database stock and order count for this item")]
    pub item: Option<i64>,
}

mod consume;
mod sale;
mod status;

/// 加载配置并初始化日志
fn load(path: &Path) -> Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    crate::telemetry::init_tracing(&config.global.service_name, &config.global.log_filter);
    Ok(config)
}

async fn open_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    let store = RedisStore::new(&config.redis)
        .await
        .context("Failed to connect to Redis")?;
    Ok(Arc::new(store))
}

async fn open_repository(config: &Config) -> Result<OrderRepository> {
    let db = database::connect(&config.database)
        .await
        .context("Failed to connect to the order database")?;
    Ok(OrderRepository::new(db))
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load(&cli.config)?;

    let result = match &cli.command {
        Commands::Consume(args) => consume::execute(config, args).await,
        Commands::PublishSale(args) => sale::execute(&config, args).await,
        Commands::Status(args) => status::execute(&config, args).await,
    };
    crate::telemetry::shutdown_tracing();
    result
}
