//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了订单数据源：连接管理、表结构与订单仓储。
//!
//! 支持 SQLite、MySQL 和 PostgreSQL。

pub mod entity;
pub mod repository;

pub use repository::{create_order, ApplyOutcome, OrderApplier, OrderRepository, UnitOfWork};

use crate::config::DatabaseConfig;
use crate::error::Result;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::time::Duration;
use tracing::{info, instrument};

const CREATE_SECKILL_VOUCHER: &str = "CREATE TABLE IF NOT EXISTS seckill_voucher (
    voucher_id BIGINT NOT NULL PRIMARY KEY,
    stock INTEGER NOT NULL,
    begin_time BIGINT NOT NULL,
    end_time BIGINT NOT NULL
)";

const CREATE_VOUCHER_ORDER: &str = "CREATE TABLE IF NOT EXISTS voucher_order (
    id BIGINT NOT NULL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    voucher_id BIGINT NOT NULL,
    create_time BIGINT NOT NULL,
    UNIQUE (user_id, voucher_id)
)";

/// 建立数据库连接
///
/// 内存 SQLite 每个连接是独立的数据库，此时连接池固定为一个连接。
#[instrument(skip(config), level = "info")]
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection> {
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections
    };

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    if config.auto_migrate {
        migrate(&db).await?;
    }
    Ok(db)
}

/// 创建秒杀相关的表（已存在则跳过）
pub async fn migrate(db: &DatabaseConnection) -> Result<()> {
    let backend = db.get_database_backend();
    for sql in [CREATE_SECKILL_VOUCHER, CREATE_VOUCHER_ORDER] {
        db.execute(Statement::from_string(backend, sql.to_string()))
            .await?;
    }
    info!("Database schema ready ({:?})", backend);
    Ok(())
}
