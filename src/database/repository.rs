//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了订单落库的仓储与工作单元。
//!
//! 扣减库存与写入订单在同一个数据库事务中完成，事务由显式的
//! [`UnitOfWork`] 承载并传入纯粹的下单逻辑。

use super::entity::{seckill_voucher, voucher_order};
use crate::error::Result;
use crate::seckill::OrderTicket;
use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, SqlErr, TransactionTrait,
};
use tracing::{debug, instrument, warn};

/// 订单落库结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 已扣减库存并写入订单
    Created,
    /// 该用户已有此商品的订单，幂等跳过
    Duplicate,
    /// 数据库库存不足，未写入
    OutOfStock,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::OutOfStock => "out_of_stock",
        }
    }
}

/// 订单落库接口
#[async_trait]
pub trait OrderApplier: Send + Sync {
    /// 用户是否已有该商品的订单
    async fn has_order(&self, user_id: i64, item_id: i64) -> Result<bool>;

    /// 在一个事务中校验、扣减库存并写入订单
    async fn apply_ticket(&self, ticket: &OrderTicket) -> Result<ApplyOutcome>;
}

/// 工作单元：一次数据库事务
pub struct UnitOfWork {
    txn: DatabaseTransaction,
}

impl UnitOfWork {
    pub async fn begin(db: &DatabaseConnection) -> Result<Self> {
        Ok(Self {
            txn: db.begin().await?,
        })
    }

    /// 统计用户在该商品下的订单数
    pub async fn count_orders(&self, user_id: i64, item_id: i64) -> Result<u64> {
        Ok(voucher_order::Entity::find()
            .filter(voucher_order::Column::UserId.eq(user_id))
            .filter(voucher_order::Column::VoucherId.eq(item_id))
            .count(&self.txn)
            .await?)
    }

    /// 条件扣减库存：`stock = stock - 1 WHERE voucher_id = ? AND stock > 0`
    ///
    /// 返回是否扣减成功
    pub async fn debit_stock(&self, item_id: i64) -> Result<bool> {
        let result = seckill_voucher::Entity::update_many()
            .col_expr(
                seckill_voucher::Column::Stock,
                Expr::col(seckill_voucher::Column::Stock).sub(1),
            )
            .filter(seckill_voucher::Column::VoucherId.eq(item_id))
            .filter(seckill_voucher::Column::Stock.gt(0))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// 写入订单
    pub async fn insert_order(&self, ticket: &OrderTicket) -> std::result::Result<(), DbErr> {
        let order = voucher_order::ActiveModel {
            id: Set(ticket.order_id),
            user_id: Set(ticket.user_id),
            voucher_id: Set(ticket.item_id),
            create_time: Set(ticket.issued_at.timestamp_millis()),
        };
        voucher_order::Entity::insert(order)
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        Ok(self.txn.commit().await?)
    }

    pub async fn rollback(self) -> Result<()> {
        Ok(self.txn.rollback().await?)
    }
}

/// 下单：一人一单校验、条件扣减库存、写入订单
///
/// 只在 [`ApplyOutcome::Created`] 时应提交工作单元。
pub async fn create_order(uow: &UnitOfWork, ticket: &OrderTicket) -> Result<ApplyOutcome> {
    if uow.count_orders(ticket.user_id, ticket.item_id).await? > 0 {
        debug!(
            "用户 {} 已购买过商品 {}",
            ticket.user_id, ticket.item_id
        );
        return Ok(ApplyOutcome::Duplicate);
    }

    if !uow.debit_stock(ticket.item_id).await? {
        warn!(
            "扣减库存失败 item={} order={}",
            ticket.item_id, ticket.order_id
        );
        return Ok(ApplyOutcome::OutOfStock);
    }

    match uow.insert_order(ticket).await {
        Ok(()) => Ok(ApplyOutcome::Created),
        // 并发写入同一 (user_id, voucher_id) 时由唯一约束兜底
        Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            Ok(ApplyOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

/// 基于 sea-orm 的订单仓储
#[derive(Clone)]
pub struct OrderRepository {
    db: DatabaseConnection,
}

impl OrderRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// 发布或更新秒杀商品
    #[instrument(skip(self), level = "info")]
    pub async fn upsert_voucher(
        &self,
        voucher_id: i64,
        stock: i32,
        begin_time: i64,
        end_time: i64,
    ) -> Result<()> {
        let voucher = seckill_voucher::ActiveModel {
            voucher_id: Set(voucher_id),
            stock: Set(stock),
            begin_time: Set(begin_time),
            end_time: Set(end_time),
        };
        seckill_voucher::Entity::insert(voucher)
            .on_conflict(
                OnConflict::column(seckill_voucher::Column::VoucherId)
                    .update_columns([
                        seckill_voucher::Column::Stock,
                        seckill_voucher::Column::BeginTime,
                        seckill_voucher::Column::EndTime,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn find_voucher(&self, voucher_id: i64) -> Result<Option<seckill_voucher::Model>> {
        Ok(seckill_voucher::Entity::find_by_id(voucher_id)
            .one(&self.db)
            .await?)
    }

    pub async fn count_orders(&self, user_id: i64, item_id: i64) -> Result<u64> {
        Ok(voucher_order::Entity::find()
            .filter(voucher_order::Column::UserId.eq(user_id))
            .filter(voucher_order::Column::VoucherId.eq(item_id))
            .count(&self.db)
            .await?)
    }

    pub async fn orders_for_item(&self, item_id: i64) -> Result<Vec<voucher_order::Model>> {
        Ok(voucher_order::Entity::find()
            .filter(voucher_order::Column::VoucherId.eq(item_id))
            .all(&self.db)
            .await?)
    }
}

#[async_trait]
impl OrderApplier for OrderRepository {
    async fn has_order(&self, user_id: i64, item_id: i64) -> Result<bool> {
        Ok(self.count_orders(user_id, item_id).await? > 0)
    }

    #[instrument(skip(self), level = "debug", fields(order = ticket.order_id))]
    async fn apply_ticket(&self, ticket: &OrderTicket) -> Result<ApplyOutcome> {
        let uow = UnitOfWork::begin(&self.db).await?;
        let outcome = match create_order(&uow, ticket).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rollback) = uow.rollback().await {
                    warn!("Rollback failed: {}", rollback);
                }
                return Err(e);
            }
        };

        if outcome == ApplyOutcome::Created {
            uow.commit().await?;
        } else {
            uow.rollback().await?;
        }
        Ok(outcome)
    }
}
