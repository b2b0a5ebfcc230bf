//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 秒杀商品表：库存与秒杀时间窗口。

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "seckill_voucher")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub voucher_id: i64,
    pub stock: i32,
    /// 开始时间（毫秒时间戳）
    pub begin_time: i64,
    /// 结束时间（毫秒时间戳）
    pub end_time: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
