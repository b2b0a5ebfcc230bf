//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了秒杀相关的数据表实体。

pub mod seckill_voucher;
pub mod voucher_order;
