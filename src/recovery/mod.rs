//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了存储故障时的恢复机制。

pub mod retry;

pub use retry::{calculate_retry_delay, RetryPolicy};
