//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存引擎与秒杀链路的指标收集和监控功能。

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;
use tracing::{span, Level};

/// 指标收集器
///
/// 用于收集和存储运行时指标，按 Prometheus 文本格式导出
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// 缓存查询统计
    /// key: "strategy:outcome"
    pub cache_lookups: Arc<DashMap<String, u64>>,
    /// 缓存重建统计
    /// key: "strategy:result"
    pub cache_rebuilds: Arc<DashMap<String, u64>>,
    /// 分布式锁获取统计
    /// key: "acquired" | "contended" | "not_owned"
    pub lock_attempts: Arc<DashMap<String, u64>>,
    /// 秒杀准入结果统计
    /// key: "admitted" | "not_started" | "ended" | "sold_out" | "duplicate"
    pub admissions: Arc<DashMap<String, u64>>,
    /// 订单落库结果统计
    /// key: "created" | "duplicate" | "out_of_stock" | "malformed" | "failed"
    pub orders_applied: Arc<DashMap<String, u64>>,
    /// 操作耗时（累积秒数与次数）
    /// key: "component:op" -> (total_duration_secs, count)
    pub operation_duration: Arc<DashMap<String, (f64, u64)>>,
}

lazy_static! {
    /// 全局指标实例
    pub static ref GLOBAL_METRICS: Metrics = Metrics::default();
}

fn bump(map: &DashMap<String, u64>, key: String) {
    *map.entry(key).or_insert(0) += 1;
}

impl Metrics {
    /// 记录缓存查询结果
    ///
    /// # 参数
    ///
    /// * `strategy` - 重建策略（pass_through/mutex/logical_expire/batch）
    /// * `outcome` - 查询结果（hit/stale/absent/cold/miss）
    pub fn record_lookup(&self, strategy: &str, outcome: &str) {
        let span = span!(Level::TRACE, "cache_lookup", strategy, outcome);
        let _enter = span.enter();
        bump(&self.cache_lookups, format!("{}:{}", strategy, outcome));
    }

    /// 按数量记录缓存查询结果（批量查询用），数量为0时不记录
    pub fn record_lookups(&self, strategy: &str, outcome: &str, n: u64) {
        if n == 0 {
            return;
        }
        *self
            .cache_lookups
            .entry(format!("{}:{}", strategy, outcome))
            .or_insert(0) += n;
    }

    /// 记录一次缓存重建
    pub fn record_rebuild(&self, strategy: &str, result: &str) {
        bump(&self.cache_rebuilds, format!("{}:{}", strategy, result));
    }

    /// 记录锁操作结果
    pub fn record_lock(&self, result: &str) {
        bump(&self.lock_attempts, result.to_string());
    }

    /// 记录准入结果
    pub fn record_admission(&self, result: &str) {
        bump(&self.admissions, result.to_string());
    }

    /// 记录订单落库结果
    pub fn record_order(&self, result: &str) {
        bump(&self.orders_applied, result.to_string());
    }

    /// 记录操作耗时
    pub fn record_duration(&self, component: &str, op: &str, duration_secs: f64) {
        let mut entry = self
            .operation_duration
            .entry(format!("{}:{}", component, op))
            .or_insert((0.0, 0));
        entry.0 += duration_secs;
        entry.1 += 1;
    }

    /// 读取计数（测试与状态展示用）
    pub fn count(map: &DashMap<String, u64>, key: &str) -> u64 {
        map.get(key).map_or(0, |v| *v)
    }
}

/// 获取指标字符串
///
/// 将所有指标格式化为 Prometheus 文本返回，用于监控系统采集
pub fn get_metrics_string() -> String {
    let metrics = &GLOBAL_METRICS;
    let mut output = String::new();

    for entry in metrics.cache_lookups.iter() {
        if let Some((strategy, outcome)) = entry.key().split_once(':') {
            output.push_str(&format!(
                "flashguard_cache_lookups_total{{strategy=\"{}\", outcome=\"{}\"}} {}\n",
                strategy,
                outcome,
                entry.value()
            ));
        }
    }
    for entry in metrics.cache_rebuilds.iter() {
        if let Some((strategy, result)) = entry.key().split_once(':') {
            output.push_str(&format!(
                "flashguard_cache_rebuilds_total{{strategy=\"{}\", result=\"{}\"}} {}\n",
                strategy,
                result,
                entry.value()
            ));
        }
    }
    for entry in metrics.lock_attempts.iter() {
        output.push_str(&format!(
            "flashguard_lock_attempts_total{{result=\"{}\"}} {}\n",
            entry.key(),
            entry.value()
        ));
    }
    for entry in metrics.admissions.iter() {
        output.push_str(&format!(
            "flashguard_admissions_total{{result=\"{}\"}} {}\n",
            entry.key(),
            entry.value()
        ));
    }
    for entry in metrics.orders_applied.iter() {
        output.push_str(&format!(
            "flashguard_orders_applied_total{{result=\"{}\"}} {}\n",
            entry.key(),
            entry.value()
        ));
    }
    for entry in metrics.operation_duration.iter() {
        if let Some((component, op)) = entry.key().split_once(':') {
            let (total, count) = *entry.value();
            output.push_str(&format!(
                "flashguard_operation_duration_seconds_sum{{component=\"{}\", operation=\"{}\"}} {}\n",
                component, op, total
            ));
            output.push_str(&format!(
                "flashguard_operation_duration_seconds_count{{component=\"{}\", operation=\"{}\"}} {}\n",
                component, op, count
            ));
        }
    }
    output
}
