//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了共享键值存储的抽象接口。
//!
//! 缓存引擎、分布式锁与秒杀链路只依赖这里的 [`KvStore`]，
//! 生产环境由 Redis 实现，测试与单机部署可使用内存实现。

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// 秒杀准入脚本涉及的键
#[derive(Debug, Clone)]
pub struct AdmissionKeys {
    /// 库存计数器
    pub stock: String,
    /// 秒杀时间窗口（hash: begin/end）
    pub sale: String,
    /// 已下单用户集合
    pub buyers: String,
    /// 订单队列
    pub stream: String,
}

/// 秒杀准入脚本的参数
#[derive(Debug, Clone)]
pub struct AdmissionArgs {
    pub user_id: i64,
    pub item_id: i64,
    /// 调用方预先生成的订单号
    pub order_id: i64,
    /// 当前时间（毫秒时间戳），与秒杀窗口比较
    pub now_millis: i64,
    /// 下单时间（RFC3339），随订单消息入队
    pub issued_at: String,
}

/// 队列中的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// 投递ID
    pub id: String,
    /// 消息字段
    pub fields: HashMap<String, String>,
}

/// 消费者组读取位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// 尚未投递给任何消费者的新消息（`>`）
    New,
    /// 已投递给本消费者但未确认的消息（从 `0` 开始）
    Pending,
}

/// 共享键值存储接口
///
/// 所有"检查并修改"的组合操作都必须在存储侧原子完成，
/// 调用方不得以读-改-写的方式拼装。
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 读取字符串值
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 批量读取字符串值，结果顺序与键一致
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// 写入字符串值并设置过期时间
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// 写入不过期的字符串值
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// 删除键，返回是否存在
    async fn delete(&self, key: &str) -> Result<bool>;

    /// 键不存在时写入并设置毫秒级过期时间（SET NX PX），返回是否写入成功
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// 仅当当前值等于 `expected` 时删除键，返回是否删除
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// 计数器自增，返回自增后的值
    async fn incr(&self, key: &str) -> Result<i64>;

    /// 写入多个hash字段
    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// 读取hash全部字段
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// 集合添加成员，返回是否新增
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// 判断集合成员
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    /// 有序集合写入成员分数
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// 读取有序集合成员分数
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// 原子执行秒杀准入：校验时间窗口、库存与重复下单，成功则扣减库存、
    /// 记录用户并把订单追加到队列。
    ///
    /// 返回码：`0` 成功，`-1` 未开始，`-2` 已结束，`1` 库存不足，`2` 重复下单
    async fn eval_admission(&self, keys: &AdmissionKeys, args: &AdmissionArgs) -> Result<i64>;

    /// 追加消息到队列，返回消息ID
    async fn stream_add(&self, stream: &str, fields: &[(&str, String)]) -> Result<String>;

    /// 创建消费者组（队列不存在时一并创建），组已存在视为成功
    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<()>;

    /// 以消费者组方式读取消息
    ///
    /// `block` 仅对 [`ReadCursor::New`] 生效；读取pending消息从不阻塞。
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>>;

    /// 确认消息，返回确认条数
    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<u64>;

    /// 检查连接是否正常
    async fn ping(&self) -> Result<()>;
}
