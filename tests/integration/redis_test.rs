//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! Redis集成测试
//!
//! 需要可用的Redis实例（`REDIS_URL`，默认本地6379），不可用时跳过。

#[path = "../common/mod.rs"]
mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{
    fast_cache_config, is_redis_available, redis_config, setup_logging, unique_namespace,
};
use flashguard::backend::{AdmissionArgs, KvStore, ReadCursor, RedisStore};
use flashguard::client::{CacheClient, KeySpace};
use flashguard::lock::DistributedLock;
use flashguard::seckill::{
    AdmissionExecutor, AdmissionOutcome, IdWorker, OrderTicket, RejectReason, SeckillKeys,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

async fn redis_store() -> Option<Arc<RedisStore>> {
    setup_logging();
    if !is_redis_available().await {
        println!("跳过测试: Redis不可用");
        return None;
    }
    Some(Arc::new(
        RedisStore::new(&redis_config())
            .await
            .expect("Failed to connect to Redis"),
    ))
}

#[tokio::test]
#[serial]
async fn test_redis_lock_compare_and_delete() {
    let Some(store) = redis_store().await else {
        return;
    };
    let key = format!("{}:lock:order:1", unique_namespace("redis"));
    let lock = DistributedLock::new(store.clone());

    let first = lock
        .try_acquire(&key, Duration::from_millis(100))
        .await
        .unwrap()
        .expect("lock should be free");
    assert!(lock
        .try_acquire(&key, Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = lock
        .try_acquire(&key, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("expired lock should be reclaimable");

    assert!(lock.release(&first).await.is_err());
    assert_eq!(
        store.get(&key).await.unwrap().as_deref(),
        Some(second.owner())
    );
    lock.release(&second).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_redis_pass_through_tombstone() {
    let Some(store) = redis_store().await else {
        return;
    };
    let ns = unique_namespace("redis");
    let space = KeySpace::new(format!("{}:cache:shop:", ns), format!("{}:lock:shop:", ns));
    let client = CacheClient::new(store.clone(), fast_cache_config());

    let found: Option<String> = client
        .query_pass_through(&space, 1_i64, |_| async move { Ok(None) }, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(store.get(&space.key(&1)).await.unwrap().as_deref(), Some(""));

    store.delete(&space.key(&1)).await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_redis_admission_script() {
    let Some(store) = redis_store().await else {
        return;
    };
    let ns = unique_namespace("redis");
    let keys = SeckillKeys::new(&ns, format!("{}:stream.orders", ns));
    let now = Utc::now();

    store.set(&keys.stock(1), "1").await.unwrap();
    store
        .hset_multiple(
            &keys.sale(1),
            &[
                (
                    "begin",
                    (now - ChronoDuration::minutes(1)).timestamp_millis().to_string(),
                ),
                (
                    "end",
                    (now + ChronoDuration::hours(1)).timestamp_millis().to_string(),
                ),
            ],
        )
        .await
        .unwrap();

    let ids = Arc::new(IdWorker::new(store.clone(), &ns));
    let executor = AdmissionExecutor::new(store.clone(), ids, keys.clone(), "order");

    let AdmissionOutcome::Admitted(ticket) = executor.admit(1, 10).await.unwrap() else {
        panic!("first buyer should be admitted");
    };
    assert_eq!(
        executor.admit(1, 10).await.unwrap(),
        AdmissionOutcome::Rejected(RejectReason::SoldOut)
    );
    assert_eq!(store.get(&keys.stock(1)).await.unwrap().as_deref(), Some("0"));

    // 窗口外的请求
    let late = AdmissionArgs {
        user_id: 11,
        item_id: 1,
        order_id: 1,
        now_millis: (now + ChronoDuration::hours(2)).timestamp_millis(),
        issued_at: now.to_rfc3339(),
    };
    assert_eq!(store.eval_admission(&keys.admission(1), &late).await.unwrap(), -2);

    store.stream_group_create(keys.stream(), "g1").await.unwrap();
    store.stream_group_create(keys.stream(), "g1").await.unwrap();
    let records = store
        .stream_read_group(keys.stream(), "g1", "c1", ReadCursor::New, 10, None)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(OrderTicket::from_record(&records[0]).unwrap(), ticket);

    let pending = store
        .stream_read_group(keys.stream(), "g1", "c1", ReadCursor::Pending, 10, None)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        store
            .stream_ack(keys.stream(), "g1", &records[0].id)
            .await
            .unwrap(),
        1
    );

    for key in [keys.stock(1), keys.sale(1), keys.buyers(1), keys.stream().to_string()] {
        store.delete(&key).await.unwrap();
    }
}

#[tokio::test]
#[serial]
async fn test_redis_hash_set_and_sorted_set() {
    let Some(store) = redis_store().await else {
        return;
    };
    let ns = unique_namespace("redis");
    let (hash, set, zset) = (
        format!("{}:hash", ns),
        format!("{}:set", ns),
        format!("{}:zset", ns),
    );

    assert!(store.hgetall(&hash).await.unwrap().is_empty());
    store
        .hset_multiple(&hash, &[("begin", "1".to_string()), ("end", "2".to_string())])
        .await
        .unwrap();
    let fields = store.hgetall(&hash).await.unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields["end"], "2");

    assert!(store.sadd(&set, "u1").await.unwrap());
    assert!(!store.sadd(&set, "u1").await.unwrap());
    assert!(store.sismember(&set, "u1").await.unwrap());

    assert_eq!(store.zscore(&zset, "a").await.unwrap(), None);
    store.zadd(&zset, "a", 1.5).await.unwrap();
    store.zadd(&zset, "a", 2.5).await.unwrap();
    assert_eq!(store.zscore(&zset, "a").await.unwrap(), Some(2.5));

    // 类型不符的操作返回错误
    assert!(store.hgetall(&set).await.is_err());
    assert!(store.zadd(&hash, "a", 1.0).await.is_err());

    // 非数字库存：脚本报错，不修改任何状态
    let keys = SeckillKeys::new(&ns, format!("{}:stream.orders", ns));
    store.set(&keys.stock(2), "abc").await.unwrap();
    let args = AdmissionArgs {
        user_id: 1,
        item_id: 2,
        order_id: 1,
        now_millis: Utc::now().timestamp_millis(),
        issued_at: Utc::now().to_rfc3339(),
    };
    assert!(store.eval_admission(&keys.admission(2), &args).await.is_err());
    assert!(!store.sismember(&keys.buyers(2), "1").await.unwrap());

    for key in [hash, set, zset, keys.stock(2)] {
        store.delete(&key).await.unwrap();
    }
}
