//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 缓存查询策略集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{fast_cache_config, setup_logging, unique_namespace, wait_until};
use flashguard::backend::{KvStore, MemoryStore};
use flashguard::client::{CacheClient, CacheStrategy, KeySpace, Lookup, TOMBSTONE};
use flashguard::error::{CacheError, Result};
use flashguard::lock::DistributedLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shop {
    id: i64,
    name: String,
}

fn shop(id: i64, name: &str) -> Shop {
    Shop {
        id,
        name: name.to_string(),
    }
}

fn shop_space() -> KeySpace {
    let ns = unique_namespace("shop");
    KeySpace::new(format!("{}:cache:shop:", ns), format!("{}:lock:shop:", ns))
}

const TTL: Duration = Duration::from_secs(1800);

async fn must_not_load(id: i64) -> Result<Option<Shop>> {
    panic!("loader must not be called for id {}", id)
}

async fn must_not_batch(ids: Vec<i64>) -> Result<HashMap<i64, Shop>> {
    panic!("batch loader must not be called for {:?}", ids)
}

#[tokio::test]
async fn test_pass_through_caches_missing_rows_as_tombstone() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store.clone(), fast_cache_config());
    let space = shop_space();
    let loads = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let loads = loads.clone();
        let found: Option<Shop> = client
            .query_pass_through(
                &space,
                404_i64,
                move |_| async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                },
                TTL,
            )
            .await
            .unwrap();
        assert!(found.is_none());
    }

    // 只有第一次查询访问数据源
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    let key = space.key(&404);
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(TOMBSTONE));
    let ttl = store.ttl(&key).await.expect("tombstone must expire");
    assert!(ttl <= Duration::from_secs(60));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pass_through_hit_skips_loader() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store, fast_cache_config());
    let space = shop_space();

    let first: Option<Shop> = client
        .query_pass_through(&space, 1_i64, |id| async move { Ok(Some(shop(id, "茶餐厅"))) }, TTL)
        .await
        .unwrap();
    assert_eq!(first, Some(shop(1, "茶餐厅")));

    let second: Option<Shop> = client
        .query_pass_through(
            &space,
            1_i64,
            must_not_load,
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(second, first);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mutex_rebuild_loads_once_under_concurrency() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store, fast_cache_config());
    let space = shop_space();
    let loads = Arc::new(AtomicU32::new(0));

    let readers = 16;
    let barrier = Arc::new(Barrier::new(readers));
    let mut handles = Vec::with_capacity(readers);
    for _ in 0..readers {
        let client = client.clone();
        let space = space.clone();
        let loads = loads.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            client
                .query_mutex(
                    &space,
                    7_i64,
                    move |id| async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Some(shop(id, "热点店铺")))
                    },
                    TTL,
                )
                .await
        }));
    }

    for handle in handles {
        let found: Option<Shop> = handle.await.unwrap().unwrap();
        assert_eq!(found, Some(shop(7, "热点店铺")));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mutex_waiter_times_out_when_rebuild_never_lands() {
    let store = Arc::new(MemoryStore::new());
    let mut config = fast_cache_config();
    config.mutex_max_retries = 3;
    let client = CacheClient::new(store.clone(), config);
    let space = shop_space();

    // 另一个实例持有重建锁但一直没有写回缓存
    let lock = DistributedLock::new(store.clone());
    let held = lock
        .try_acquire(&space.lock_key(&9), Duration::from_secs(10))
        .await
        .unwrap()
        .expect("lock should be free");

    let result: Result<Option<Shop>> = client
        .query_mutex(
            &space,
            9_i64,
            must_not_load,
            TTL,
        )
        .await;
    match result {
        Err(CacheError::CacheRebuildTimeout { key, attempts }) => {
            assert_eq!(key, space.key(&9));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected rebuild timeout, got {:?}", other),
    }

    lock.release(&held).await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mutex_releases_lock_when_loader_fails() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store.clone(), fast_cache_config());
    let space = shop_space();

    let result: Result<Option<Shop>> = client
        .query_mutex(
            &space,
            3_i64,
            |_| async move { Err(CacheError::StoreUnavailable("db down".into())) },
            TTL,
        )
        .await;
    assert!(matches!(result, Err(CacheError::StoreUnavailable(_))));
    assert!(store.get(&space.lock_key(&3)).await.unwrap().is_none());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logical_expire_cold_key_never_loads() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store, fast_cache_config());
    let space = shop_space();

    let lookup: Lookup<Shop> = client
        .query_logical_expire(
            &space,
            11_i64,
            must_not_load,
            TTL,
        )
        .await
        .unwrap();
    assert!(lookup.is_cold());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logical_expire_serves_stale_and_refreshes_once() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store, fast_cache_config());
    let space = shop_space();
    let key = space.key(&5);

    client
        .set_with_logical_expire(&key, &shop(5, "旧名字"), Duration::ZERO)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let loads = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        let space = space.clone();
        let loads = loads.clone();
        handles.push(tokio::spawn(async move {
            client
                .query_logical_expire(
                    &space,
                    5_i64,
                    move |id| async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some(shop(id, "新名字")))
                    },
                    TTL,
                )
                .await
        }));
    }

    for handle in handles {
        let lookup: Lookup<Shop> = handle.await.unwrap().unwrap();
        match lookup {
            Lookup::Stale(value) => assert_eq!(value, shop(5, "旧名字")),
            Lookup::Hit(value) => assert_eq!(value, shop(5, "新名字")),
            other => panic!("unexpected lookup {:?}", other),
        }
    }

    let refreshed = wait_until(Duration::from_secs(2), || {
        let client = client.clone();
        let space = space.clone();
        async move {
            let lookup: Lookup<Shop> = client
                .query_logical_expire(&space, 5_i64, |_| async move { Ok(None) }, TTL)
                .await
                .unwrap();
            lookup == Lookup::Hit(shop(5, "新名字"))
        }
    })
    .await;
    assert!(refreshed, "entry should be refreshed in the background");
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logical_expire_refresh_to_absent() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store.clone(), fast_cache_config());
    let space = shop_space();

    client
        .set_with_logical_expire(&space.key(&6), &shop(6, "已下架"), Duration::ZERO)
        .await
        .unwrap();

    let first: Lookup<Shop> = client
        .query_logical_expire(&space, 6_i64, |_| async move { Ok(None) }, TTL)
        .await
        .unwrap();
    assert!(first.is_stale());

    // 关闭工作池会等待已排队的刷新完成
    client.shutdown().await.unwrap();

    let reader = CacheClient::new(store, fast_cache_config());
    let second: Lookup<Shop> = reader
        .query_logical_expire(&space, 6_i64, |_| async move { Ok(None) }, TTL)
        .await
        .unwrap();
    assert_eq!(second, Lookup::Absent);
    reader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_query_dispatches_by_strategy() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store, fast_cache_config());
    let space = shop_space();

    for strategy in [CacheStrategy::PassThrough, CacheStrategy::Mutex] {
        let lookup: Lookup<Shop> = client
            .query(
                strategy,
                &space,
                21_i64,
                |id| async move { Ok(Some(shop(id, "分店"))) },
                TTL,
            )
            .await
            .unwrap();
        assert_eq!(lookup.into_value(), Some(shop(21, "分店")));
    }

    let lookup: Lookup<Shop> = client
        .query(
            CacheStrategy::LogicalExpire,
            &space,
            22_i64,
            |id| async move { Ok(Some(shop(id, "分店"))) },
            TTL,
        )
        .await
        .unwrap();
    assert!(lookup.is_cold());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batch_query_loads_only_misses() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store.clone(), fast_cache_config());
    let space = shop_space();

    client
        .set(&space.key(&1), &shop(1, "已缓存"), TTL)
        .await
        .unwrap();

    let requested = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = requested.clone();
    let found: HashMap<i64, Shop> = client
        .batch_query(
            &space,
            vec![1, 2, 3],
            move |ids: Vec<i64>| async move {
                seen.lock().unwrap().extend(ids.iter().copied());
                Ok(HashMap::from([(2, shop(2, "新加载"))]))
            },
            TTL,
        )
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found[&1], shop(1, "已缓存"));
    assert_eq!(found[&2], shop(2, "新加载"));
    assert_eq!(*requested.lock().unwrap(), vec![2, 3]);

    // 数据源未返回的ID写入墓碑
    assert_eq!(
        store.get(&space.key(&3)).await.unwrap().as_deref(),
        Some(TOMBSTONE)
    );
    let ttl = store.ttl(&space.key(&2)).await.unwrap();
    assert!(ttl >= Duration::from_secs(1400) && ttl <= Duration::from_secs(2160));

    let again: HashMap<i64, Shop> = client
        .batch_query(
            &space,
            vec![1, 2, 3],
            must_not_batch,
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(again, found);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batch_query_with_duplicate_ids_keeps_loaded_value() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store.clone(), fast_cache_config());
    let space = shop_space();

    let requested = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = requested.clone();
    let found: HashMap<i64, Shop> = client
        .batch_query(
            &space,
            vec![2, 2, 4, 4],
            move |ids: Vec<i64>| async move {
                seen.lock().unwrap().extend(ids.iter().copied());
                Ok(HashMap::from([(2, shop(2, "真实数据"))]))
            },
            TTL,
        )
        .await
        .unwrap();

    assert_eq!(*requested.lock().unwrap(), vec![2, 4]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[&2], shop(2, "真实数据"));

    // 已加载的值不能被墓碑覆盖
    let cached = store.get(&space.key(&2)).await.unwrap();
    assert!(cached.is_some_and(|raw| raw != TOMBSTONE));
    assert_eq!(
        store.get(&space.key(&4)).await.unwrap().as_deref(),
        Some(TOMBSTONE)
    );

    let again: HashMap<i64, Shop> = client
        .batch_query(&space, vec![2, 4, 2], must_not_batch, TTL)
        .await
        .unwrap();
    assert_eq!(again, found);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_warm_up_reports_per_id_outcome() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store, fast_cache_config());
    let space = shop_space();

    let report = client
        .warm_up(
            &space,
            vec![1_i64, 2, 3, 4, 5],
            |id: i64| async move {
                match id {
                    2 => Ok(None),
                    4 => Err(CacheError::StoreUnavailable("db down".into())),
                    _ => Ok(Some(shop(id, "预热"))),
                }
            },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(report.loaded, 3);
    assert_eq!(report.missing, 1);
    assert_eq!(report.failed, 1);

    for id in [1_i64, 3, 5] {
        let lookup: Lookup<Shop> = client
            .query_logical_expire(&space, id, |_| async move { Ok(None) }, TTL)
            .await
            .unwrap();
        assert_eq!(lookup, Lookup::Hit(shop(id, "预热")));
    }
    let cold: Lookup<Shop> = client
        .query_logical_expire(&space, 2_i64, |_| async move { Ok(None) }, TTL)
        .await
        .unwrap();
    assert!(cold.is_cold());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalidate_forces_reload() {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::new(store, fast_cache_config());
    let space = shop_space();
    let loads = Arc::new(AtomicU32::new(0));

    for round in 0..2 {
        let loads = loads.clone();
        let _: Option<Shop> = client
            .query_pass_through(
                &space,
                8_i64,
                move |id| async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(shop(id, "会更新")))
                },
                TTL,
            )
            .await
            .unwrap();
        if round == 0 {
            assert!(client.invalidate(&space.key(&8)).await.unwrap());
        }
    }
    assert_eq!(loads.load(Ordering::SeqCst), 2);

    client.shutdown().await.unwrap();
}
