//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 订单消费者集成测试：准入、入队、落库与故障恢复

#[path = "../common/mod.rs"]
mod common;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{memory_repository, setup_logging, unique_namespace, wait_until};
use flashguard::backend::{KvStore, MemoryStore, ReadCursor};
use flashguard::config::Config;
use flashguard::database::{ApplyOutcome, OrderApplier, OrderRepository};
use flashguard::error::{CacheError, Result};
use flashguard::lock::DistributedLock;
use flashguard::metrics::{Metrics, GLOBAL_METRICS};
use flashguard::seckill::{
    AdmissionOutcome, IdWorker, OrderConsumer, OrderTicket, Sale, SeckillKeys, SeckillService,
};
use mockall::mock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mock! {
    pub Applier {}

    #[async_trait]
    impl OrderApplier for Applier {
        async fn has_order(&self, user_id: i64, item_id: i64) -> Result<bool>;
        async fn apply_ticket(&self, ticket: &OrderTicket) -> Result<ApplyOutcome>;
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.global.key_namespace = unique_namespace("orders");
    config.seckill.stream = format!("{}:stream.orders", config.global.key_namespace);
    config.seckill.consumer = "c1".to_string();
    config.seckill.block_ms = 50;
    config.seckill.recovery_backoff_ms = 20;
    config
}

struct Fixture {
    config: Config,
    store: Arc<MemoryStore>,
    repository: OrderRepository,
    service: SeckillService,
}

async fn fixture() -> Fixture {
    setup_logging();
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let repository = memory_repository().await;
    let ids = Arc::new(IdWorker::new(store.clone(), &config.global.key_namespace));
    let service = SeckillService::new(store.clone(), repository.clone(), ids, &config);
    Fixture {
        config,
        store,
        repository,
        service,
    }
}

impl Fixture {
    fn keys(&self) -> SeckillKeys {
        SeckillKeys::from_config(&self.config)
    }

    fn consumer(&self, applier: Arc<dyn OrderApplier>) -> OrderConsumer {
        OrderConsumer::new(
            self.store.clone(),
            applier,
            self.keys(),
            self.config.seckill.clone(),
        )
    }

    async fn publish(&self, item_id: i64, stock: i32) {
        let now = Utc::now();
        self.service
            .publish_sale(&Sale {
                item_id,
                stock,
                begin: now - ChronoDuration::minutes(1),
                end: now + ChronoDuration::hours(1),
            })
            .await
            .unwrap();
    }

    async fn order_count(&self, item_id: i64) -> usize {
        self.repository.orders_for_item(item_id).await.unwrap().len()
    }

    async fn db_stock(&self, item_id: i64) -> i32 {
        self.repository
            .find_voucher(item_id)
            .await
            .unwrap()
            .unwrap()
            .stock
    }

    async fn pending(&self) -> usize {
        self.store
            .pending_len(&self.config.seckill.stream, &self.config.seckill.group)
            .await
    }
}

#[tokio::test]
async fn test_admitted_orders_are_persisted() {
    let f = fixture().await;
    f.publish(100, 5).await;

    for user_id in 1..=3 {
        let outcome = f.service.admit(100, user_id).await.unwrap();
        assert!(matches!(outcome, AdmissionOutcome::Admitted(_)));
    }

    let cancel = CancellationToken::new();
    let handle = f
        .consumer(Arc::new(f.repository.clone()))
        .spawn(cancel.clone());

    let persisted = wait_until(Duration::from_secs(5), || async {
        f.order_count(100).await == 3
    })
    .await;
    assert!(persisted, "all admitted orders should reach the database");
    assert!(wait_until(Duration::from_secs(2), || async { f.pending().await == 0 }).await);

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(f.db_stock(100).await, 2);
    for user_id in 1..=3 {
        assert!(f.service.has_order(user_id, 100).await.unwrap());
    }
}

#[tokio::test]
async fn test_crash_before_ack_is_recovered_on_restart() {
    let f = fixture().await;
    f.publish(200, 5).await;

    let outcome = f.service.admit(200, 42).await.unwrap();
    let order_id = outcome.order_id().expect("admitted");

    // 第一个进程读取了消息但在确认前崩溃
    let stream = &f.config.seckill.stream;
    let group = &f.config.seckill.group;
    f.store.stream_group_create(stream, group).await.unwrap();
    let delivered = f
        .store
        .stream_read_group(stream, group, "c1", ReadCursor::New, 10, None)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(f.pending().await, 1);

    // 以同一消费者名重启
    let restarted = f.consumer(Arc::new(f.repository.clone()));
    let recovered = restarted.drain_pending(&CancellationToken::new()).await;
    assert_eq!(recovered, 1);

    assert_eq!(f.pending().await, 0);
    let orders = f.repository.orders_for_item(200).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);
    assert_eq!(orders[0].user_id, 42);
    assert_eq!(f.db_stock(200).await, 4);
}

#[tokio::test]
async fn test_crash_after_commit_before_ack_is_not_applied_twice() {
    let f = fixture().await;
    f.publish(250, 5).await;

    let AdmissionOutcome::Admitted(ticket) = f.service.admit(250, 43).await.unwrap() else {
        panic!("expected admission");
    };

    // 第一个进程读取消息并提交了事务，但在确认前崩溃
    let stream = &f.config.seckill.stream;
    let group = &f.config.seckill.group;
    f.store.stream_group_create(stream, group).await.unwrap();
    let delivered = f
        .store
        .stream_read_group(stream, group, "c1", ReadCursor::New, 10, None)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        f.repository.apply_ticket(&ticket).await.unwrap(),
        ApplyOutcome::Created
    );
    assert_eq!(f.pending().await, 1);

    let restarted = f.consumer(Arc::new(f.repository.clone()));
    assert_eq!(
        restarted.handle_ticket(&ticket).await.unwrap(),
        ApplyOutcome::Duplicate
    );
    let recovered = restarted.drain_pending(&CancellationToken::new()).await;
    assert_eq!(recovered, 1);

    assert_eq!(f.pending().await, 0);
    assert_eq!(f.order_count(250).await, 1);
    assert_eq!(f.db_stock(250).await, 4);
}

#[tokio::test]
async fn test_duplicate_delivery_applies_once() {
    let f = fixture().await;
    f.publish(300, 5).await;

    let AdmissionOutcome::Admitted(ticket) = f.service.admit(300, 7).await.unwrap() else {
        panic!("expected admission");
    };

    let consumer = f.consumer(Arc::new(f.repository.clone()));
    assert_eq!(
        consumer.handle_ticket(&ticket).await.unwrap(),
        ApplyOutcome::Created
    );
    assert_eq!(
        consumer.handle_ticket(&ticket).await.unwrap(),
        ApplyOutcome::Duplicate
    );

    // 同一用户的另一张订单也只会落库一次
    let replay = OrderTicket {
        order_id: ticket.order_id + 1,
        ..ticket.clone()
    };
    assert_eq!(
        f.repository.apply_ticket(&replay).await.unwrap(),
        ApplyOutcome::Duplicate
    );

    assert_eq!(f.order_count(300).await, 1);
    assert_eq!(f.db_stock(300).await, 4);
}

#[tokio::test]
async fn test_database_stock_guards_against_oversell() {
    let f = fixture().await;
    f.publish(400, 1).await;

    let first = OrderTicket {
        order_id: 1,
        user_id: 1,
        item_id: 400,
        issued_at: Utc::now(),
    };
    let second = OrderTicket {
        order_id: 2,
        user_id: 2,
        ..first.clone()
    };

    assert_eq!(
        f.repository.apply_ticket(&first).await.unwrap(),
        ApplyOutcome::Created
    );
    assert_eq!(
        f.repository.apply_ticket(&second).await.unwrap(),
        ApplyOutcome::OutOfStock
    );
    assert_eq!(f.db_stock(400).await, 0);
    assert_eq!(f.order_count(400).await, 1);
}

#[tokio::test]
async fn test_failed_apply_stays_pending_and_is_retried() {
    let f = fixture().await;
    f.publish(500, 5).await;
    f.service.admit(500, 9).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let mut applier = MockApplier::new();
    applier.expect_has_order().returning(|_, _| Ok(false));
    let counter = attempts.clone();
    applier.expect_apply_ticket().returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(CacheError::StoreUnavailable("database restarting".into()))
        } else {
            Ok(ApplyOutcome::Created)
        }
    });

    let cancel = CancellationToken::new();
    let handle = f.consumer(Arc::new(applier)).spawn(cancel.clone());

    let retried = wait_until(Duration::from_secs(5), || async {
        attempts.load(Ordering::SeqCst) >= 2 && f.pending().await == 0
    })
    .await;
    assert!(retried, "failed message should be replayed from the pending list");

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_malformed_message_is_acknowledged() {
    let f = fixture().await;
    let stream = f.config.seckill.stream.clone();
    f.store
        .stream_add(
            &stream,
            &[("orderId", "not-a-number".to_string()), ("userId", "1".to_string())],
        )
        .await
        .unwrap();

    let mut applier = MockApplier::new();
    applier.expect_has_order().never();
    applier.expect_apply_ticket().never();

    let cancel = CancellationToken::new();
    let handle = f.consumer(Arc::new(applier)).spawn(cancel.clone());

    // 消息已投递且被确认
    let acked = wait_until(Duration::from_secs(5), || async {
        Metrics::count(&GLOBAL_METRICS.orders_applied, "malformed") > 0
            && f.pending().await == 0
    })
    .await;
    assert!(acked);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_contended_user_lock_leaves_ticket_pending() {
    let f = fixture().await;
    f.publish(600, 5).await;
    let AdmissionOutcome::Admitted(ticket) = f.service.admit(600, 11).await.unwrap() else {
        panic!("expected admission");
    };

    let lock = DistributedLock::new(f.store.clone());
    let held = lock
        .try_acquire(&f.keys().order_lock(11), Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    let consumer = f.consumer(Arc::new(f.repository.clone()));
    let result = consumer.handle_ticket(&ticket).await;
    assert!(matches!(result, Err(CacheError::LockContended(_))));
    assert_eq!(f.order_count(600).await, 0);

    lock.release(&held).await.unwrap();
    assert_eq!(
        consumer.handle_ticket(&ticket).await.unwrap(),
        ApplyOutcome::Created
    );
}

#[tokio::test]
async fn test_panicking_applier_releases_user_lock() {
    let f = fixture().await;
    f.publish(650, 5).await;
    let AdmissionOutcome::Admitted(ticket) = f.service.admit(650, 12).await.unwrap() else {
        panic!("expected admission");
    };

    let mut applier = MockApplier::new();
    applier.expect_has_order().returning(|_, _| Ok(false));
    applier
        .expect_apply_ticket()
        .returning(|_| panic!("applier blew up"));

    let consumer = f.consumer(Arc::new(applier));
    let joined = tokio::spawn(async move { consumer.handle_ticket(&ticket).await }).await;
    assert!(joined.unwrap_err().is_panic());

    // 锁在 panic 时也已释放
    assert!(f
        .store
        .get(&f.keys().order_lock(12))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_publish_sale_rejects_inverted_window() {
    let f = fixture().await;
    let now = Utc::now();
    let result = f
        .service
        .publish_sale(&Sale {
            item_id: 700,
            stock: 1,
            begin: now,
            end: now - ChronoDuration::hours(1),
        })
        .await;
    assert!(matches!(result, Err(CacheError::ConfigError(_))));
    assert!(f.repository.find_voucher(700).await.unwrap().is_none());
}
