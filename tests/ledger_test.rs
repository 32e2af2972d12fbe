//! # 额度账本集成测试
//!
//! 进程内计数器 + sqlite 内存库上的持久层。

use std::sync::Arc;

use api_relay::config::LedgerConfig;
use api_relay::ledger::{LedgerEntry, MemoryCounterStore, QuotaLedger, SeaOrmQuotaStore};
use api_relay::types::QuotaScope;
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;

struct Fixture {
    counters: Arc<MemoryCounterStore>,
    durable: Arc<SeaOrmQuotaStore>,
    ledger: QuotaLedger,
}

async fn fixture() -> Fixture {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();

    let counters = Arc::new(MemoryCounterStore::new());
    let durable = Arc::new(SeaOrmQuotaStore::new(Arc::new(db)));
    let ledger = QuotaLedger::new(
        counters.clone(),
        durable.clone(),
        &LedgerConfig {
            max_attempts: 3,
            backoff_unit_ms: 1,
        },
    );

    for (scope, id, quota) in [
        (QuotaScope::User, "u1", 1000),
        (QuotaScope::App, "a1", 500),
        (QuotaScope::AppKey, "ak1", 0),
        (QuotaScope::Group, "g1", 300),
        (QuotaScope::Key, "k1", 0),
    ] {
        counters.seed(scope, id, quota);
        durable.open_account(scope, id, quota).await.unwrap();
    }

    Fixture {
        counters,
        durable,
        ledger,
    }
}

fn entry(total: i64) -> LedgerEntry {
    LedgerEntry {
        request_id: "req-ledger".to_string(),
        user_id: "u1".to_string(),
        app_id: "a1".to_string(),
        app_limited: true,
        app_key: "ak1".to_string(),
        app_key_limited: false,
        limited_group: Some("g1".to_string()),
        key_id: "k1".to_string(),
        total,
    }
}

#[tokio::test]
async fn test_record_usage_updates_every_scope() {
    let f = fixture().await;

    f.ledger.record_usage(&entry(150)).await.unwrap();

    let user = f.durable.account(QuotaScope::User, "u1").await.unwrap().unwrap();
    assert_eq!((user.quota, user.used_quota), (850, 150));
    assert_eq!(user.counter_drift(), Some(0));

    let app = f.durable.account(QuotaScope::App, "a1").await.unwrap().unwrap();
    assert_eq!((app.quota, app.used_quota), (350, 150));

    // 不封顶的应用密钥与上游凭证只累加已用额度
    let app_key = f.durable.account(QuotaScope::AppKey, "ak1").await.unwrap().unwrap();
    assert_eq!((app_key.quota, app_key.used_quota), (0, 150));
    assert_eq!(app_key.counter_snapshot, None);
    let key = f.durable.account(QuotaScope::Key, "k1").await.unwrap().unwrap();
    assert_eq!((key.quota, key.used_quota), (0, 150));

    let group = f.durable.account(QuotaScope::Group, "g1").await.unwrap().unwrap();
    assert_eq!((group.quota, group.used_quota), (150, 150));

    assert_eq!(f.counters.get(QuotaScope::User, "u1"), Some(850));
    assert_eq!(f.counters.get(QuotaScope::AppKey, "ak1"), Some(0));
}

#[tokio::test]
async fn test_zero_total_leaves_stores_untouched() {
    let f = fixture().await;

    f.ledger.record_usage(&entry(0)).await.unwrap();

    let user = f.durable.account(QuotaScope::User, "u1").await.unwrap().unwrap();
    assert_eq!((user.quota, user.used_quota), (1000, 0));
    assert_eq!(f.counters.get(QuotaScope::User, "u1"), Some(1000));
}

#[tokio::test]
async fn test_counter_drift_is_recorded_not_corrected() {
    let f = fixture().await;
    // 计数器被外部改动过
    f.counters.seed(QuotaScope::User, "u1", 900);

    f.ledger.record_usage(&entry(100)).await.unwrap();

    let user = f.durable.account(QuotaScope::User, "u1").await.unwrap().unwrap();
    assert_eq!(user.quota, 900);
    assert_eq!(user.counter_snapshot, Some(800));
    assert_eq!(user.counter_drift(), Some(100));
}

#[tokio::test]
async fn test_concurrent_usage_is_fully_accounted() {
    let f = Arc::new(fixture().await);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            f.ledger.record_usage(&entry(10)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let user = f.durable.account(QuotaScope::User, "u1").await.unwrap().unwrap();
    assert_eq!((user.quota, user.used_quota), (800, 200));
    assert_eq!(f.counters.get(QuotaScope::User, "u1"), Some(800));
}
