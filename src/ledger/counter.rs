use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{CacheClient, CacheKey};
use crate::error::Result;
use crate::types::QuotaScope;

/// 快速额度计数器
///
/// 每次调用都必须是存储端的单个原子操作，并返回更新后的值。
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr(&self, scope: QuotaScope, id: &str, delta: i64) -> Result<i64>;
}

/// Redis 哈希字段计数器，键为 `{prefix}:quota:{scope}:{id}`
pub struct RedisCounterStore {
    client: CacheClient,
}

impl RedisCounterStore {
    pub const fn new(client: CacheClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, scope: QuotaScope, id: &str, delta: i64) -> Result<i64> {
        self.client
            .hincr_by(&CacheKey::quota_counter(scope, id), CacheKey::QUOTA_FIELD, delta)
            .await
    }
}

/// 进程内计数器，用于 `memory` 缓存模式与测试
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<(QuotaScope, String), i64>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置初始额度
    pub fn seed(&self, scope: QuotaScope, id: &str, value: i64) {
        self.counters.insert((scope, id.to_string()), value);
    }

    pub fn get(&self, scope: QuotaScope, id: &str) -> Option<i64> {
        self.counters
            .get(&(scope, id.to_string()))
            .map(|entry| *entry.value())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, scope: QuotaScope, id: &str, delta: i64) -> Result<i64> {
        let mut entry = self.counters.entry((scope, id.to_string())).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }
}
