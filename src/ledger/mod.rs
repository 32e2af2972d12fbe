//! # 额度账本
//!
//! 把一次请求的计费总额依次记到用户、应用、应用密钥、分组与上游凭证上。
//! 需要封顶的账户先走快速计数器的原子扣减，再把观察到的计数写入持久层；
//! 不封顶的账户只累加持久层的已用额度。每一步单独重试，线性退避。

mod counter;
mod durable;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use counter::{CounterStore, MemoryCounterStore, RedisCounterStore};
pub use durable::{DurableQuotaStore, SeaOrmQuotaStore};

use crate::billing::Spend;
use crate::config::LedgerConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::resolver::DispatchPlan;
use crate::types::QuotaScope;
use crate::{ldebug, lerror, linfo, lwarn};

/// 一次记账所需的全部信息
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub request_id: String,
    pub user_id: String,
    pub app_id: String,
    pub app_limited: bool,
    pub app_key: String,
    pub app_key_limited: bool,
    /// 有额度上限的分组
    pub limited_group: Option<String>,
    pub key_id: String,
    pub total: i64,
}

impl LedgerEntry {
    pub fn from_plan(request_id: &str, plan: &DispatchPlan, spend: &Spend) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: plan.user.id.clone(),
            app_id: plan.app.id.clone(),
            app_limited: plan.app.is_limit_quota,
            app_key: plan.app_key.key.clone(),
            app_key_limited: plan.app_key.is_limit_quota,
            limited_group: plan
                .group
                .as_ref()
                .filter(|group| group.is_limit_quota)
                .map(|group| group.id.clone()),
            key_id: plan.key().id.clone(),
            total: spend.total_spend_tokens,
        }
    }
}

pub struct QuotaLedger {
    counters: Arc<dyn CounterStore>,
    durable: Arc<dyn DurableQuotaStore>,
    max_attempts: u32,
    backoff_unit: Duration,
}

impl QuotaLedger {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        durable: Arc<dyn DurableQuotaStore>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            counters,
            durable,
            max_attempts: config.max_attempts.max(1),
            backoff_unit: Duration::from_millis(config.backoff_unit_ms),
        }
    }

    /// 记账；总额为 0 时不触碰任何存储
    pub async fn record_usage(&self, entry: &LedgerEntry) -> Result<()> {
        let rid = entry.request_id.as_str();
        if entry.total == 0 {
            ldebug!(rid, LogStage::Ledger, LogComponent::Ledger, "skip_zero", "费用为 0，跳过记账");
            return Ok(());
        }

        self.spend(rid, QuotaScope::User, &entry.user_id, entry.total).await?;

        if entry.app_limited {
            self.spend(rid, QuotaScope::App, &entry.app_id, entry.total).await?;
        } else {
            self.used(rid, QuotaScope::App, &entry.app_id, entry.total).await?;
        }

        if entry.app_key_limited {
            self.spend(rid, QuotaScope::AppKey, &entry.app_key, entry.total).await?;
        } else {
            self.used(rid, QuotaScope::AppKey, &entry.app_key, entry.total).await?;
        }

        if let Some(group_id) = &entry.limited_group {
            self.spend(rid, QuotaScope::Group, group_id, entry.total).await?;
        }

        self.used(rid, QuotaScope::Key, &entry.key_id, entry.total).await?;

        linfo!(
            rid,
            LogStage::Ledger,
            LogComponent::Ledger,
            "record_usage",
            "记账完成",
            user_id = %entry.user_id,
            total = entry.total,
        );
        Ok(())
    }

    async fn spend(&self, rid: &str, scope: QuotaScope, id: &str, total: i64) -> Result<()> {
        let observed = self
            .with_retry(rid, "counter_decr", scope, id, || {
                self.counters.incr(scope, id, -total)
            })
            .await?;
        self.with_retry(rid, "spend_quota", scope, id, || {
            self.durable.spend_quota(scope, id, total, Some(observed))
        })
        .await
    }

    async fn used(&self, rid: &str, scope: QuotaScope, id: &str, total: i64) -> Result<()> {
        self.with_retry(rid, "used_quota", scope, id, || {
            self.durable.used_quota(scope, id, total)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        rid: &str,
        operation: &str,
        scope: QuotaScope,
        id: &str,
        mut step: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match step().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    lwarn!(
                        rid,
                        LogStage::Ledger,
                        LogComponent::Ledger,
                        operation,
                        "记账步骤失败，准备重试",
                        scope = %scope,
                        account_id = id,
                        attempt = attempt,
                        error = %e,
                    );
                    tokio::time::sleep(self.backoff_unit * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    lerror!(
                        rid,
                        LogStage::Ledger,
                        LogComponent::Ledger,
                        operation,
                        "记账步骤重试耗尽",
                        scope = %scope,
                        account_id = id,
                        attempts = attempt,
                        error = %e,
                    );
                    return Err(ProxyError::ledger_with_source(
                        format!("{operation} 在 {scope}:{id} 上重试 {attempt} 次后仍失败"),
                        e,
                    ));
                }
            }
        }
    }
}
