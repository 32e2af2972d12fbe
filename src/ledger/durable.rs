use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use entity::{QuotaAccounts, quota_accounts};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::types::QuotaScope;
use crate::{ldebug, lwarn};

/// 持久额度存储
///
/// 两个操作都是累加式更新，重复执行会重复记账，调用方负责只在失败时重试。
#[async_trait]
pub trait DurableQuotaStore: Send + Sync {
    /// 扣减剩余额度并累加已用额度，同时记录本次观察到的计数器值
    async fn spend_quota(
        &self,
        scope: QuotaScope,
        id: &str,
        delta: i64,
        observed: Option<i64>,
    ) -> Result<()>;

    /// 只累加已用额度
    async fn used_quota(&self, scope: QuotaScope, id: &str, delta: i64) -> Result<()>;
}

/// 基于 `quota_accounts` 表的持久存储
pub struct SeaOrmQuotaStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmQuotaStore {
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 开户或重置剩余额度
    pub async fn open_account(&self, scope: QuotaScope, id: &str, quota: i64) -> Result<()> {
        let now = Utc::now().naive_utc();
        match self.account(scope, id).await? {
            Some(existing) => {
                let mut active: quota_accounts::ActiveModel = existing.into();
                active.quota = Set(quota);
                active.updated_at = Set(now);
                active.update(&*self.db).await?;
            }
            None => {
                quota_accounts::ActiveModel {
                    scope: Set(scope.as_str().to_string()),
                    account_id: Set(id.to_string()),
                    quota: Set(quota),
                    used_quota: Set(0),
                    counter_snapshot: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&*self.db)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn account(
        &self,
        scope: QuotaScope,
        id: &str,
    ) -> Result<Option<quota_accounts::Model>> {
        Ok(QuotaAccounts::find()
            .filter(quota_accounts::Column::Scope.eq(scope.as_str()))
            .filter(quota_accounts::Column::AccountId.eq(id))
            .one(&*self.db)
            .await?)
    }

    /// 账户不存在时以负余额开户，保证扣减不丢失
    async fn insert_spent(
        &self,
        scope: QuotaScope,
        id: &str,
        quota: i64,
        used: i64,
        observed: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        lwarn!(
            "system",
            LogStage::Ledger,
            LogComponent::Database,
            "account_missing",
            "额度账户不存在，按本次扣减自动开户",
            scope = %scope,
            account_id = id,
        );
        quota_accounts::ActiveModel {
            scope: Set(scope.as_str().to_string()),
            account_id: Set(id.to_string()),
            quota: Set(quota),
            used_quota: Set(used),
            counter_snapshot: Set(observed),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(|e| {
            ProxyError::database_with_source(format!("创建额度账户失败: {scope}:{id}"), e)
        })?;
        Ok(())
    }
}

#[async_trait]
impl DurableQuotaStore for SeaOrmQuotaStore {
    async fn spend_quota(
        &self,
        scope: QuotaScope,
        id: &str,
        delta: i64,
        observed: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        let result = QuotaAccounts::update_many()
            .col_expr(
                quota_accounts::Column::Quota,
                Expr::col(quota_accounts::Column::Quota).sub(delta),
            )
            .col_expr(
                quota_accounts::Column::UsedQuota,
                Expr::col(quota_accounts::Column::UsedQuota).add(delta),
            )
            .col_expr(quota_accounts::Column::CounterSnapshot, Expr::value(observed))
            .col_expr(quota_accounts::Column::UpdatedAt, Expr::value(now))
            .filter(quota_accounts::Column::Scope.eq(scope.as_str()))
            .filter(quota_accounts::Column::AccountId.eq(id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return self.insert_spent(scope, id, -delta, delta, observed).await;
        }

        if let Some(account) = self.account(scope, id).await? {
            match account.counter_drift() {
                Some(drift) if drift != 0 => {
                    lwarn!(
                        "system",
                        LogStage::Ledger,
                        LogComponent::Database,
                        "counter_drift",
                        "持久余额与快速计数器不一致",
                        scope = %scope,
                        account_id = id,
                        quota = account.quota,
                        counter = ?account.counter_snapshot,
                        drift = drift,
                    );
                }
                _ => {
                    ldebug!(
                        "system",
                        LogStage::Ledger,
                        LogComponent::Database,
                        "spend_quota",
                        "额度已扣减",
                        scope = %scope,
                        account_id = id,
                        delta = delta,
                        quota = account.quota,
                    );
                }
            }
        }
        Ok(())
    }

    async fn used_quota(&self, scope: QuotaScope, id: &str, delta: i64) -> Result<()> {
        let now = Utc::now().naive_utc();
        let result = QuotaAccounts::update_many()
            .col_expr(
                quota_accounts::Column::UsedQuota,
                Expr::col(quota_accounts::Column::UsedQuota).add(delta),
            )
            .col_expr(quota_accounts::Column::UpdatedAt, Expr::value(now))
            .filter(quota_accounts::Column::Scope.eq(scope.as_str()))
            .filter(quota_accounts::Column::AccountId.eq(id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return self.insert_spent(scope, id, 0, delta, None).await;
        }

        ldebug!(
            "system",
            LogStage::Ledger,
            LogComponent::Database,
            "used_quota",
            "已用额度已累加",
            scope = %scope,
            account_id = id,
            delta = delta,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn store() -> SeaOrmQuotaStore {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        SeaOrmQuotaStore::new(Arc::new(db))
    }

    #[tokio::test]
    async fn test_spend_quota_is_additive() {
        let store = store().await;
        store.open_account(QuotaScope::User, "u1", 1000).await.unwrap();

        store.spend_quota(QuotaScope::User, "u1", 150, Some(850)).await.unwrap();
        store.spend_quota(QuotaScope::User, "u1", 50, Some(800)).await.unwrap();

        let account = store.account(QuotaScope::User, "u1").await.unwrap().unwrap();
        assert_eq!(account.quota, 800);
        assert_eq!(account.used_quota, 200);
        assert_eq!(account.counter_snapshot, Some(800));
        assert_eq!(account.counter_drift(), Some(0));
    }

    #[tokio::test]
    async fn test_used_quota_leaves_balance() {
        let store = store().await;
        store.open_account(QuotaScope::Key, "k1", 0).await.unwrap();

        store.used_quota(QuotaScope::Key, "k1", 42).await.unwrap();

        let account = store.account(QuotaScope::Key, "k1").await.unwrap().unwrap();
        assert_eq!(account.quota, 0);
        assert_eq!(account.used_quota, 42);
    }

    #[tokio::test]
    async fn test_missing_account_is_opened_with_the_charge() {
        let store = store().await;

        store.spend_quota(QuotaScope::App, "a1", 30, Some(-30)).await.unwrap();

        let account = store.account(QuotaScope::App, "a1").await.unwrap().unwrap();
        assert_eq!(account.quota, -30);
        assert_eq!(account.used_quota, 30);
        assert!(account.is_exhausted());
    }
}
