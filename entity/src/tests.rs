//! # 实体定义测试

#[cfg(test)]
mod tests {
    use crate::quota_accounts;
    use sea_orm::Set;

    fn sample(quota: i64, snapshot: Option<i64>) -> quota_accounts::Model {
        let now = chrono::Utc::now().naive_utc();
        quota_accounts::Model {
            id: 1,
            scope: "user".to_string(),
            account_id: "u-1".to_string(),
            quota,
            used_quota: 0,
            counter_snapshot: snapshot,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_quota_account_creation() {
        let account = quota_accounts::ActiveModel {
            scope: Set("app".to_string()),
            account_id: Set("app-1".to_string()),
            quota: Set(1000),
            used_quota: Set(0),
            ..Default::default()
        };

        assert_eq!(account.scope.as_ref(), "app");
        assert_eq!(account.quota.as_ref(), &1000);
    }

    #[test]
    fn test_counter_drift() {
        assert_eq!(sample(900, Some(900)).counter_drift(), Some(0));
        assert_eq!(sample(880, Some(900)).counter_drift(), Some(-20));
        assert_eq!(sample(900, None).counter_drift(), None);
    }

    #[test]
    fn test_is_exhausted() {
        assert!(sample(0, None).is_exhausted());
        assert!(sample(-5, None).is_exhausted());
        assert!(!sample(1, None).is_exhausted());
    }
}
