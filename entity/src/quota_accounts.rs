//! # 额度账户实体定义
//!
//! 额度账本的持久层：每个 (scope, account_id) 一行，记录剩余额度、已用额度
//! 以及最近一次扣减时观察到的快速计数器值

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 额度账户实体
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "quota_accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 账户层级: 'user', 'app', 'app_key', 'group', 'key'
    pub scope: String,
    /// 账户标识
    pub account_id: String,
    /// 剩余额度
    pub quota: i64,
    /// 累计已用额度
    pub used_quota: i64,
    /// 最近一次扣减时快速计数器返回的值
    pub counter_snapshot: Option<i64>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 持久余额与快速计数器之间的偏差，未记录快照时为 None
    pub fn counter_drift(&self) -> Option<i64> {
        self.counter_snapshot.map(|snapshot| self.quota - snapshot)
    }

    /// 额度是否已耗尽
    pub fn is_exhausted(&self) -> bool {
        self.quota <= 0
    }
}
