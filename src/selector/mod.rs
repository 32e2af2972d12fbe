//! # 选择器
//!
//! 在模型代理池与密钥池中按权重挑选成员，并维护运行期的错误计数与禁用状态。

mod pool;

use async_trait::async_trait;

use crate::error::SelectorError;
use crate::registry::{Group, Key, Model, ModelAgent};

pub use pool::PoolSelector;

/// 选择结果，附带挑选时候选池的大小
#[derive(Debug, Clone, PartialEq)]
pub struct Pick<T> {
    pub pool_size: usize,
    pub item: T,
}

impl<T> Pick<T> {
    pub const fn new(pool_size: usize, item: T) -> Self {
        Self { pool_size, item }
    }
}

pub type PickResult<T> = std::result::Result<Pick<T>, SelectorError>;

/// 代理与密钥选择器
#[async_trait]
pub trait Selector: Send + Sync {
    /// 为模型挑选一个模型代理
    async fn pick_agent(&self, model: &Model) -> PickResult<ModelAgent>;

    /// 在分组绑定的代理中挑选一个服务该模型的代理
    async fn pick_group_agent(&self, group: &Group, model: &Model) -> PickResult<ModelAgent>;

    /// 挑选代理下的一个密钥
    async fn pick_agent_key(&self, agent: &ModelAgent) -> PickResult<Key>;

    /// 挑选直接绑定到模型的一个密钥
    async fn pick_key(&self, model: &Model) -> PickResult<Key>;

    /// 记录一次上游错误，`key` 为空表示代理级错误
    async fn record_error(&self, model: &Model, key: Option<&Key>, agent: Option<&ModelAgent>);

    /// 记录一次成功，清零连续错误计数
    async fn record_success(&self, key: &Key, agent: Option<&ModelAgent>);

    async fn disable_agent(&self, agent: &ModelAgent, reason: &str);

    async fn disable_key(&self, key: &Key, reason: &str);
}
