//! # 注册表
//!
//! 解析器读取的用户、应用、分组、模型、代理、密钥与提供商记录。
//! `MemoryRegistry` 持有一份可替换的快照，`CachedRegistry` 在任意来源之上加一层带 TTL 的 moka 缓存。

mod cached;
pub mod entities;
mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use cached::CachedRegistry;
pub use entities::{
    App, AppKey, FallbackConfig, ForwardConfig, ForwardRule, Group, Key, Model, ModelAgent,
    ModelType, PresetConfig, Provider, ProviderAuth, Status, User,
};
pub use memory::{MemoryRegistry, RegistrySnapshot};

/// 注册表查询接口
///
/// 单条查询在记录不存在时返回 `Ok(None)`，`Err` 只表示注册表本身不可用。
#[async_trait]
pub trait Registry: Send + Sync {
    async fn user(&self, id: &str) -> Result<Option<User>>;

    async fn app(&self, id: &str) -> Result<Option<App>>;

    async fn app_key(&self, key: &str) -> Result<Option<AppKey>>;

    async fn group(&self, id: &str) -> Result<Option<Group>>;

    async fn model(&self, id: &str) -> Result<Option<Model>>;

    /// 对外名称为 `name` 的全部模型（不过滤状态）
    async fn models_by_name(&self, name: &str) -> Result<Vec<Model>>;

    async fn model_agent(&self, id: &str) -> Result<Option<ModelAgent>>;

    /// 服务该模型的全部代理
    async fn agents_for_model(&self, model_id: &str) -> Result<Vec<ModelAgent>>;

    /// 属于该代理的全部密钥
    async fn keys_for_agent(&self, agent_id: &str) -> Result<Vec<Key>>;

    /// 直接绑定该模型的全部密钥
    async fn keys_for_model(&self, model_id: &str) -> Result<Vec<Key>>;

    async fn provider(&self, id: &str) -> Result<Option<Provider>>;
}
