use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use super::Registry;
use super::entities::{App, AppKey, Group, Key, Model, ModelAgent, Provider, User};
use crate::error::{Context, Result};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};

/// 带 TTL 的读穿缓存注册表
///
/// 缓存未命中时回源，回源失败不写缓存；不存在的记录也会被缓存到过期为止。
pub struct CachedRegistry<R> {
    source: R,
    users: Cache<String, Option<User>>,
    apps: Cache<String, Option<App>>,
    app_keys: Cache<String, Option<AppKey>>,
    groups: Cache<String, Option<Group>>,
    models: Cache<String, Option<Model>>,
    models_by_name: Cache<String, Vec<Model>>,
    model_agents: Cache<String, Option<ModelAgent>>,
    agents_for_model: Cache<String, Vec<ModelAgent>>,
    keys_for_agent: Cache<String, Vec<Key>>,
    keys_for_model: Cache<String, Vec<Key>>,
    providers: Cache<String, Option<Provider>>,
}

fn build<V>(max_entries: u64, ttl: Duration) -> Cache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(max_entries)
        .time_to_live(ttl)
        .build()
}

async fn read_through<V, F>(cache: &Cache<String, V>, kind: &str, key: &str, load: F) -> Result<V>
where
    V: Clone + Send + Sync + 'static,
    F: Future<Output = Result<V>>,
{
    if let Some(value) = cache.get(key).await {
        return Ok(value);
    }

    ldebug!("system", LogStage::Registry, LogComponent::Registry, "cache_miss", "注册表缓存未命中，回源加载", kind = kind, key = key);
    let value = load.await.with_context(|| format!("加载{kind}失败: {key}"))?;
    cache.insert(key.to_string(), value.clone()).await;
    Ok(value)
}

impl<R: Registry> CachedRegistry<R> {
    pub fn new(source: R, max_entries: u64, ttl: Duration) -> Self {
        Self {
            source,
            users: build(max_entries, ttl),
            apps: build(max_entries, ttl),
            app_keys: build(max_entries, ttl),
            groups: build(max_entries, ttl),
            models: build(max_entries, ttl),
            models_by_name: build(max_entries, ttl),
            model_agents: build(max_entries, ttl),
            agents_for_model: build(max_entries, ttl),
            keys_for_agent: build(max_entries, ttl),
            keys_for_model: build(max_entries, ttl),
            providers: build(max_entries, ttl),
        }
    }

    /// 按 `cache` 配置节创建
    pub fn from_config(source: R, config: &crate::config::CacheConfig) -> Self {
        Self::new(
            source,
            config.memory_max_entries,
            Duration::from_secs(config.default_ttl),
        )
    }

    pub const fn source(&self) -> &R {
        &self.source
    }

    /// 清空全部缓存，下次查询回源
    pub fn invalidate_all(&self) {
        self.users.invalidate_all();
        self.apps.invalidate_all();
        self.app_keys.invalidate_all();
        self.groups.invalidate_all();
        self.models.invalidate_all();
        self.models_by_name.invalidate_all();
        self.model_agents.invalidate_all();
        self.agents_for_model.invalidate_all();
        self.keys_for_agent.invalidate_all();
        self.keys_for_model.invalidate_all();
        self.providers.invalidate_all();
    }
}

#[async_trait]
impl<R: Registry> Registry for CachedRegistry<R> {
    async fn user(&self, id: &str) -> Result<Option<User>> {
        read_through(&self.users, "用户", id, self.source.user(id)).await
    }

    async fn app(&self, id: &str) -> Result<Option<App>> {
        read_through(&self.apps, "应用", id, self.source.app(id)).await
    }

    async fn app_key(&self, key: &str) -> Result<Option<AppKey>> {
        read_through(&self.app_keys, "应用密钥", key, self.source.app_key(key)).await
    }

    async fn group(&self, id: &str) -> Result<Option<Group>> {
        read_through(&self.groups, "分组", id, self.source.group(id)).await
    }

    async fn model(&self, id: &str) -> Result<Option<Model>> {
        read_through(&self.models, "模型", id, self.source.model(id)).await
    }

    async fn models_by_name(&self, name: &str) -> Result<Vec<Model>> {
        read_through(&self.models_by_name, "模型列表", name, self.source.models_by_name(name)).await
    }

    async fn model_agent(&self, id: &str) -> Result<Option<ModelAgent>> {
        read_through(&self.model_agents, "模型代理", id, self.source.model_agent(id)).await
    }

    async fn agents_for_model(&self, model_id: &str) -> Result<Vec<ModelAgent>> {
        read_through(
            &self.agents_for_model,
            "模型代理列表",
            model_id,
            self.source.agents_for_model(model_id),
        )
        .await
    }

    async fn keys_for_agent(&self, agent_id: &str) -> Result<Vec<Key>> {
        read_through(
            &self.keys_for_agent,
            "代理密钥列表",
            agent_id,
            self.source.keys_for_agent(agent_id),
        )
        .await
    }

    async fn keys_for_model(&self, model_id: &str) -> Result<Vec<Key>> {
        read_through(
            &self.keys_for_model,
            "模型密钥列表",
            model_id,
            self.source.keys_for_model(model_id),
        )
        .await
    }

    async fn provider(&self, id: &str) -> Result<Option<Provider>> {
        read_through(&self.providers, "提供商", id, self.source.provider(id)).await
    }
}
