use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::Registry;
use super::entities::{App, AppKey, Group, Key, Model, ModelAgent, Provider, User};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ensure_config, linfo};

/// 注册表快照，可从 TOML 或 JSON 加载
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySnapshot {
    pub users: Vec<User>,
    pub apps: Vec<App>,
    pub app_keys: Vec<AppKey>,
    pub groups: Vec<Group>,
    pub models: Vec<Model>,
    pub model_agents: Vec<ModelAgent>,
    pub keys: Vec<Key>,
    pub providers: Vec<Provider>,
}

impl RegistrySnapshot {
    /// 按扩展名解析快照文件
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config_with_source(format!("读取注册表快照失败: {}", path.display()), e)
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(toml::from_str(&content)?),
        }
    }

    /// 校验引用完整性与回退链无环
    pub fn validate(&self) -> Result<()> {
        let models: HashMap<&str, &Model> =
            self.models.iter().map(|m| (m.id.as_str(), m)).collect();
        let agents: HashSet<&str> = self.model_agents.iter().map(|a| a.id.as_str()).collect();
        let providers: HashSet<&str> = self.providers.iter().map(|p| p.id.as_str()).collect();

        for model in &self.models {
            ensure_config!(
                providers.contains(model.provider_id.as_str()),
                "模型 {} 引用了不存在的提供商 {}",
                model.id,
                model.provider_id
            );
            if let Some(fallback) = &model.fallback_config {
                if let Some(agent_id) = &fallback.model_agent {
                    ensure_config!(
                        agents.contains(agent_id.as_str()),
                        "模型 {} 的回退代理 {} 不存在",
                        model.id,
                        agent_id
                    );
                }
                if let Some(target) = &fallback.model {
                    ensure_config!(
                        models.contains_key(target.as_str()),
                        "模型 {} 的回退模型 {} 不存在",
                        model.id,
                        target
                    );
                }
            }
            if let Some(forward) = &model.forward_config {
                ensure_config!(
                    models.contains_key(forward.target_model.as_str()),
                    "模型 {} 的转发目标 {} 不存在",
                    model.id,
                    forward.target_model
                );
            }
        }

        for provider in &self.providers {
            check_base_url(&format!("提供商 {}", provider.id), Some(&provider.base_url))?;
        }
        for model in &self.models {
            check_base_url(&format!("模型 {}", model.id), model.base_url.as_ref())?;
        }

        for agent in &self.model_agents {
            check_base_url(&format!("模型代理 {}", agent.id), agent.base_url.as_ref())?;
            ensure_config!(
                providers.contains(agent.provider_id.as_str()),
                "模型代理 {} 引用了不存在的提供商 {}",
                agent.id,
                agent.provider_id
            );
        }

        for group in &self.groups {
            ensure_config!(
                (0.0..=1.0).contains(&group.discount),
                "分组 {} 的折扣 {} 超出 [0, 1]",
                group.id,
                group.discount
            );
            if let Some(forward) = &group.forward_config {
                ensure_config!(
                    models.contains_key(forward.target_model.as_str()),
                    "分组 {} 的转发目标 {} 不存在",
                    group.id,
                    forward.target_model
                );
            }
        }

        // 回退模型链不得成环
        for model in &self.models {
            let mut seen = HashSet::from([model.id.as_str()]);
            let mut current: &Model = model;
            while let Some(next) = current.fallback_model() {
                ensure_config!(
                    seen.insert(next.as_str()),
                    "模型 {} 的回退链存在循环",
                    model.id
                );
                match models.get(next.as_str()) {
                    Some(next_model) => current = *next_model,
                    None => break,
                }
            }
        }

        Ok(())
    }
}

/// 配置了的地址必须是带 http(s) 协议的绝对地址
fn check_base_url(owner: &str, base_url: Option<&String>) -> Result<()> {
    let Some(base_url) = base_url.filter(|url| !url.is_empty()) else {
        return Ok(());
    };
    let parsed = url::Url::parse(base_url)
        .map_err(|e| ProxyError::config_with_source(format!("{owner} 的地址无效: {base_url}"), e))?;
    ensure_config!(
        matches!(parsed.scheme(), "http" | "https"),
        "{} 的地址协议不受支持: {}",
        owner,
        base_url
    );
    Ok(())
}

#[derive(Debug, Default)]
struct Indexed {
    users: HashMap<String, User>,
    apps: HashMap<String, App>,
    app_keys: HashMap<String, AppKey>,
    groups: HashMap<String, Group>,
    models: HashMap<String, Model>,
    model_agents: HashMap<String, ModelAgent>,
    keys: Vec<Key>,
    providers: HashMap<String, Provider>,
}

impl From<RegistrySnapshot> for Indexed {
    fn from(snapshot: RegistrySnapshot) -> Self {
        Self {
            users: snapshot.users.into_iter().map(|u| (u.id.clone(), u)).collect(),
            apps: snapshot.apps.into_iter().map(|a| (a.id.clone(), a)).collect(),
            app_keys: snapshot.app_keys.into_iter().map(|k| (k.key.clone(), k)).collect(),
            groups: snapshot.groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
            models: snapshot.models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            model_agents: snapshot
                .model_agents
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            keys: snapshot.keys,
            providers: snapshot.providers.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

/// 基于快照的内存注册表
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: RwLock<Indexed>,
}

impl MemoryRegistry {
    /// 校验并加载快照
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self> {
        snapshot.validate()?;
        Ok(Self {
            inner: RwLock::new(snapshot.into()),
        })
    }

    /// 整体替换快照，校验失败时保留旧数据
    pub async fn replace(&self, snapshot: RegistrySnapshot) -> Result<()> {
        snapshot.validate()?;
        let models = snapshot.models.len();
        *self.inner.write().await = snapshot.into();
        linfo!("system", LogStage::Registry, LogComponent::Registry, "replace_snapshot", "注册表快照已替换", models = models);
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn app(&self, id: &str) -> Result<Option<App>> {
        Ok(self.inner.read().await.apps.get(id).cloned())
    }

    async fn app_key(&self, key: &str) -> Result<Option<AppKey>> {
        Ok(self.inner.read().await.app_keys.get(key).cloned())
    }

    async fn group(&self, id: &str) -> Result<Option<Group>> {
        Ok(self.inner.read().await.groups.get(id).cloned())
    }

    async fn model(&self, id: &str) -> Result<Option<Model>> {
        Ok(self.inner.read().await.models.get(id).cloned())
    }

    async fn models_by_name(&self, name: &str) -> Result<Vec<Model>> {
        let inner = self.inner.read().await;
        let mut models: Vec<Model> = inner
            .models
            .values()
            .filter(|model| model.name == name)
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    async fn model_agent(&self, id: &str) -> Result<Option<ModelAgent>> {
        Ok(self.inner.read().await.model_agents.get(id).cloned())
    }

    async fn agents_for_model(&self, model_id: &str) -> Result<Vec<ModelAgent>> {
        let inner = self.inner.read().await;
        let mut agents: Vec<ModelAgent> = inner
            .model_agents
            .values()
            .filter(|agent| agent.models.iter().any(|id| id == model_id))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn keys_for_agent(&self, agent_id: &str) -> Result<Vec<Key>> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .iter()
            .filter(|key| key.model_agents.iter().any(|id| id == agent_id))
            .cloned()
            .collect())
    }

    async fn keys_for_model(&self, model_id: &str) -> Result<Vec<Key>> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .iter()
            .filter(|key| key.models.iter().any(|id| id == model_id))
            .cloned()
            .collect())
    }

    async fn provider(&self, id: &str) -> Result<Option<Provider>> {
        Ok(self.inner.read().await.providers.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::entities::{FallbackConfig, Status};

    fn model(id: &str, fallback: Option<&str>) -> Model {
        Model {
            id: id.to_string(),
            name: id.to_string(),
            model: id.to_string(),
            provider_id: "p1".to_string(),
            model_type: Default::default(),
            status: Status::Enabled,
            pricing: Default::default(),
            is_enable_model_agent: false,
            is_enable_forward: false,
            forward_config: None,
            is_enable_fallback: fallback.is_some(),
            fallback_config: fallback.map(|target| FallbackConfig {
                model_agent: None,
                model: Some(target.to_string()),
            }),
            is_enable_preset_config: false,
            preset_config: None,
            base_url: None,
            path: None,
        }
    }

    fn provider() -> Provider {
        Provider {
            id: "p1".to_string(),
            code: "openai".to_string(),
            base_url: "https://api.openai.test".to_string(),
            path: None,
            auth: Default::default(),
        }
    }

    #[test]
    fn test_fallback_cycle_is_rejected() {
        let snapshot = RegistrySnapshot {
            models: vec![model("a", Some("b")), model("b", Some("c")), model("c", Some("a"))],
            providers: vec![provider()],
            ..Default::default()
        };
        let err = snapshot.validate().unwrap_err();
        assert!(err.to_string().contains("循环"));
    }

    #[test]
    fn test_fallback_chain_without_cycle_is_accepted() {
        let snapshot = RegistrySnapshot {
            models: vec![model("a", Some("b")), model("b", Some("c")), model("c", None)],
            providers: vec![provider()],
            ..Default::default()
        };
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_missing_fallback_target_is_rejected() {
        let snapshot = RegistrySnapshot {
            models: vec![model("a", Some("ghost"))],
            providers: vec![provider()],
            ..Default::default()
        };
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let relative = RegistrySnapshot {
            providers: vec![Provider {
                base_url: "api.openai.test".to_string(),
                ..provider()
            }],
            ..Default::default()
        };
        assert!(relative.validate().is_err());

        let ftp = RegistrySnapshot {
            providers: vec![Provider {
                base_url: "ftp://files.test".to_string(),
                ..provider()
            }],
            ..Default::default()
        };
        let err = ftp.validate().unwrap_err();
        assert!(err.to_string().contains("协议"));
    }

    #[tokio::test]
    async fn test_lookups() {
        let registry = MemoryRegistry::from_snapshot(RegistrySnapshot {
            models: vec![model("m2", None), model("m1", None)],
            providers: vec![provider()],
            ..Default::default()
        })
        .unwrap();

        assert!(registry.model("m1").await.unwrap().is_some());
        assert!(registry.model("nope").await.unwrap().is_none());
        assert_eq!(registry.models_by_name("m2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_old_snapshot_on_invalid_input() {
        let registry = MemoryRegistry::from_snapshot(RegistrySnapshot {
            models: vec![model("m1", None)],
            providers: vec![provider()],
            ..Default::default()
        })
        .unwrap();

        let bad = RegistrySnapshot {
            models: vec![model("x", Some("y"))],
            providers: vec![provider()],
            ..Default::default()
        };
        assert!(registry.replace(bad).await.is_err());
        assert!(registry.model("m1").await.unwrap().is_some());
    }
}
