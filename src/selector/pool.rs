use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Pick, PickResult, Selector};
use crate::config::SelectorConfig;
use crate::error::SelectorError;
use crate::logging::{LogComponent, LogStage};
use crate::registry::{Group, Key, Model, ModelAgent, Registry, Status};
use crate::{ldebug, lwarn};

/// 候选池成员的公共视图
trait Weighted {
    fn id(&self) -> &str;
    fn weight(&self) -> u32;
    fn status(&self) -> Status;
}

impl Weighted for ModelAgent {
    fn id(&self) -> &str {
        &self.id
    }
    fn weight(&self) -> u32 {
        self.weight
    }
    fn status(&self) -> Status {
        self.status
    }
}

impl Weighted for Key {
    fn id(&self) -> &str {
        &self.id
    }
    fn weight(&self) -> u32 {
        self.weight
    }
    fn status(&self) -> Status {
        self.status
    }
}

/// 按权重随机挑选，权重为 0 的成员按 1 计
fn weighted_pick<T: Weighted>(candidates: Vec<T>) -> Option<T> {
    let total: u64 = candidates.iter().map(|c| u64::from(c.weight().max(1))).sum();
    if total == 0 {
        return None;
    }
    let mut point = fastrand::u64(0..total);
    for candidate in candidates {
        let weight = u64::from(candidate.weight().max(1));
        if point < weight {
            return Some(candidate);
        }
        point -= weight;
    }
    None
}

/// 基于注册表的加权随机选择器
///
/// 连续错误达到阈值的代理或密钥会被自动禁用；禁用状态只保存在进程内。
pub struct PoolSelector {
    registry: Arc<dyn Registry>,
    error_threshold: u32,
    agent_errors: DashMap<String, u32>,
    key_errors: DashMap<String, u32>,
    disabled_agents: DashMap<String, String>,
    disabled_keys: DashMap<String, String>,
}

impl PoolSelector {
    pub fn new(registry: Arc<dyn Registry>, config: &SelectorConfig) -> Self {
        Self {
            registry,
            error_threshold: config.error_threshold,
            agent_errors: DashMap::new(),
            key_errors: DashMap::new(),
            disabled_agents: DashMap::new(),
            disabled_keys: DashMap::new(),
        }
    }

    pub fn is_agent_disabled(&self, agent_id: &str) -> bool {
        self.disabled_agents.contains_key(agent_id)
    }

    pub fn is_key_disabled(&self, key_id: &str) -> bool {
        self.disabled_keys.contains_key(key_id)
    }

    /// 解除全部运行期禁用并清零错误计数
    pub fn reset(&self) {
        self.agent_errors.clear();
        self.key_errors.clear();
        self.disabled_agents.clear();
        self.disabled_keys.clear();
    }

    /// 过滤掉停用与运行期禁用的成员后挑选，池大小按注册表中启用的成员计
    fn pick_from<T: Weighted>(
        &self,
        members: Vec<T>,
        disabled: &DashMap<String, String>,
    ) -> Option<Pick<T>> {
        let enabled: Vec<T> = members
            .into_iter()
            .filter(|m| m.status().is_enabled())
            .collect();
        let pool_size = enabled.len();
        let usable: Vec<T> = enabled
            .into_iter()
            .filter(|m| !disabled.contains_key(m.id()))
            .collect();
        weighted_pick(usable).map(|item| Pick::new(pool_size, item))
    }

    /// 计数加一，返回是否达到禁用阈值
    fn bump(&self, counters: &DashMap<String, u32>, id: &str) -> bool {
        let mut count = counters.entry(id.to_string()).or_insert(0);
        *count += 1;
        self.error_threshold > 0 && *count >= self.error_threshold
    }
}

#[async_trait]
impl Selector for PoolSelector {
    async fn pick_agent(&self, model: &Model) -> PickResult<ModelAgent> {
        let agents = self.registry.agents_for_model(&model.id).await?;
        let pick = self
            .pick_from(agents, &self.disabled_agents)
            .ok_or_else(|| SelectorError::NoAvailableAgent {
                model: model.id.clone(),
            })?;
        ldebug!("system", LogStage::Scheduling, LogComponent::Selector, "pick_agent", "选中模型代理", model_id = %model.id, agent_id = %pick.item.id, pool_size = pick.pool_size);
        Ok(pick)
    }

    async fn pick_group_agent(&self, group: &Group, model: &Model) -> PickResult<ModelAgent> {
        let mut agents = Vec::with_capacity(group.model_agents.len());
        for agent_id in &group.model_agents {
            if let Some(agent) = self.registry.model_agent(agent_id).await? {
                if agent.models.is_empty() || agent.models.iter().any(|id| id == &model.id) {
                    agents.push(agent);
                }
            }
        }
        let pick = self
            .pick_from(agents, &self.disabled_agents)
            .ok_or_else(|| SelectorError::NoAvailableGroupAgent {
                group_id: group.id.clone(),
            })?;
        ldebug!("system", LogStage::Scheduling, LogComponent::Selector, "pick_group_agent", "选中分组模型代理", group_id = %group.id, agent_id = %pick.item.id, pool_size = pick.pool_size);
        Ok(pick)
    }

    async fn pick_agent_key(&self, agent: &ModelAgent) -> PickResult<Key> {
        let keys = self.registry.keys_for_agent(&agent.id).await?;
        self.pick_from(keys, &self.disabled_keys)
            .ok_or_else(|| SelectorError::NoAvailableAgentKey {
                agent_id: agent.id.clone(),
            })
    }

    async fn pick_key(&self, model: &Model) -> PickResult<Key> {
        let keys = self.registry.keys_for_model(&model.id).await?;
        self.pick_from(keys, &self.disabled_keys)
            .ok_or_else(|| SelectorError::NoAvailableKey {
                model: model.id.clone(),
            })
    }

    async fn record_error(&self, model: &Model, key: Option<&Key>, agent: Option<&ModelAgent>) {
        if let Some(key) = key {
            if self.bump(&self.key_errors, &key.id) {
                self.disable_key(key, "连续错误达到阈值").await;
            }
        }
        if let Some(agent) = agent {
            if self.bump(&self.agent_errors, &agent.id) {
                self.disable_agent(agent, "连续错误达到阈值").await;
            }
        }
        ldebug!("system", LogStage::Scheduling, LogComponent::Selector, "record_error", "记录上游错误", model_id = %model.id, key_id = ?key.map(|k| k.id.as_str()), agent_id = ?agent.map(|a| a.id.as_str()));
    }

    async fn record_success(&self, key: &Key, agent: Option<&ModelAgent>) {
        self.key_errors.remove(&key.id);
        if let Some(agent) = agent {
            self.agent_errors.remove(&agent.id);
        }
    }

    async fn disable_agent(&self, agent: &ModelAgent, reason: &str) {
        self.disabled_agents.insert(agent.id.clone(), reason.to_string());
        lwarn!("system", LogStage::Scheduling, LogComponent::Selector, "disable_agent", "模型代理已禁用", agent_id = %agent.id, reason = reason);
    }

    async fn disable_key(&self, key: &Key, reason: &str) {
        self.disabled_keys.insert(key.id.clone(), reason.to_string());
        lwarn!("system", LogStage::Scheduling, LogComponent::Selector, "disable_key", "密钥已禁用", key_id = %key.id, reason = reason);
    }
}
