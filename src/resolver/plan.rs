use std::collections::HashSet;

use serde::Serialize;

use crate::registry::{App, AppKey, Group, Key, Model, ModelAgent, PresetConfig, Provider, User};
use crate::types::{AgentId, KeyId, ModelId};

/// 路由方式，代理路由与直连密钥二选一
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Agent { agent: ModelAgent, key: Key },
    Direct { key: Key },
}

impl Route {
    pub const fn key(&self) -> &Key {
        match self {
            Self::Agent { key, .. } | Self::Direct { key } => key,
        }
    }

    pub const fn agent(&self) -> Option<&ModelAgent> {
        match self {
            Self::Agent { agent, .. } => Some(agent),
            Self::Direct { .. } => None,
        }
    }

    pub const fn is_agent_routing(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }
}

/// 一次解析使用的回退参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveArgs {
    pub fallback_agent: Option<AgentId>,
    pub fallback_model: Option<ModelId>,
}

impl ResolveArgs {
    /// 按请求模型的回退配置计算下一跳
    ///
    /// 先换代理（只换一次，且与刚试过的代理不同），再换模型（只换一次）。
    /// 换模型时清掉回退代理。
    pub fn next_hop(&self, req_model: &Model, tried_agent: Option<&str>) -> Option<FallbackHop> {
        if !req_model.is_enable_fallback {
            return None;
        }
        if self.fallback_agent.is_none() && self.fallback_model.is_none() {
            if let Some(agent_id) = req_model.fallback_agent() {
                if tried_agent != Some(agent_id.as_str()) {
                    return Some(FallbackHop::Agent(Self {
                        fallback_agent: Some(agent_id.clone()),
                        fallback_model: None,
                    }));
                }
            }
        }
        if self.fallback_model.is_none() {
            if let Some(model_id) = req_model.fallback_model() {
                return Some(FallbackHop::Model(Self {
                    fallback_agent: None,
                    fallback_model: Some(model_id.clone()),
                }));
            }
        }
        None
    }
}

/// 回退的一跳
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackHop {
    Agent(ResolveArgs),
    Model(ResolveArgs),
}

impl FallbackHop {
    pub fn args(&self) -> &ResolveArgs {
        match self {
            Self::Agent(args) | Self::Model(args) => args,
        }
    }

    pub fn into_args(self) -> ResolveArgs {
        match self {
            Self::Agent(args) | Self::Model(args) => args,
        }
    }
}

/// 单个请求内的重试上下文，不落库
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    /// 当前回退跳内已经做过的重试次数
    pub attempt: u32,
    pub is_fallback: bool,
    /// 触发本次重试的错误
    pub error: Option<String>,
    disabled: HashSet<(Option<AgentId>, KeyId)>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一回退跳内的下一次重试
    #[must_use]
    pub fn next_attempt(&self, error: impl Into<String>) -> Self {
        Self {
            attempt: self.attempt + 1,
            is_fallback: self.is_fallback,
            error: Some(error.into()),
            disabled: self.disabled.clone(),
        }
    }

    /// 进入回退跳，重试计数清零，禁用集合保留
    #[must_use]
    pub fn fallback(&self, error: impl Into<String>) -> Self {
        Self {
            attempt: 0,
            is_fallback: true,
            error: Some(error.into()),
            disabled: self.disabled.clone(),
        }
    }

    pub fn disable(&mut self, agent_id: Option<&str>, key_id: &str) {
        self.disabled
            .insert((agent_id.map(ToString::to_string), key_id.to_string()));
    }

    pub fn is_disabled(&self, agent_id: Option<&str>, key_id: &str) -> bool {
        self.disabled
            .contains(&(agent_id.map(ToString::to_string), key_id.to_string()))
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.len()
    }
}

/// 调度计划，每次尝试重新构建
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    /// 用户请求的模型
    pub req_model: Model,
    /// 实际调用的模型，是请求模型、回退模型或转发目标的完整副本
    pub real_model: Model,
    pub route: Route,
    pub provider: Provider,
    pub base_url: String,
    pub path: String,
    /// 发往上游的凭证材料
    pub credential: String,
    pub user: User,
    pub app: App,
    pub app_key: AppKey,
    pub group: Option<Group>,
    pub agent_pool_size: usize,
    pub key_pool_size: usize,
    pub args: ResolveArgs,
    pub retry: RetryContext,
    /// 启用预设时携带模型的预设配置
    pub preset: Option<PresetConfig>,
}

impl DispatchPlan {
    pub fn key(&self) -> &Key {
        self.route.key()
    }

    pub fn agent(&self) -> Option<&ModelAgent> {
        self.route.agent()
    }

    /// 上游完整地址
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    /// 计费时使用的分组折扣
    pub fn group_discount(&self) -> Option<f64> {
        self.group.as_ref().map(|group| group.discount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FallbackConfig, Status};

    fn model_with_fallback(agent: Option<&str>, model: Option<&str>) -> Model {
        Model {
            id: "m1".to_string(),
            name: "gpt-4o".to_string(),
            model: "gpt-4o".to_string(),
            provider_id: "p1".to_string(),
            model_type: Default::default(),
            status: Status::Enabled,
            pricing: Default::default(),
            is_enable_model_agent: true,
            is_enable_forward: false,
            forward_config: None,
            is_enable_fallback: true,
            fallback_config: Some(FallbackConfig {
                model_agent: agent.map(ToString::to_string),
                model: model.map(ToString::to_string),
            }),
            is_enable_preset_config: false,
            preset_config: None,
            base_url: None,
            path: None,
        }
    }

    #[test]
    fn test_agent_hop_then_model_hop_then_nothing() {
        let model = model_with_fallback(Some("fa"), Some("m2"));
        let start = ResolveArgs::default();

        let hop = start.next_hop(&model, Some("a1")).unwrap();
        assert!(matches!(hop, FallbackHop::Agent(_)));
        let after_agent = hop.into_args();
        assert_eq!(after_agent.fallback_agent.as_deref(), Some("fa"));

        let hop = after_agent.next_hop(&model, Some("fa")).unwrap();
        assert!(matches!(hop, FallbackHop::Model(_)));
        let after_model = hop.into_args();
        assert_eq!(after_model.fallback_agent, None);
        assert_eq!(after_model.fallback_model.as_deref(), Some("m2"));

        assert!(after_model.next_hop(&model, None).is_none());
    }

    #[test]
    fn test_agent_hop_skipped_when_same_agent_was_tried() {
        let model = model_with_fallback(Some("fa"), Some("m2"));
        let hop = ResolveArgs::default().next_hop(&model, Some("fa")).unwrap();
        assert!(matches!(hop, FallbackHop::Model(_)));
    }

    #[test]
    fn test_no_hop_when_fallback_disabled() {
        let model = Model {
            is_enable_fallback: false,
            ..model_with_fallback(Some("fa"), Some("m2"))
        };
        assert!(ResolveArgs::default().next_hop(&model, None).is_none());
    }

    #[test]
    fn test_retry_context_keeps_disabled_pairs() {
        let mut retry = RetryContext::new();
        retry.disable(Some("a1"), "k1");
        let next = retry.next_attempt("boom");
        assert_eq!(next.attempt, 1);
        assert!(next.is_disabled(Some("a1"), "k1"));
        assert!(!next.is_disabled(None, "k1"));

        let hop = next.fallback("exhausted");
        assert_eq!(hop.attempt, 0);
        assert!(hop.is_fallback);
        assert_eq!(hop.disabled_count(), 1);
    }
}
