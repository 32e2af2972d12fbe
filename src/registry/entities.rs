//! # 注册表实体
//!
//! 用户、应用、应用密钥、分组、模型、模型代理、密钥与提供商记录。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::billing::pricing::Pricing;
use crate::types::{AgentId, AppId, GroupId, KeyId, ModelId, ProviderId, QuotaValue, UserId};

/// 记录状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Enabled,
    Disabled,
}

impl Status {
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub quota: QuotaValue,
    /// 所属分组
    #[serde(default)]
    pub groups: Vec<GroupId>,
    /// 非空时限制可用模型
    #[serde(default)]
    pub models: Vec<ModelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub user_id: UserId,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub models: Vec<ModelId>,
    #[serde(default)]
    pub is_limit_quota: bool,
    #[serde(default)]
    pub quota: QuotaValue,
    /// 绑定的分组
    #[serde(default)]
    pub group: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppKey {
    pub key: String,
    pub app_id: AppId,
    pub user_id: UserId,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub models: Vec<ModelId>,
    #[serde(default)]
    pub is_limit_quota: bool,
    #[serde(default)]
    pub quota: QuotaValue,
    #[serde(default)]
    pub group: Option<GroupId>,
}

/// 转发规则
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardRule {
    /// 全部转发
    #[default]
    All,
    /// 最后一条用户消息命中关键字或达到长度阈值时转发
    Conditional,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub rule: ForwardRule,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// 字符数达到该值时转发，0 表示不按长度转发
    #[serde(default)]
    pub content_length: usize,
    pub target_model: ModelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Status,
    /// 分组提供的模型
    #[serde(default)]
    pub models: Vec<ModelId>,
    /// 折扣倍率，取值 (0, 1]，0 表示不打折
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub is_limit_quota: bool,
    #[serde(default)]
    pub quota: QuotaValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_enable_model_agent: bool,
    #[serde(default)]
    pub model_agents: Vec<AgentId>,
    #[serde(default)]
    pub is_enable_forward: bool,
    #[serde(default)]
    pub forward_config: Option<ForwardConfig>,
}

impl Group {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn offers(&self, model_id: &str) -> bool {
        self.models.iter().any(|id| id == model_id)
    }
}

/// 模型类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    Text,
    Multimodal,
    MultimodalAudio,
    MultimodalRealtime,
    ImageGeneration,
    Embedding,
    Audio,
    Video,
    Midjourney,
}

impl ModelType {
    /// 未配置路径时使用的默认接口路径
    pub const fn default_path(self) -> &'static str {
        match self {
            Self::Text | Self::Multimodal | Self::MultimodalAudio => "/v1/chat/completions",
            Self::MultimodalRealtime => "/v1/realtime",
            Self::ImageGeneration => "/v1/images/generations",
            Self::Embedding => "/v1/embeddings",
            Self::Audio => "/v1/audio/speech",
            Self::Video => "/v1/videos",
            Self::Midjourney => "/mj/submit/imagine",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub model_agent: Option<AgentId>,
    #[serde(default)]
    pub model: Option<ModelId>,
}

/// 预设配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetConfig {
    /// 追加到消息列表开头的系统提示
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// 最大输出 token 上限
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    /// 对外暴露的模型名
    pub name: String,
    /// 发往上游的模型名
    pub model: String,
    pub provider_id: ProviderId,
    #[serde(default, rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub pricing: Pricing,
    /// 启用后通过模型代理路由，代理由 `ModelAgent::models` 关联
    #[serde(default)]
    pub is_enable_model_agent: bool,
    #[serde(default)]
    pub is_enable_forward: bool,
    #[serde(default)]
    pub forward_config: Option<ForwardConfig>,
    #[serde(default)]
    pub is_enable_fallback: bool,
    #[serde(default)]
    pub fallback_config: Option<FallbackConfig>,
    #[serde(default)]
    pub is_enable_preset_config: bool,
    #[serde(default)]
    pub preset_config: Option<PresetConfig>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl Model {
    /// 启用回退时配置的回退代理
    pub fn fallback_agent(&self) -> Option<&AgentId> {
        self.fallback_config
            .as_ref()
            .filter(|_| self.is_enable_fallback)
            .and_then(|config| config.model_agent.as_ref())
    }

    /// 启用回退时配置的回退模型
    pub fn fallback_model(&self) -> Option<&ModelId> {
        self.fallback_config
            .as_ref()
            .filter(|_| self.is_enable_fallback)
            .and_then(|config| config.model.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAgent {
    pub id: AgentId,
    #[serde(default)]
    pub name: String,
    pub provider_id: ProviderId,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub status: Status,
    /// 代理服务的模型
    #[serde(default)]
    pub models: Vec<ModelId>,
    #[serde(default)]
    pub is_enable_model_replace: bool,
    /// 命中这些上游模型名时替换为 target_models 中同位置的名称
    #[serde(default)]
    pub replace_models: Vec<String>,
    #[serde(default)]
    pub target_models: Vec<String>,
}

impl ModelAgent {
    /// 按替换规则得到上游模型名
    pub fn replace_model(&self, upstream_model: &str) -> Option<&str> {
        if !self.is_enable_model_replace {
            return None;
        }
        self.replace_models
            .iter()
            .position(|name| name == upstream_model)
            .and_then(|index| self.target_models.get(index))
            .map(String::as_str)
    }
}

const fn default_weight() -> u32 {
    1
}

/// 上游凭证
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    /// 原始凭证
    pub key: String,
    pub provider_id: ProviderId,
    /// 直接绑定的模型
    #[serde(default)]
    pub models: Vec<ModelId>,
    /// 所属模型代理
    #[serde(default)]
    pub model_agents: Vec<AgentId>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub is_limit_quota: bool,
    #[serde(default)]
    pub quota: QuotaValue,
}

/// 提供商认证方式
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderAuth {
    /// 原始凭证直接作为 API Key 使用
    #[default]
    ApiKey,
    /// OAuth2 client credentials，原始凭证格式为 `client_id:client_secret`
    ClientCredentials {
        token_url: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

impl ProviderAuth {
    pub const fn requires_exchange(&self) -> bool {
        matches!(self, Self::ClientCredentials { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    /// 提供商编码，如 openai、anthropic
    pub code: String,
    pub base_url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub auth: ProviderAuth,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> ModelAgent {
        ModelAgent {
            id: "a1".to_string(),
            name: String::new(),
            provider_id: "p1".to_string(),
            base_url: None,
            path: None,
            weight: 1,
            status: Status::Enabled,
            models: vec![],
            is_enable_model_replace: true,
            replace_models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
            target_models: vec!["gpt-4o-2024-11-20".to_string()],
        }
    }

    #[test]
    fn test_agent_replace_model_by_position() {
        let agent = agent();
        assert_eq!(agent.replace_model("gpt-4o"), Some("gpt-4o-2024-11-20"));
        // 没有对应目标时不替换
        assert_eq!(agent.replace_model("gpt-4o-mini"), None);
        assert_eq!(agent.replace_model("o3"), None);
    }

    #[test]
    fn test_agent_replace_disabled() {
        let agent = ModelAgent {
            is_enable_model_replace: false,
            ..agent()
        };
        assert_eq!(agent.replace_model("gpt-4o"), None);
    }

    #[test]
    fn test_group_expiry() {
        let now = Utc::now();
        let group = Group {
            id: "g".to_string(),
            name: String::new(),
            status: Status::Enabled,
            models: vec![],
            discount: 0.0,
            is_limit_quota: false,
            quota: 0,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            is_default: false,
            is_enable_model_agent: false,
            model_agents: vec![],
            is_enable_forward: false,
            forward_config: None,
        };
        assert!(group.is_expired(now));
        assert!(!Group { expires_at: None, ..group }.is_expired(now));
    }

    #[test]
    fn test_provider_auth_tagging() {
        let provider: Provider = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "code": "azure",
            "base_url": "https://example.test",
            "auth": {"type": "client_credentials", "token_url": "https://login.test/token"}
        }))
        .unwrap();
        assert!(provider.auth.requires_exchange());
    }
}
