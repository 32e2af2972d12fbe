use thiserror::Error;

use super::ProxyError;

/// 选择器在代理池或密钥池中挑选成员失败
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("模型 {model} 没有可用的模型代理")]
    NoAvailableAgent { model: String },

    #[error("代理 {agent_id} 没有可用的密钥")]
    NoAvailableAgentKey { agent_id: String },

    #[error("模型 {model} 没有可用的密钥")]
    NoAvailableKey { model: String },

    #[error("分组 {group_id} 没有绑定可用的模型代理")]
    NoAvailableGroupAgent { group_id: String },

    /// 读取候选池时注册表不可用
    #[error(transparent)]
    Registry(Box<ProxyError>),
}

impl SelectorError {
    /// 代理本身已无任何可用密钥，调用方应禁用该代理
    pub const fn agent_exhausted(&self) -> bool {
        matches!(self, Self::NoAvailableAgentKey { .. })
    }
}

impl From<ProxyError> for SelectorError {
    fn from(err: ProxyError) -> Self {
        Self::Registry(Box::new(err))
    }
}

impl From<SelectorError> for ProxyError {
    fn from(err: SelectorError) -> Self {
        match err {
            SelectorError::NoAvailableAgent { model } => Self::no_available_agent(model),
            SelectorError::NoAvailableGroupAgent { group_id } => Self::no_available_agent(group_id),
            SelectorError::NoAvailableAgentKey { agent_id } => Self::no_available_key(agent_id),
            SelectorError::NoAvailableKey { model } => Self::no_available_key(model),
            SelectorError::Registry(err) => *err,
        }
    }
}
