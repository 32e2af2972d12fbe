//! # 错误类型定义

use axum::http::StatusCode;
use thiserror::Error;

use super::upstream::UpstreamError;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 数据库相关错误
    #[error("数据库错误: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 网络通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 缓存相关错误
    #[error("缓存错误: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 注册表查询失败（用户/应用/密钥/分组/模型记录不可用）
    #[error("注册表错误: {message}")]
    Registry {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 分组不存在
    #[error("分组不存在: {group_id}")]
    GroupNotFound { group_id: String },

    /// 分组已禁用
    #[error("分组已禁用: {group_id}")]
    GroupDisabled { group_id: String },

    /// 分组已过期
    #[error("分组已过期: {group_id}")]
    GroupExpired { group_id: String },

    /// 分组额度不足
    #[error("分组额度不足: {group_id}")]
    GroupInsufficientQuota { group_id: String },

    /// 模型不存在或不在授权范围内
    #[error("模型不存在: {model}")]
    ModelNotFound { model: String },

    /// 没有可用的模型代理
    #[error("没有可用的模型代理: {model}")]
    NoAvailableAgent { model: String },

    /// 没有可用的密钥
    #[error("没有可用的密钥: {model}")]
    NoAvailableKey { model: String },

    /// 凭证交换失败
    #[error("凭证交换失败 ({provider}): {source}")]
    CredentialExchange {
        provider: String,
        #[source]
        source: UpstreamError,
    },

    /// 上游服务错误
    #[error("上游服务错误: {0}")]
    Upstream(#[from] UpstreamError),

    /// 额度账本写入失败
    #[error("额度账本错误: {message}")]
    Ledger {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 业务逻辑错误
    #[error("业务错误: {message}")]
    Business { message: String },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 附加了上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

impl ProxyError {
    /// 将错误转换为HTTP状态码和错误代码
    pub fn to_http_response_parts(&self) -> (StatusCode, &str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::Database { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            Self::Network { .. } => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            Self::Cache { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CACHE_ERROR"),
            Self::Registry { .. } => (StatusCode::SERVICE_UNAVAILABLE, "REGISTRY_ERROR"),
            Self::GroupNotFound { .. } => (StatusCode::FORBIDDEN, "GROUP_NOT_FOUND"),
            Self::GroupDisabled { .. } => (StatusCode::FORBIDDEN, "GROUP_DISABLED"),
            Self::GroupExpired { .. } => (StatusCode::FORBIDDEN, "GROUP_EXPIRED"),
            Self::GroupInsufficientQuota { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "GROUP_INSUFFICIENT_QUOTA")
            }
            Self::ModelNotFound { .. } => (StatusCode::NOT_FOUND, "MODEL_NOT_FOUND"),
            Self::NoAvailableAgent { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_AVAILABLE_MODEL_AGENT")
            }
            Self::NoAvailableKey { .. } => (StatusCode::SERVICE_UNAVAILABLE, "NO_AVAILABLE_KEY"),
            Self::CredentialExchange { .. } => {
                (StatusCode::BAD_GATEWAY, "CREDENTIAL_EXCHANGE_ERROR")
            }
            Self::Upstream(err) => (err.status_code(), err.error_code()),
            Self::Ledger { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "LEDGER_ERROR"),
            Self::Business { .. } => (StatusCode::BAD_REQUEST, "BUSINESS_ERROR"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            Self::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::Serialization { .. } => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 去掉上下文包装后的原始错误
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// 注册表或分组状态错误：终止请求，不重试，不计费
    pub fn is_registry_error(&self) -> bool {
        matches!(
            self.root(),
            Self::Registry { .. }
                | Self::GroupNotFound { .. }
                | Self::GroupDisabled { .. }
                | Self::GroupExpired { .. }
                | Self::GroupInsufficientQuota { .. }
                | Self::ModelNotFound { .. }
        )
    }

    /// 选择错误：代理或密钥池已无可用成员
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self.root(),
            Self::NoAvailableAgent { .. } | Self::NoAvailableKey { .. }
        )
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建数据库错误
    pub fn database<T: Into<String>>(message: T) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的数据库错误
    pub fn database_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建网络错误
    pub fn network<T: Into<String>>(message: T) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建缓存错误
    pub fn cache<T: Into<String>>(message: T) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的缓存错误
    pub fn cache_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建注册表错误
    pub fn registry<T: Into<String>>(message: T) -> Self {
        Self::Registry {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的注册表错误
    pub fn registry_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Registry {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn group_not_found<T: Into<String>>(group_id: T) -> Self {
        Self::GroupNotFound {
            group_id: group_id.into(),
        }
    }

    pub fn group_disabled<T: Into<String>>(group_id: T) -> Self {
        Self::GroupDisabled {
            group_id: group_id.into(),
        }
    }

    pub fn group_expired<T: Into<String>>(group_id: T) -> Self {
        Self::GroupExpired {
            group_id: group_id.into(),
        }
    }

    pub fn group_insufficient_quota<T: Into<String>>(group_id: T) -> Self {
        Self::GroupInsufficientQuota {
            group_id: group_id.into(),
        }
    }

    pub fn model_not_found<T: Into<String>>(model: T) -> Self {
        Self::ModelNotFound {
            model: model.into(),
        }
    }

    pub fn no_available_agent<T: Into<String>>(model: T) -> Self {
        Self::NoAvailableAgent {
            model: model.into(),
        }
    }

    pub fn no_available_key<T: Into<String>>(model: T) -> Self {
        Self::NoAvailableKey {
            model: model.into(),
        }
    }

    /// 创建凭证交换错误
    pub fn credential_exchange<T: Into<String>>(provider: T, source: UpstreamError) -> Self {
        Self::CredentialExchange {
            provider: provider.into(),
            source,
        }
    }

    /// 创建账本错误
    pub fn ledger<T: Into<String>>(message: T) -> Self {
        Self::Ledger {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的账本错误
    pub fn ledger_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Ledger {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建业务错误
    pub fn business<T: Into<String>>(message: T) -> Self {
        Self::Business {
            message: message.into(),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

// 自动转换常见错误类型
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<sea_orm::error::DbErr> for ProxyError {
    fn from(err: sea_orm::error::DbErr) -> Self {
        Self::database_with_source("数据库操作失败", err)
    }
}

// Redis错误转换
impl From<redis::RedisError> for ProxyError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_with_source("Redis操作失败", err)
    }
}

// Reqwest错误转换
impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        Self::network_with_source("HTTP请求失败", err)
    }
}

impl From<super::cache::CacheError> for ProxyError {
    fn from(err: super::cache::CacheError) -> Self {
        Self::cache_with_source(err.to_string(), err)
    }
}
