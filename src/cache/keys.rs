//! # 缓存键命名规范
//!
//! 所有键都带配置中的前缀，避免与同一 Redis 实例上的其他服务冲突

use std::fmt;

use crate::types::QuotaScope;

/// 缓存键类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    /// 配额计数器哈希 - `{prefix}:quota:{scope}:{id}`
    QuotaCounter { scope: QuotaScope, id: String },

    /// 交换得到的访问令牌 - `{prefix}:credential:{digest}`
    CredentialToken { digest: String },
}

impl CacheKey {
    /// 配额计数器哈希中保存余额的字段
    pub const QUOTA_FIELD: &'static str = "quota";

    pub fn quota_counter(scope: QuotaScope, id: impl Into<String>) -> Self {
        Self::QuotaCounter {
            scope,
            id: id.into(),
        }
    }

    pub fn credential_token(digest: impl Into<String>) -> Self {
        Self::CredentialToken {
            digest: digest.into(),
        }
    }

    /// 生成带前缀的键
    #[must_use]
    pub fn build(&self, prefix: &str) -> String {
        format!("{prefix}:{self}")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaCounter { scope, id } => write!(f, "quota:{scope}:{id}"),
            Self::CredentialToken { digest } => write!(f, "credential:{digest}"),
        }
    }
}
