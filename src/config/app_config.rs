//! # 应用配置结构定义

use serde::{Deserialize, Serialize};

/// 应用主配置结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 数据库配置
    pub database: super::DatabaseConfig,
    /// 缓存配置
    pub cache: CacheConfig,
    /// 网关重试与后台任务配置
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// 额度账本配置
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// 计费配置
    #[serde(default)]
    pub billing: BillingConfig,
    /// 凭证交换配置
    #[serde(default)]
    pub credential: CredentialConfig,
    /// 选择器配置
    #[serde(default)]
    pub selector: SelectorConfig,
}

/// 缓存类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// 内存缓存
    #[default]
    Memory,
    /// Redis缓存
    Redis,
}

/// 缓存配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存类型，同时决定快速计数器存储的实现
    pub cache_type: CacheType,
    /// 内存缓存最大条目数
    pub memory_max_entries: u64,
    /// 注册表缓存过期时间（秒）
    pub default_ttl: u64,
    /// Redis 缓存配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Memory,
            memory_max_entries: 10000,
            default_ttl: 300,
            redis: None,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 所有键的前缀
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// 连接超时时间（秒）
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
}

fn default_key_prefix() -> String {
    "api_relay".to_string()
}

const fn default_connection_timeout() -> u64 {
    10
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: default_key_prefix(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

/// 网关配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 重试预算: 正数为最大重试次数；负数表示直到池中每个成员都试过一次；0 表示不重试
    pub retry: i32,
    /// 模型不受分词器支持时使用的默认模型
    pub default_tokenizer_model: String,
    /// 后台计费/账本任务的工作者数量
    pub worker_count: usize,
    /// 后台任务队列容量
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: 3,
            default_tokenizer_model: "gpt-4o".to_string(),
            worker_count: 4,
            queue_capacity: 1024,
        }
    }
}

/// 额度账本配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// 每个扣减步骤的最大尝试次数
    pub max_attempts: u32,
    /// 线性退避单位（毫秒），第 n 次重试前等待 n × unit
    pub backoff_unit_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit_ms: 200,
        }
    }
}

/// 计费配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// 按次计费项的额度单位，按次费用 = ceil(quota_unit × 倍率)
    pub quota_unit: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self { quota_unit: 1.0 }
    }
}

/// 凭证交换配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// 令牌在过期前多少秒视为需要刷新
    pub refresh_margin_secs: u64,
    /// 进程内令牌缓存容量
    pub cache_capacity: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 60,
            cache_capacity: 1000,
        }
    }
}

/// 选择器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// 连续错误达到该次数后自动禁用代理或密钥，0 表示不自动禁用
    pub error_threshold: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self { error_threshold: 5 }
    }
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        // 验证数据库配置
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        match self.cache.cache_type {
            CacheType::Memory => {
                if self.cache.redis.is_some() {
                    return Err("cache.redis 配置仅在 cache_type = \"redis\" 时可用".to_string());
                }
            }
            CacheType::Redis => {
                let redis = self
                    .cache
                    .redis
                    .as_ref()
                    .ok_or_else(|| "Redis cache configuration must be provided".to_string())?;

                if redis.url.is_empty() {
                    return Err("Redis URL cannot be empty".to_string());
                }
            }
        }

        if self.gateway.worker_count == 0 {
            return Err("gateway.worker_count must be greater than 0".to_string());
        }
        if self.gateway.queue_capacity == 0 {
            return Err("gateway.queue_capacity must be greater than 0".to_string());
        }
        if self.ledger.max_attempts == 0 {
            return Err("ledger.max_attempts must be greater than 0".to_string());
        }
        if !(self.billing.quota_unit.is_finite() && self.billing.quota_unit > 0.0) {
            return Err("billing.quota_unit must be a positive number".to_string());
        }

        Ok(())
    }

    /// 是否使用 Redis 作为远端存储
    pub const fn uses_redis(&self) -> bool {
        matches!(self.cache.cache_type, CacheType::Redis)
    }
}
