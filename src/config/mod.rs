//! # 配置管理模块
//!
//! 处理应用配置加载和验证。所有运行参数通过 `AppConfig` 显式传入各组件构造函数。

mod app_config;
mod database;

pub use app_config::{
    AppConfig, BillingConfig, CacheConfig, CacheType, CredentialConfig, GatewayConfig,
    LedgerConfig, RedisConfig, SelectorConfig,
};
pub use database::DatabaseConfig;

use std::env;
use std::path::Path;

use crate::error::{ProxyError, Result};

/// 加载配置文件
pub fn load_config() -> Result<AppConfig> {
    let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
    let config_file = format!("config/config.{env}.toml");
    load_config_from(&config_file)
}

/// 从指定路径加载配置文件
pub fn load_config_from(config_file: &str) -> Result<AppConfig> {
    if !Path::new(config_file).exists() {
        return Err(ProxyError::config(format!("配置文件不存在: {config_file}")));
    }

    let config_content = std::fs::read_to_string(config_file).map_err(|e| {
        ProxyError::config_with_source(format!("读取配置文件失败: {config_file}"), e)
    })?;

    parse_config(&config_content)
}

/// 解析并验证 TOML 配置
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;

    // 验证配置的有效性
    config.validate().map_err(ProxyError::config)?;

    Ok(config)
}
