//! # Redis 缓存客户端
//!
//! 提供 Redis 连接管理和基础操作

use std::time::Duration;

use redis::{AsyncCommands, Client, aio::ConnectionManager};

use super::CacheKey;
use crate::config::RedisConfig;
use crate::error::cache::CacheError;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// Redis 缓存客户端
#[derive(Clone)]
pub struct CacheClient {
    /// Redis 连接管理器
    connection_manager: ConnectionManager,
    /// 配置信息
    config: RedisConfig,
}

impl CacheClient {
    /// 创建新的缓存客户端
    pub async fn new(config: RedisConfig) -> Result<Self> {
        linfo!("system", LogStage::Startup, LogComponent::Cache, "connect_to_redis", "正在连接 Redis 服务器", url = %config.url);

        let client = Client::open(config.url.as_str())
            .map_err(|e| ProxyError::cache_with_source("创建 Redis 客户端失败", e))?;

        let connection_manager = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| {
            ProxyError::cache(format!(
                "建立 Redis 连接超时: {}s",
                config.connection_timeout
            ))
        })?
        .map_err(|e| ProxyError::cache_with_source("建立 Redis 连接失败", e))?;

        linfo!("system", LogStage::Startup, LogComponent::Cache, "redis_connected", "Redis 连接建立成功");

        Ok(Self {
            connection_manager,
            config,
        })
    }

    /// 生成带前缀的完整键
    pub fn key(&self, key: &CacheKey) -> String {
        key.build(&self.config.key_prefix)
    }

    /// 设置缓存值并指定 TTL
    pub async fn set_with_ttl(&self, key: &CacheKey, value: &str, ttl_seconds: u64) -> Result<()> {
        let key = self.key(key);
        ldebug!("system", LogStage::Cache, LogComponent::Cache, "set_cache", "设置缓存", key = %key, ttl = ttl_seconds);

        let mut conn = self.connection_manager.clone();
        conn.set_ex::<_, _, ()>(&key, value, ttl_seconds)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("设置缓存失败: {key}"), e))?;
        Ok(())
    }

    /// 获取缓存值
    pub async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        let key = self.key(key);
        let mut conn = self.connection_manager.clone();

        let result: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("获取缓存失败: {key}"), e))?;

        ldebug!("system", LogStage::Cache, LogComponent::Cache, "get_cache", "读取缓存", key = %key, hit = result.is_some());
        Ok(result)
    }

    /// 获取缓存剩余存活时间，键不存在或未设置过期时返回 None
    pub async fn ttl(&self, key: &CacheKey) -> Result<Option<u64>> {
        let key = self.key(key);
        let mut conn = self.connection_manager.clone();

        let ttl: i64 = conn
            .ttl(&key)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("获取缓存TTL失败: {key}"), e))?;
        Ok(u64::try_from(ttl).ok())
    }

    /// 原子地给哈希字段加上 `delta`，返回新值
    pub async fn hincr_by(&self, key: &CacheKey, field: &str, delta: i64) -> Result<i64> {
        let key = self.key(key);
        let mut conn = self.connection_manager.clone();

        let value: i64 = conn.hincr(&key, field, delta).await.map_err(|e| {
            ProxyError::cache_with_source(format!("更新哈希计数失败: {key}.{field}"), e)
        })?;

        ldebug!("system", LogStage::Cache, LogComponent::Cache, "hincr_by", "哈希计数已更新", key = %key, field = field, delta = delta, value = value);
        Ok(value)
    }

    /// 删除缓存
    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let key = self.key(key);
        let mut conn = self.connection_manager.clone();

        let deleted_count: i64 = conn
            .del(&key)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("删除缓存失败: {key}"), e))?;
        Ok(deleted_count > 0)
    }

    /// 测试连接
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection_manager.clone();

        let response: String = redis::Cmd::new()
            .arg("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::from)?;

        if response == "PONG" {
            Ok(())
        } else {
            Err(CacheError::unexpected_response(format!("Redis ping 响应异常: {response}")).into())
        }
    }

    /// 获取配置信息
    pub const fn config(&self) -> &RedisConfig {
        &self.config
    }
}
