//! # 凭证服务
//!
//! 需要令牌交换的提供商（如 OAuth2 client credentials）由这里把原始凭证换成
//! bearer 令牌。令牌先查进程内 moka 缓存，再查 Redis，都未命中才调用交换器。
//! 缓存键是原始凭证的 SHA-256 十六进制摘要，原始凭证不会出现在缓存或日志中。

mod client_credentials;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use sha2::{Digest, Sha256};

use crate::cache::{CacheClient, CacheKey};
use crate::config::CredentialConfig;
use crate::error::{ProxyError, Result, UpstreamError};
use crate::logging::{LogComponent, LogStage};
use crate::registry::{Key, Provider};
use crate::{ldebug, linfo, lwarn};

pub use client_credentials::ClientCredentialsExchanger;

/// 交换得到的令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangedToken {
    pub token: String,
    /// 令牌有效期
    pub ttl: Duration,
}

/// 原始凭证到访问令牌的交换
#[async_trait]
pub trait CredentialExchanger: Send + Sync {
    async fn exchange(
        &self,
        provider: &Provider,
        raw: &str,
    ) -> std::result::Result<ExchangedToken, UpstreamError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// 原始凭证的缓存摘要
pub fn credential_digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// 两级缓存的凭证服务
pub struct CredentialService {
    exchanger: Arc<dyn CredentialExchanger>,
    local: Cache<String, CachedToken>,
    remote: Option<CacheClient>,
    refresh_margin: Duration,
}

impl CredentialService {
    pub fn new(
        exchanger: Arc<dyn CredentialExchanger>,
        remote: Option<CacheClient>,
        config: &CredentialConfig,
    ) -> Self {
        Self {
            exchanger,
            local: Cache::builder().max_capacity(config.cache_capacity).build(),
            remote,
            refresh_margin: Duration::from_secs(config.refresh_margin_secs),
        }
    }

    /// 得到发往上游的凭证材料
    ///
    /// 不需要交换的提供商直接返回原始凭证；交换失败返回 `CredentialExchange` 错误。
    pub async fn credential(
        &self,
        request_id: &str,
        provider: &Provider,
        key: &Key,
    ) -> Result<String> {
        if !provider.auth.requires_exchange() {
            return Ok(key.key.clone());
        }

        let digest = credential_digest(&key.key);
        if let Some(cached) = self.local.get(&digest).await {
            if cached.refresh_at > Instant::now() {
                return Ok(cached.token);
            }
            self.local.invalidate(&digest).await;
        }

        if let Some(token) = self.remote_get(request_id, &digest).await {
            return Ok(token);
        }

        ldebug!(request_id, LogStage::Credential, LogComponent::Credential, "exchange_token", "缓存未命中，交换访问令牌", provider = %provider.code, key_id = %key.id);
        let exchanged = self
            .exchanger
            .exchange(provider, &key.key)
            .await
            .map_err(|e| ProxyError::credential_exchange(provider.code.clone(), e))?;

        let usable = exchanged.ttl.saturating_sub(self.refresh_margin);
        if usable.is_zero() {
            lwarn!(request_id, LogStage::Credential, LogComponent::Credential, "short_lived_token", "令牌有效期短于刷新余量，不缓存", provider = %provider.code, ttl_secs = exchanged.ttl.as_secs());
            return Ok(exchanged.token);
        }

        self.local
            .insert(
                digest.clone(),
                CachedToken {
                    token: exchanged.token.clone(),
                    refresh_at: Instant::now() + usable,
                },
            )
            .await;
        self.remote_set(request_id, &digest, &exchanged.token, usable).await;

        linfo!(request_id, LogStage::Credential, LogComponent::Credential, "token_cached", "访问令牌已缓存", provider = %provider.code, usable_secs = usable.as_secs());
        Ok(exchanged.token)
    }

    /// 丢弃某个凭证的缓存令牌，下次使用时重新交换
    pub async fn invalidate(&self, key: &Key) -> Result<()> {
        let digest = credential_digest(&key.key);
        self.local.invalidate(&digest).await;
        if let Some(remote) = &self.remote {
            remote.delete(&CacheKey::credential_token(digest)).await?;
        }
        Ok(())
    }

    /// Redis 层读取失败只记录日志，按未命中处理
    async fn remote_get(&self, request_id: &str, digest: &str) -> Option<String> {
        let remote = self.remote.as_ref()?;
        let cache_key = CacheKey::credential_token(digest);
        let token = match remote.get(&cache_key).await {
            Ok(token) => token?,
            Err(e) => {
                lwarn!(request_id, LogStage::Credential, LogComponent::Credential, "remote_get_failed", "读取远端令牌缓存失败", error = %e);
                return None;
            }
        };
        let remaining = remote.ttl(&cache_key).await.ok().flatten().unwrap_or(0);
        if remaining > 0 {
            self.local
                .insert(
                    digest.to_string(),
                    CachedToken {
                        token: token.clone(),
                        refresh_at: Instant::now() + Duration::from_secs(remaining),
                    },
                )
                .await;
        }
        Some(token)
    }

    async fn remote_set(&self, request_id: &str, digest: &str, token: &str, ttl: Duration) {
        let Some(remote) = &self.remote else {
            return;
        };
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = remote
            .set_with_ttl(&CacheKey::credential_token(digest), token, ttl_secs)
            .await
        {
            lwarn!(request_id, LogStage::Credential, LogComponent::Credential, "remote_set_failed", "写入远端令牌缓存失败", error = %e);
        }
    }
}
