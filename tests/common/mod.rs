//! 集成测试共用的注册表快照

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use api_relay::config::{CredentialConfig, GatewayConfig, SelectorConfig};
use api_relay::credential::{
    ClientCredentialsExchanger, CredentialExchanger, CredentialService, ExchangedToken,
};
use api_relay::error::UpstreamError;
use api_relay::registry::{MemoryRegistry, Provider, ProviderAuth, Registry, RegistrySnapshot};
use api_relay::resolver::Resolver;
use api_relay::selector::PoolSelector;
use async_trait::async_trait;
use serde_json::json;

/// 两个提供商、三个直连模型、一个代理模型和若干分组
pub fn snapshot() -> RegistrySnapshot {
    serde_json::from_value(json!({
        "providers": [
            { "id": "openai", "code": "openai", "base_url": "https://api.openai.test" },
            { "id": "azure", "code": "azure", "base_url": "https://azure.test", "path": "/openai/deployments/chat" }
        ],
        "users": [
            { "id": "u1" },
            { "id": "u2", "groups": ["vip", "basic"] }
        ],
        "apps": [
            { "id": "a1", "user_id": "u1" },
            { "id": "a2", "user_id": "u2" },
            { "id": "a3", "user_id": "u1", "group": "vip", "is_limit_quota": true, "quota": 1000 },
            { "id": "a4", "user_id": "u1", "models": ["m-mini"] }
        ],
        "app_keys": [
            { "key": "ak1", "app_id": "a1", "user_id": "u1" },
            { "key": "ak2", "app_id": "a2", "user_id": "u2" },
            { "key": "ak3", "app_id": "a3", "user_id": "u1" },
            { "key": "ak-off", "app_id": "a1", "user_id": "u1", "group": "off" },
            { "key": "ak-default", "app_id": "a1", "user_id": "u1", "group": "default" },
            { "key": "ak-agents", "app_id": "a1", "user_id": "u1", "group": "agents" },
            { "key": "ak4", "app_id": "a4", "user_id": "u1" }
        ],
        "groups": [
            {
                "id": "vip",
                "models": ["m-gpt4o"],
                "discount": 0.8,
                "is_limit_quota": true,
                "quota": 5000,
                "is_enable_forward": true,
                "forward_config": { "rule": "conditional", "keywords": ["翻译"], "target_model": "m-mini" }
            },
            { "id": "basic", "models": ["m-mini"] },
            { "id": "off", "status": "disabled", "models": ["m-gpt4o"] },
            { "id": "default", "is_default": true, "models": ["m-mini"] },
            { "id": "agents", "models": ["m-gpt4o"], "is_enable_model_agent": true, "model_agents": ["ag1"] }
        ],
        "models": [
            {
                "id": "m-gpt4o",
                "name": "gpt-4o",
                "model": "gpt-4o",
                "provider_id": "openai",
                "pricing": { "text": [{ "input_ratio": 1.0, "output_ratio": 2.0 }] },
                "is_enable_fallback": true,
                "fallback_config": { "model": "m-mini" },
                "is_enable_preset_config": true,
                "preset_config": { "system_prompt": "简洁回答", "max_tokens": 256 }
            },
            {
                "id": "m-mini",
                "name": "gpt-4o-mini",
                "model": "gpt-4o-mini",
                "provider_id": "openai",
                "pricing": { "text": [{ "input_ratio": 1.0, "output_ratio": 1.0 }] }
            },
            {
                "id": "m-o3",
                "name": "o3",
                "model": "o3",
                "provider_id": "openai",
                "is_enable_fallback": true,
                "fallback_config": { "model_agent": "ag1", "model": "m-mini" }
            },
            { "id": "m-embed", "name": "text-embedding-3", "model": "text-embedding-3-small", "provider_id": "openai", "type": "embedding" },
            { "id": "m-orphan", "name": "orphan", "model": "orphan", "provider_id": "openai" }
        ],
        "model_agents": [
            {
                "id": "ag1",
                "provider_id": "azure",
                "models": ["m-gpt4o", "m-o3"],
                "is_enable_model_replace": true,
                "replace_models": ["gpt-4o"],
                "target_models": ["gpt-4o-az"]
            }
        ],
        "keys": [
            { "id": "k1", "key": "sk-1", "provider_id": "openai", "models": ["m-gpt4o"] },
            { "id": "k2", "key": "sk-2", "provider_id": "openai", "models": ["m-mini", "m-embed"] },
            { "id": "k-az", "key": "az-1", "provider_id": "azure", "model_agents": ["ag1"] }
        ]
    }))
    .expect("快照应能解析")
}

/// 把 azure 改为 OAuth2 client credentials 认证
pub fn with_oauth_azure(mut snapshot: RegistrySnapshot) -> RegistrySnapshot {
    for provider in &mut snapshot.providers {
        if provider.id == "azure" {
            provider.auth = ProviderAuth::ClientCredentials {
                token_url: "https://login.azure.test/token".to_string(),
                scope: None,
            };
        }
    }
    snapshot
}

pub fn provider(snapshot: &RegistrySnapshot, id: &str) -> Provider {
    snapshot
        .providers
        .iter()
        .find(|provider| provider.id == id)
        .cloned()
        .expect("提供商应存在")
}

type ExchangeScript = dyn Fn(usize) -> Result<ExchangedToken, UpstreamError> + Send + Sync;

/// 按调用序号应答的令牌交换器
pub struct ScriptedExchanger {
    pub calls: AtomicUsize,
    script: Box<ExchangeScript>,
}

impl ScriptedExchanger {
    pub fn new(
        script: impl Fn(usize) -> Result<ExchangedToken, UpstreamError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        }
    }

    /// 每次交换得到 `token-<n>`，有效期一小时
    pub fn issuing() -> Self {
        Self::new(|n| {
            Ok(ExchangedToken {
                token: format!("token-{n}"),
                ttl: Duration::from_secs(3600),
            })
        })
    }

    pub fn failing(status: u16, code: Option<&'static str>) -> Self {
        Self::new(move |_| Err(UpstreamError::api(status, code, "token endpoint failed")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialExchanger for ScriptedExchanger {
    async fn exchange(
        &self,
        _provider: &Provider,
        _raw: &str,
    ) -> Result<ExchangedToken, UpstreamError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(n)
    }
}

pub fn registry() -> Arc<MemoryRegistry> {
    Arc::new(MemoryRegistry::from_snapshot(snapshot()).expect("快照应通过校验"))
}

/// 解析器及其共享的选择器
pub struct Resolving {
    pub registry: Arc<MemoryRegistry>,
    pub selector: Arc<PoolSelector>,
    pub credentials: Arc<CredentialService>,
    pub resolver: Arc<Resolver>,
}

pub fn resolving(config: &GatewayConfig) -> Resolving {
    resolving_from(
        snapshot(),
        Arc::new(ClientCredentialsExchanger::new()),
        config,
    )
}

pub fn resolving_from(
    snapshot: RegistrySnapshot,
    exchanger: Arc<dyn CredentialExchanger>,
    config: &GatewayConfig,
) -> Resolving {
    let registry =
        Arc::new(MemoryRegistry::from_snapshot(snapshot).expect("快照应通过校验"));
    let selector = Arc::new(PoolSelector::new(
        registry.clone(),
        &SelectorConfig::default(),
    ));
    let credentials = Arc::new(CredentialService::new(
        exchanger,
        None,
        &CredentialConfig::default(),
    ));
    let resolver = Arc::new(Resolver::new(
        registry.clone() as Arc<dyn Registry>,
        selector.clone(),
        credentials.clone(),
        config,
    ));
    Resolving {
        registry,
        selector,
        credentials,
        resolver,
    }
}
