use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{CredentialExchanger, ExchangedToken};
use crate::error::UpstreamError;
use crate::registry::{Provider, ProviderAuth};

/// 令牌端点未返回 `expires_in` 时使用的有效期
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth2 client credentials 交换器
///
/// 原始凭证格式为 `client_id:client_secret`。
#[derive(Debug, Clone)]
pub struct ClientCredentialsExchanger {
    http_client: reqwest::Client,
}

impl ClientCredentialsExchanger {
    pub fn new() -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http_client }
    }

    pub const fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

impl Default for ClientCredentialsExchanger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialExchanger for ClientCredentialsExchanger {
    async fn exchange(
        &self,
        provider: &Provider,
        raw: &str,
    ) -> Result<ExchangedToken, UpstreamError> {
        let ProviderAuth::ClientCredentials { token_url, scope } = &provider.auth else {
            return Err(UpstreamError::Other(format!(
                "提供商 {} 不使用令牌交换",
                provider.code
            )));
        };
        let (client_id, client_secret) = raw
            .split_once(':')
            .ok_or_else(|| UpstreamError::malformed("凭证格式应为 client_id:client_secret"))?;

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .http_client
            .post(token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed = serde_json::from_str::<TokenResponse>(&body).ok();

        if !status.is_success() {
            let (code, message) = match parsed {
                Some(TokenResponse {
                    error: Some(error),
                    error_description,
                    ..
                }) => {
                    let message = error_description.unwrap_or_else(|| error.clone());
                    (Some(error), message)
                }
                _ => (None, body),
            };
            return Err(UpstreamError::api(status.as_u16(), code.as_deref(), message));
        }

        let parsed =
            parsed.ok_or_else(|| UpstreamError::Other(format!("令牌响应无法解析: {body}")))?;
        let token = parsed
            .access_token
            .ok_or_else(|| UpstreamError::Other("令牌响应缺少 access_token".to_string()))?;

        Ok(ExchangedToken {
            token,
            ttl: parsed
                .expires_in
                .map_or(DEFAULT_TOKEN_TTL, Duration::from_secs),
        })
    }
}
