use std::fmt;

pub type UserId = String;
pub type AppId = String;
pub type GroupId = String;
pub type ModelId = String;
pub type AgentId = String;
pub type KeyId = String;
pub type ProviderId = String;

/// 额度与计费统一使用的 token 等价单位
pub type QuotaValue = i64;

/// 单次请求的调用方身份，由上游鉴权层构造
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: UserId,
    pub app_id: AppId,
    /// 调用方使用的应用密钥
    pub app_key: String,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        user_id: impl Into<UserId>,
        app_id: impl Into<AppId>,
        app_key: impl Into<String>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            app_id: app_id.into(),
            app_key: app_key.into(),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// 额度账户层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaScope {
    User,
    App,
    AppKey,
    Group,
    Key,
}

impl QuotaScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::App => "app",
            Self::AppKey => "app_key",
            Self::Group => "group",
            Self::Key => "key",
        }
    }
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
