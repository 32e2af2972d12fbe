//! # 上游调用错误
//!
//! 提供商适配器与凭证交换返回的错误。故障转移控制器只依据这里的变体和
//! 结构化字段做分类，不解析适配器内部的协议细节。

use axum::http::StatusCode;
use thiserror::Error;

use crate::types::Usage;

/// 上游调用错误
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// 上游返回的结构化 API 错误
    #[error("上游 API 错误 ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        kind: Option<String>,
        message: String,
    },

    /// 请求体无法被上游接受或无法序列化
    #[error("请求格式错误: {0}")]
    MalformedRequest(String),

    /// 底层传输错误（连接、超时、TLS 等）
    #[error("传输错误: {0}")]
    Transport(String),

    /// 客户端取消了请求，携带取消前已产生的用量
    #[error("客户端取消请求")]
    Cancelled { partial_usage: Option<Usage> },

    /// 连接被对端中断
    #[error("连接已中断: {message}")]
    BrokenPipe {
        message: String,
        partial_usage: Option<Usage>,
    },

    /// 其他无法分类的错误
    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    /// 创建结构化 API 错误
    pub fn api(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.map(ToString::to_string),
            kind: None,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest(message.into())
    }

    /// 中断时已产生的用量
    pub fn partial_usage(&self) -> Option<&Usage> {
        match self {
            Self::Cancelled { partial_usage } | Self::BrokenPipe { partial_usage, .. } => {
                partial_usage.as_ref()
            }
            _ => None,
        }
    }

    /// 结构化错误的 HTTP 状态码
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            Self::Api { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            // nginx 约定的 499: 客户端关闭连接
            Self::Cancelled { .. } | Self::BrokenPipe { .. } => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) const fn error_code(&self) -> &'static str {
        match self {
            Self::Api { .. } => "UPSTREAM_API_ERROR",
            Self::MalformedRequest(_) => "MALFORMED_REQUEST",
            Self::Transport(_) => "UPSTREAM_TRANSPORT_ERROR",
            Self::Cancelled { .. } | Self::BrokenPipe { .. } => "CLIENT_CLOSED_REQUEST",
            Self::Other(_) => "UPSTREAM_ERROR",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Api {
                status: status.as_u16(),
                code: None,
                kind: None,
                message: err.to_string(),
            },
            None if err.is_builder() => Self::MalformedRequest(err.to_string()),
            None if err.is_decode() => Self::Other(err.to_string()),
            None => Self::Transport(err.to_string()),
        }
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionAborted => {
                Self::BrokenPipe {
                    message: err.to_string(),
                    partial_usage: None,
                }
            }
            _ => Self::Transport(err.to_string()),
        }
    }
}
