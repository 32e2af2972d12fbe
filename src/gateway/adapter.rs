//! # 提供商适配器接口
//!
//! 线上协议的转换由适配器实现，网关只看统一的请求、响应与流帧。

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::UpstreamError;
use crate::resolver::DispatchPlan;
use crate::types::{GatewayRequest, Usage};

/// 非流式调用结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamResponse {
    /// 已转换为统一格式的响应体
    pub body: serde_json::Value,
    /// 提供商报告的用量，缺失时按文本重新计数
    pub usage: Option<Usage>,
    /// 回复文本
    pub completion: String,
    /// 按分钟计费的音频时长
    pub audio_minutes: f64,
}

/// 流式响应中的一帧
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// 增量文本
    Delta(String),
    /// 提供商在流末尾给出的用量
    Usage(Usage),
    /// 流中途的错误，之后不再有帧
    Error(UpstreamError),
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn call(
        &self,
        plan: &DispatchPlan,
        request: &GatewayRequest,
    ) -> Result<UpstreamResponse, UpstreamError>;

    /// 建立流式调用；返回的通道关闭即表示流结束
    async fn stream(
        &self,
        plan: &DispatchPlan,
        request: &GatewayRequest,
    ) -> Result<mpsc::Receiver<StreamFrame>, UpstreamError>;
}
