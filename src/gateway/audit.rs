//! # 审计记录
//!
//! 每个请求在终态时产生一条记录：成功、中断或失败。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::billing::Spend;
use crate::error::{ProxyError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::resolver::DispatchPlan;
use crate::types::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub user_id: String,
    pub app_id: String,
    pub outcome: AuditOutcome,
    /// 解析失败时为空
    pub req_model: Option<String>,
    pub real_model: Option<String>,
    pub agent_id: Option<String>,
    pub key_id: Option<String>,
    /// 当前回退跳内的尝试序号
    pub attempt: u32,
    pub is_fallback: bool,
    pub spend: Option<Spend>,
    pub error_code: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// 未生成调度计划的失败
    pub fn unresolved(ctx: &RequestContext, err: &ProxyError) -> Self {
        let (_, code) = err.to_http_response_parts();
        Self {
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id.clone(),
            app_id: ctx.app_id.clone(),
            outcome: AuditOutcome::Failed,
            req_model: None,
            real_model: None,
            agent_id: None,
            key_id: None,
            attempt: 0,
            is_fallback: false,
            spend: None,
            error_code: Some(code.to_string()),
            error: Some(err.to_string()),
            created_at: Utc::now(),
        }
    }

    pub fn from_plan(request_id: &str, plan: &DispatchPlan, outcome: AuditOutcome) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: plan.user.id.clone(),
            app_id: plan.app.id.clone(),
            outcome,
            req_model: Some(plan.req_model.id.clone()),
            real_model: Some(plan.real_model.id.clone()),
            agent_id: plan.agent().map(|agent| agent.id.clone()),
            key_id: Some(plan.key().id.clone()),
            attempt: plan.retry.attempt,
            is_fallback: plan.retry.is_fallback,
            spend: None,
            error_code: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_spend(mut self, spend: Spend) -> Self {
        self.spend = Some(spend);
        self
    }

    #[must_use]
    pub fn with_error(mut self, err: &ProxyError) -> Self {
        let (_, code) = err.to_http_response_parts();
        self.error_code = Some(code.to_string());
        self.error = Some(err.to_string());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;
}

/// 以结构化日志输出审计记录
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        let payload = serde_json::to_string(&record)?;
        linfo!(
            &record.request_id,
            LogStage::BackgroundTask,
            LogComponent::Gateway,
            "audit_record",
            "请求审计",
            outcome = ?record.outcome,
            total = record.spend.as_ref().map_or(0, |spend| spend.total_spend_tokens),
            record = %payload,
        );
        Ok(())
    }
}
