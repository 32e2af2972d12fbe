//! # 故障转移
//!
//! 把上游错误分为终止、可重试、可重试并禁用三类，并决定下一步是同跳重试、
//! 换回退代理、换回退模型还是放弃。

use std::sync::Arc;

use crate::error::{ProxyError, UpstreamError};
use crate::logging::{LogComponent, LogStage};
use crate::resolver::{DispatchPlan, FallbackHop, ResolveArgs, RetryContext};
use crate::selector::Selector;
use crate::{ldebug, linfo, lwarn};

/// 错误分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// 是否可以重试
    pub retry: bool,
    /// 是否应禁用当前凭证
    pub disable: bool,
}

impl Classification {
    pub const TERMINAL: Self = Self {
        retry: false,
        disable: false,
    };
    pub const RETRY: Self = Self {
        retry: true,
        disable: false,
    };
    pub const RETRY_AND_DISABLE: Self = Self {
        retry: true,
        disable: true,
    };
}

const CONTEXT_LENGTH_SIGNATURES: &[&str] = &["context_length_exceeded", "context length exceeded"];

const DISABLE_SIGNATURES: &[&str] = &[
    "invalid_api_key",
    "invalid api key",
    "invalid key",
    "incorrect api key",
    "invalid_client",
    "insufficient_quota",
    "insufficient quota",
];

fn matches_signature(code: Option<&str>, message: &str, signatures: &[&str]) -> bool {
    let code = code.map(str::to_lowercase);
    let message = message.to_lowercase();
    signatures.iter().any(|signature| {
        code.as_deref().is_some_and(|code| code.contains(signature)) || message.contains(signature)
    })
}

fn classify_upstream(err: &UpstreamError) -> Classification {
    match err {
        UpstreamError::Api {
            status,
            code,
            message,
            ..
        } => {
            if *status == 400
                && matches_signature(code.as_deref(), message, CONTEXT_LENGTH_SIGNATURES)
            {
                Classification::TERMINAL
            } else if matches!(status, 401 | 429)
                && matches_signature(code.as_deref(), message, DISABLE_SIGNATURES)
            {
                Classification::RETRY_AND_DISABLE
            } else {
                Classification::RETRY
            }
        }
        UpstreamError::MalformedRequest(_) | UpstreamError::Transport(_) => Classification::RETRY,
        UpstreamError::Cancelled { .. }
        | UpstreamError::BrokenPipe { .. }
        | UpstreamError::Other(_) => Classification::TERMINAL,
    }
}

/// 对错误分类；凭证交换错误按其上游错误分类
pub fn classify(err: &ProxyError) -> Classification {
    match err.root() {
        ProxyError::Upstream(upstream)
        | ProxyError::CredentialExchange {
            source: upstream, ..
        } => classify_upstream(upstream),
        _ => Classification::TERMINAL,
    }
}

/// 客户端取消或连接中断，按部分成功计费，不记录错误
pub fn is_aborted(err: &ProxyError) -> bool {
    matches!(
        err.root(),
        ProxyError::Upstream(UpstreamError::Cancelled { .. } | UpstreamError::BrokenPipe { .. })
    )
}

/// 当前回退跳的重试预算是否用尽
///
/// `retries` 是本跳已做过的重试次数。正数预算限制重试次数；负数预算表示直到
/// 池中每个成员（代理路由时按代理，否则按密钥）都试过一次；0 表示不重试。
pub fn is_max_retry(
    retry: i32,
    agent_routing: bool,
    agent_pool: usize,
    key_pool: usize,
    retries: u32,
) -> bool {
    match retry {
        0 => true,
        budget if budget > 0 => retries >= budget.unsigned_abs(),
        _ => {
            let pool = if agent_routing { agent_pool } else { key_pool };
            usize::try_from(retries).map_or(true, |retries| retries + 1 >= pool)
        }
    }
}

/// 失败后的下一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// 同一回退跳内重试
    Retry {
        args: ResolveArgs,
        retry: RetryContext,
    },
    /// 换回退代理
    FallbackAgent {
        args: ResolveArgs,
        retry: RetryContext,
    },
    /// 换回退模型
    FallbackModel {
        args: ResolveArgs,
        retry: RetryContext,
    },
    /// 客户端中断，按已产生的用量计费
    Aborted,
    /// 终止，把错误返回给调用方
    Fail,
}

/// 故障转移控制器
pub struct FailoverController {
    selector: Arc<dyn Selector>,
    retry: i32,
}

impl FailoverController {
    pub fn new(selector: Arc<dyn Selector>, retry: i32) -> Self {
        Self { selector, retry }
    }

    /// 根据本次尝试的计划与错误决定下一步
    pub async fn decide(
        &self,
        request_id: &str,
        plan: &DispatchPlan,
        err: &ProxyError,
    ) -> Decision {
        if is_aborted(err) {
            linfo!(request_id, LogStage::Failover, LogComponent::Failover, "request_aborted", "客户端中断请求");
            return Decision::Aborted;
        }

        let classification = classify(err);
        if !classification.retry {
            ldebug!(request_id, LogStage::Failover, LogComponent::Failover, "terminal_error", "错误不可重试", error = %err);
            return Decision::Fail;
        }

        let key = plan.key();
        let agent = plan.agent();
        self.selector
            .record_error(&plan.real_model, Some(key), agent)
            .await;

        let mut retry = plan.retry.clone();
        if classification.disable {
            self.selector.disable_key(key, &err.to_string()).await;
            retry.disable(agent.map(|a| a.id.as_str()), &key.id);
        }

        let exhausted = is_max_retry(
            self.retry,
            plan.route.is_agent_routing(),
            plan.agent_pool_size,
            plan.key_pool_size,
            retry.attempt,
        );
        if !exhausted {
            lwarn!(request_id, LogStage::Failover, LogComponent::Failover, "retry", "上游错误，重试", attempt = retry.attempt + 1, disable = classification.disable, error = %err);
            return Decision::Retry {
                args: plan.args.clone(),
                retry: retry.next_attempt(err.to_string()),
            };
        }

        let tried_agent = agent.map(|a| a.id.as_str());
        match plan.args.next_hop(&plan.req_model, tried_agent) {
            Some(FallbackHop::Agent(args)) => {
                lwarn!(request_id, LogStage::Failover, LogComponent::Failover, "fallback_agent", "重试用尽，切换回退代理", agent_id = ?args.fallback_agent);
                Decision::FallbackAgent {
                    args,
                    retry: retry.fallback(err.to_string()),
                }
            }
            Some(FallbackHop::Model(args)) => {
                lwarn!(request_id, LogStage::Failover, LogComponent::Failover, "fallback_model", "重试用尽，切换回退模型", model_id = ?args.fallback_model);
                Decision::FallbackModel {
                    args,
                    retry: retry.fallback(err.to_string()),
                }
            }
            None => Decision::Fail,
        }
    }
}
