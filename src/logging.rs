//! # 日志配置模块
//!
//! 初始化 tracing 订阅器，并提供带请求 ID、阶段和组件字段的结构化日志宏

use std::env;
use std::fmt;
use tracing_subscriber::{
    EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// 请求处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStage {
    Startup,
    Shutdown,
    Resolve,
    Scheduling,
    Credential,
    Upstream,
    Failover,
    Billing,
    Ledger,
    Cache,
    Registry,
    BackgroundTask,
}

impl LogStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Resolve => "resolve",
            Self::Scheduling => "scheduling",
            Self::Credential => "credential",
            Self::Upstream => "upstream",
            Self::Failover => "failover",
            Self::Billing => "billing",
            Self::Ledger => "ledger",
            Self::Cache => "cache",
            Self::Registry => "registry",
            Self::BackgroundTask => "background_task",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 产生日志的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogComponent {
    Main,
    Resolver,
    Selector,
    Failover,
    Billing,
    Ledger,
    Cache,
    Credential,
    Registry,
    Tokenizer,
    WorkerPool,
    Gateway,
    Database,
}

impl LogComponent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Resolver => "resolver",
            Self::Selector => "selector",
            Self::Failover => "failover",
            Self::Billing => "billing",
            Self::Ledger => "ledger",
            Self::Cache => "cache",
            Self::Credential => "credential",
            Self::Registry => "registry",
            Self::Tokenizer => "tokenizer",
            Self::WorkerPool => "worker_pool",
            Self::Gateway => "gateway",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化 info 日志
///
/// `linfo!(request_id, stage, component, operation, message, key = value, ...)`
#[macro_export]
macro_rules! linfo {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::info!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg
        )
    };
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr, $($field:tt)+) => {
        ::tracing::info!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg,
            $($field)+
        )
    };
}

/// 结构化 debug 日志
#[macro_export]
macro_rules! ldebug {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::debug!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg
        )
    };
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr, $($field:tt)+) => {
        ::tracing::debug!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg,
            $($field)+
        )
    };
}

/// 结构化 warn 日志
#[macro_export]
macro_rules! lwarn {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::warn!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg
        )
    };
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr, $($field:tt)+) => {
        ::tracing::warn!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg,
            $($field)+
        )
    };
}

/// 结构化 error 日志
#[macro_export]
macro_rules! lerror {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::error!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg
        )
    };
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr, $($field:tt)+) => {
        ::tracing::error!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            message = %$msg,
            $($field)+
        )
    };
}

/// 初始化优化的日志系统
pub fn init_optimized_logging(log_level: Option<&String>) {
    let level = log_level.map_or("info", std::string::String::as_str);

    // 默认关闭数据库查询的详细日志
    let default_filter = format!(
        "{level},api_relay=debug,sqlx::query=off,sea_orm::query=warn,sqlx=warn"
    );

    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            tracing_fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();

    if env::var("RUST_LOG")
        .is_ok_and(|v| v.contains("sqlx::query=info") || v.contains("sqlx::query=debug"))
    {
        tracing::info!("SQLx database query logging enabled");
    } else {
        tracing::info!("SQLx database query logging disabled for production performance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_component_display() {
        assert_eq!(LogStage::BackgroundTask.to_string(), "background_task");
        assert_eq!(LogComponent::WorkerPool.to_string(), "worker_pool");
    }

    #[test]
    fn test_macros_expand_with_and_without_fields() {
        linfo!("req-1", LogStage::Resolve, LogComponent::Resolver, "resolve", "plan built");
        lwarn!(
            "req-1",
            LogStage::Failover,
            LogComponent::Failover,
            "retry",
            "retrying",
            attempt = 2,
            model = "gpt-4o"
        );
    }
}
