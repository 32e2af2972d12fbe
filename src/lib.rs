//! # API Relay Library
//!
//! 多租户 AI 网关核心：请求解析、故障转移、计费与额度账本

pub mod app;
pub mod billing;
pub mod cache;
pub mod config;
pub mod credential;
pub mod database;
pub mod error;
pub mod failover;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod selector;
pub mod tokenizer;
pub mod types;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{ProxyError, Result};
pub use gateway::Gateway;
