//! # 缓存模块
//!
//! Redis 客户端与统一的键命名，供凭证令牌缓存与配额计数器使用

mod client;
mod keys;

pub use client::CacheClient;
pub use keys::CacheKey;
