use thiserror::Error;

/// 缓存及 Redis 相关的错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("缓存响应异常: {0}")]
    UnexpectedResponse(String),

    #[error("Redis 客户端错误: {0}")]
    Redis(#[from] redis::RedisError),
}

impl CacheError {
    pub fn unexpected_response(message: impl Into<String>) -> Self {
        Self::UnexpectedResponse(message.into())
    }
}
