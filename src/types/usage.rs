//! # 用量计数
//!
//! 兼容 OpenAI 风格 (`prompt_tokens_details`) 与 Claude 风格
//! (`cache_creation_input_tokens` / `cache_read_input_tokens`) 的用量字段。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachedTokensDetails {
    pub text_tokens: i64,
    pub audio_tokens: i64,
    pub image_tokens: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTokensDetails {
    /// 已包含在 prompt_tokens 中的缓存命中数
    pub cached_tokens: i64,
    pub text_tokens: i64,
    pub audio_tokens: i64,
    pub image_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens_details: Option<CachedTokensDetails>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionTokensDetails {
    pub reasoning_tokens: i64,
    pub audio_tokens: i64,
    pub image_tokens: i64,
    pub cached_tokens: i64,
}

/// 图片接口的输入用量明细
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputTokensDetails {
    pub text_tokens: i64,
    pub image_tokens: i64,
    pub cached_tokens: i64,
}

/// 提供商返回的用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens_details: Option<InputTokensDetails>,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl Usage {
    pub const fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: None,
            completion_tokens_details: None,
            input_tokens_details: None,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        }
    }

    /// 主计数全为零，视为提供商未返回用量
    pub const fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }

    fn prompt_details(&self) -> PromptTokensDetails {
        self.prompt_tokens_details.unwrap_or_default()
    }

    fn completion_details(&self) -> CompletionTokensDetails {
        self.completion_tokens_details.unwrap_or_default()
    }

    fn cached_details(&self) -> CachedTokensDetails {
        self.prompt_details().cached_tokens_details.unwrap_or_default()
    }

    /// 包含在 prompt_tokens 内的文本缓存命中数
    pub fn prompt_cached_text_tokens(&self) -> i64 {
        let details = self.prompt_details();
        details
            .cached_tokens_details
            .map_or(details.cached_tokens, |cached| cached.text_tokens)
    }

    /// 文本缓存读取: prompt/completion 缓存字段与 Claude 的 cache_read 字段之和
    pub fn text_cache_read_tokens(&self) -> i64 {
        self.prompt_cached_text_tokens()
            + self.completion_details().cached_tokens
            + self.cache_read_input_tokens
    }

    /// 文本缓存写入
    pub const fn text_cache_write_tokens(&self) -> i64 {
        self.cache_creation_input_tokens
    }

    pub fn input_image_tokens(&self) -> i64 {
        self.prompt_details().image_tokens
            + self.input_tokens_details.map_or(0, |details| details.image_tokens)
    }

    pub fn output_image_tokens(&self) -> i64 {
        self.completion_details().image_tokens
    }

    pub fn cached_image_tokens(&self) -> i64 {
        self.cached_details().image_tokens
            + self.input_tokens_details.map_or(0, |details| details.cached_tokens)
    }

    pub fn input_audio_tokens(&self) -> i64 {
        self.prompt_details().audio_tokens
    }

    pub fn output_audio_tokens(&self) -> i64 {
        self.completion_details().audio_tokens
    }

    pub fn cached_audio_tokens(&self) -> i64 {
        self.cached_details().audio_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_style_cache_fields() {
        let usage: Usage = serde_json::from_value(serde_json::json!({
            "prompt_tokens": 10,
            "completion_tokens": 5,
            "cache_creation_input_tokens": 200,
            "cache_read_input_tokens": 300
        }))
        .unwrap();

        assert_eq!(usage.text_cache_read_tokens(), 300);
        assert_eq!(usage.text_cache_write_tokens(), 200);
        assert_eq!(usage.prompt_cached_text_tokens(), 0);
    }

    #[test]
    fn test_openai_style_cached_details_prefer_text_breakdown() {
        let usage: Usage = serde_json::from_value(serde_json::json!({
            "prompt_tokens": 1000,
            "completion_tokens": 10,
            "prompt_tokens_details": {
                "cached_tokens": 600,
                "cached_tokens_details": {"text_tokens": 500, "image_tokens": 100}
            }
        }))
        .unwrap();

        assert_eq!(usage.prompt_cached_text_tokens(), 500);
        assert_eq!(usage.cached_image_tokens(), 100);
        assert_eq!(usage.text_cache_read_tokens(), 500);
    }

    #[test]
    fn test_empty_usage() {
        assert!(Usage::default().is_empty());
        assert!(!Usage::new(1, 0).is_empty());
    }
}
