//! # 分词计数
//!
//! 上游未返回用量或计费规则要求系统自行计算时，用分词器重新统计 token 数。

use tiktoken_rs::{CoreBPE, tokenizer};

use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::types::Message;

/// token 计数接口，未知模型回落到默认模型
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, model: &str, text: &str) -> i64;

    /// 统计消息列表中文本部分的 token 数，含每条消息的固定开销
    fn count_message_tokens(&self, model: &str, messages: &[Message]) -> i64;
}

/// 每条消息的固定开销与回复引导开销
const TOKENS_PER_MESSAGE: i64 = 3;
const TOKENS_PER_NAME: i64 = 1;
const REPLY_PRIMING_TOKENS: i64 = 3;

/// 基于 tiktoken 的计数器
#[derive(Debug, Clone)]
pub struct TiktokenCounter {
    default_model: String,
}

impl TiktokenCounter {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
        }
    }

    fn bpe_for_model(&self, model: &str) -> &'static CoreBPE {
        let resolved = tokenizer::get_tokenizer(model).or_else(|| {
            ldebug!("system", LogStage::Billing, LogComponent::Tokenizer, "tokenizer_fallback", "未知模型，使用默认分词模型", model = model, default_model = %self.default_model);
            tokenizer::get_tokenizer(&self.default_model)
        });
        match resolved.unwrap_or(tokenizer::Tokenizer::Cl100kBase) {
            tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
            tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
            tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
            tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
            tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
            tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
                tiktoken_rs::r50k_base_singleton()
            }
        }
    }
}

fn encoded_len(bpe: &CoreBPE, text: &str) -> i64 {
    i64::try_from(bpe.encode_with_special_tokens(text).len()).unwrap_or(i64::MAX)
}

impl Tokenizer for TiktokenCounter {
    fn count_tokens(&self, model: &str, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        encoded_len(self.bpe_for_model(model), text)
    }

    fn count_message_tokens(&self, model: &str, messages: &[Message]) -> i64 {
        if messages.is_empty() {
            return 0;
        }
        let bpe = self.bpe_for_model(model);
        let mut total: i64 = 0;
        for message in messages {
            total = total
                .saturating_add(TOKENS_PER_MESSAGE)
                .saturating_add(encoded_len(bpe, &message.role))
                .saturating_add(encoded_len(bpe, &message.content.text()));
            if let Some(name) = &message.name {
                total = total
                    .saturating_add(encoded_len(bpe, name))
                    .saturating_add(TOKENS_PER_NAME);
            }
        }
        total.saturating_add(REPLY_PRIMING_TOKENS)
    }
}
