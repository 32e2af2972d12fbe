use std::sync::Arc;

use super::pricing::{
    BillingItem, BillingMethod, BillingRule, CachePricing, FlatPricing, Pricing,
};
use super::spend::{
    AudioSpend, CacheSpend, FlatSpend, ImageGenerationSpend, ImageSpend, Spend, TextSpend,
    TieredTextCacheSpend, TieredTextSpend, VisionSpend,
};
use crate::config::BillingConfig;
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::registry::{Group, Model, ModelType};
use crate::resolver::DispatchPlan;
use crate::tokenizer::Tokenizer;
use crate::types::{GatewayRequest, Usage};

/// 未指定 detail 的图片按 auto 计费
const DEFAULT_IMAGE_DETAIL: &str = "auto";

/// 计费输入
#[derive(Debug, Clone, Copy)]
pub struct BillingInput<'a> {
    pub request_id: &'a str,
    pub request: &'a GatewayRequest,
    /// 提供商返回的用量
    pub usage: Option<&'a Usage>,
    /// 完整的回复文本，重新计数时使用
    pub completion: &'a str,
    /// 语音转写等按分钟计费的时长
    pub audio_minutes: f64,
}

impl<'a> BillingInput<'a> {
    pub const fn new(request_id: &'a str, request: &'a GatewayRequest) -> Self {
        Self {
            request_id,
            request,
            usage: None,
            completion: "",
            audio_minutes: 0.0,
        }
    }

    #[must_use]
    pub const fn with_usage(mut self, usage: Option<&'a Usage>) -> Self {
        self.usage = usage;
        self
    }

    #[must_use]
    pub const fn with_completion(mut self, completion: &'a str) -> Self {
        self.completion = completion;
        self
    }

    #[must_use]
    pub const fn with_audio_minutes(mut self, minutes: f64) -> Self {
        self.audio_minutes = minutes;
        self
    }
}

/// 按模型类型推断的默认计费项
pub const fn default_items(model_type: ModelType) -> &'static [BillingItem] {
    match model_type {
        ModelType::Text => &[BillingItem::Text, BillingItem::TextCache],
        ModelType::Multimodal => &[
            BillingItem::Text,
            BillingItem::TextCache,
            BillingItem::Image,
            BillingItem::ImageCache,
            BillingItem::Vision,
        ],
        ModelType::MultimodalAudio | ModelType::MultimodalRealtime => &[
            BillingItem::Text,
            BillingItem::TextCache,
            BillingItem::Audio,
            BillingItem::AudioCache,
        ],
        ModelType::ImageGeneration => &[BillingItem::ImageGeneration],
        ModelType::Embedding => &[BillingItem::Text],
        ModelType::Audio => &[BillingItem::Audio],
        ModelType::Video => &[BillingItem::Video],
        ModelType::Midjourney => &[BillingItem::Midjourney],
    }
}

/// 解析图片尺寸，支持 `×` `x` `X` `*` `:` 分隔
pub fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (width, height) = size.split_once(['×', 'x', 'X', '*', ':'])?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

/// 数量乘倍率后向上取整
fn ceil_spend(quantity: f64, ratio: f64) -> i64 {
    let spend = (quantity * ratio).ceil();
    if spend.is_finite() && spend > 0.0 {
        spend as i64
    } else {
        0
    }
}

fn ceil_tokens(tokens: i64, ratio: f64) -> i64 {
    ceil_spend(tokens as f64, ratio)
}

/// 计费引擎
///
/// 纯计算，相同输入总是得到相同结果。
pub struct BillingEngine {
    tokenizer: Arc<dyn Tokenizer>,
    quota_unit: f64,
}

/// 文本计量
#[derive(Debug, Clone, Copy)]
struct TextCounts {
    prompt: i64,
    completion: i64,
    /// 是否来自提供商用量
    from_usage: bool,
}

impl BillingEngine {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, config: &BillingConfig) -> Self {
        Self {
            tokenizer,
            quota_unit: config.quota_unit,
        }
    }

    /// 按调度计划计费
    pub fn billing(
        &self,
        plan: &DispatchPlan,
        input: &BillingInput<'_>,
        items: Option<&[BillingItem]>,
    ) -> Spend {
        self.billing_for(
            &plan.real_model,
            &plan.req_model.id,
            plan.group.as_ref(),
            input,
            items,
        )
    }

    /// 按模型与分组计费
    pub fn billing_for(
        &self,
        model: &Model,
        req_model_id: &str,
        group: Option<&Group>,
        input: &BillingInput<'_>,
        items: Option<&[BillingItem]>,
    ) -> Spend {
        let pricing = &model.pricing;
        let items: &[BillingItem] = match items {
            Some(items) => items,
            None if !pricing.billing_items.is_empty() => &pricing.billing_items,
            None => default_items(model.model_type),
        };
        let has = |item: BillingItem| items.contains(&item);

        let counts = self.text_counts(model, input);
        let usage = input.usage.copied().unwrap_or_default();
        let request = input.request;
        let mut spend = Spend::default();

        // 已单独计费的缓存、图片、音频 token 不再按文本计
        let mut text_input = counts.prompt;
        let mut text_output = counts.completion;
        if counts.from_usage {
            if has(BillingItem::TextCache) || has(BillingItem::TieredTextCache) {
                text_input -= usage.prompt_cached_text_tokens();
            }
            if has(BillingItem::Image) && pricing.image.is_some() {
                text_input -= usage.input_image_tokens();
                text_output -= usage.output_image_tokens();
            }
            if has(BillingItem::Audio) && pricing.audio.is_some() {
                text_input -= usage.input_audio_tokens();
                text_output -= usage.output_audio_tokens();
            }
        }
        let text_input = text_input.max(0);
        let text_output = text_output.max(0);

        if has(BillingItem::Text) {
            if let Some(price) = pricing.text_for_tier(request.service_tier.as_deref()) {
                spend.text = Some(TextSpend {
                    pricing: price.clone(),
                    input_tokens: text_input,
                    output_tokens: text_output,
                    spend_tokens: ceil_tokens(text_input, price.input_ratio)
                        + ceil_tokens(text_output, price.output_ratio),
                });
            }
        }

        if has(BillingItem::TextCache) {
            if let Some(price) = pricing.text_cache_for_tier(request.service_tier.as_deref()) {
                spend.text_cache = cache_spend(
                    price,
                    usage.text_cache_read_tokens(),
                    usage.text_cache_write_tokens(),
                );
            }
        }

        if has(BillingItem::TieredText) || has(BillingItem::TieredTextCache) {
            if let Some(band) = pricing.tiered_text_for(counts.prompt, request.thinking) {
                if has(BillingItem::TieredText) {
                    spend.tiered_text = Some(TieredTextSpend {
                        pricing: band.clone(),
                        input_tokens: text_input,
                        output_tokens: text_output,
                        spend_tokens: ceil_tokens(text_input, band.input_ratio)
                            + ceil_tokens(text_output, band.output_ratio),
                    });
                }
                let read = usage.text_cache_read_tokens();
                let write = usage.text_cache_write_tokens();
                if has(BillingItem::TieredTextCache) && (read > 0 || write > 0) {
                    spend.tiered_text_cache = Some(TieredTextCacheSpend {
                        pricing: band.clone(),
                        read_tokens: read,
                        write_tokens: write,
                        spend_tokens: ceil_tokens(read, band.read_ratio)
                            + ceil_tokens(write, band.write_ratio),
                    });
                }
            }
        }

        if has(BillingItem::Image) {
            if let Some(price) = &pricing.image {
                let input_tokens = usage.input_image_tokens();
                let output_tokens = usage.output_image_tokens();
                if input_tokens > 0 || output_tokens > 0 {
                    spend.image = Some(ImageSpend {
                        pricing: price.clone(),
                        input_tokens,
                        output_tokens,
                        spend_tokens: ceil_tokens(input_tokens, price.input_ratio)
                            + ceil_tokens(output_tokens, price.output_ratio),
                    });
                }
            }
        }

        if has(BillingItem::ImageCache) {
            if let Some(price) = &pricing.image_cache {
                spend.image_cache = cache_spend(price, usage.cached_image_tokens(), 0);
            }
        }

        if has(BillingItem::ImageGeneration) {
            spend.image_generation = self.image_generation_spend(pricing, request);
        }

        if has(BillingItem::Vision) {
            spend.vision = self.vision_spend(pricing, request);
        }

        if has(BillingItem::Audio) {
            if let Some(price) = &pricing.audio {
                let input_tokens = usage.input_audio_tokens();
                let output_tokens = usage.output_audio_tokens();
                let characters = request
                    .input
                    .as_deref()
                    .map_or(0, |text| text.chars().count() as i64);
                let minutes = input.audio_minutes.max(0.0);
                let spend_tokens = ceil_tokens(input_tokens, price.input_ratio)
                    + ceil_tokens(output_tokens, price.output_ratio)
                    + ceil_tokens(characters, price.character_ratio)
                    + ceil_spend(minutes * self.quota_unit, price.minute_ratio);
                if spend_tokens > 0 || input_tokens > 0 || output_tokens > 0 {
                    spend.audio = Some(AudioSpend {
                        pricing: price.clone(),
                        input_tokens,
                        output_tokens,
                        characters,
                        minutes,
                        spend_tokens,
                    });
                }
            }
        }

        if has(BillingItem::AudioCache) {
            if let Some(price) = &pricing.audio_cache {
                spend.audio_cache = cache_spend(price, usage.cached_audio_tokens(), 0);
            }
        }

        if has(BillingItem::Video) {
            spend.video = pricing.video_default().map(|p| self.flat(p));
        }

        if has(BillingItem::Search) {
            spend.search = request
                .web_search
                .as_ref()
                .and_then(|options| pricing.search_for(&options.search_context_size))
                .map(|p| self.flat(p));
        }

        if has(BillingItem::Midjourney) {
            spend.midjourney = request
                .midjourney_path
                .as_deref()
                .or(model.path.as_deref())
                .and_then(|path| pricing.midjourney_for(path))
                .map(|p| self.flat(p));
        }

        let once_billed =
            has(BillingItem::Once) || pricing.billing_methods.contains(&BillingMethod::Once);
        if once_billed {
            spend.once = pricing.once.as_ref().map(|p| self.flat(p));
        }

        let additive = spend.additive_sum();
        let mut total = if spend.once.is_some() && (pricing.is_once_exclusive() || additive == 0) {
            spend.once_spend()
        } else {
            additive + spend.once_spend()
        };

        if let Some(group) = group {
            let discount = group.discount;
            let offered = group.offers(&model.id) || group.offers(req_model_id);
            if offered && discount > 0.0 && discount < 1.0 {
                total = ceil_tokens(total, discount);
                spend.group_discount = Some(discount);
            }
        }
        spend.total_spend_tokens = total;

        ldebug!(input.request_id, LogStage::Billing, LogComponent::Billing, "billing_computed", "计费完成", model_id = %model.id, prompt_tokens = counts.prompt, completion_tokens = counts.completion, from_usage = counts.from_usage, total_spend_tokens = total, group_discount = ?spend.group_discount);
        spend
    }

    /// 提供商用量可用且计费规则不要求系统计算时直接使用，否则用分词器重新计数
    fn text_counts(&self, model: &Model, input: &BillingInput<'_>) -> TextCounts {
        if let Some(usage) = input.usage {
            if !usage.is_empty() && model.pricing.billing_rule != BillingRule::SystemComputed {
                return TextCounts {
                    prompt: usage.prompt_tokens,
                    completion: usage.completion_tokens,
                    from_usage: true,
                };
            }
        }

        let request = input.request;
        let name = model.model.as_str();
        let prompt_text = || {
            request
                .input
                .as_deref()
                .map_or(0, |text| self.tokenizer.count_tokens(name, text))
        };
        let (prompt, completion) = match model.model_type {
            ModelType::Text
            | ModelType::Multimodal
            | ModelType::MultimodalAudio
            | ModelType::MultimodalRealtime => {
                let prompt = if request.messages.is_empty() {
                    prompt_text()
                } else {
                    self.tokenizer.count_message_tokens(name, &request.messages)
                };
                (prompt, self.tokenizer.count_tokens(name, input.completion))
            }
            ModelType::Embedding
            | ModelType::Audio
            | ModelType::ImageGeneration
            | ModelType::Video
            | ModelType::Midjourney => (prompt_text(), 0),
        };
        TextCounts {
            prompt,
            completion,
            from_usage: false,
        }
    }

    fn image_generation_spend(
        &self,
        pricing: &Pricing,
        request: &GatewayRequest,
    ) -> Option<ImageGenerationSpend> {
        let options = request.image_generation.clone().unwrap_or_default();
        let (width, height) = parse_size(&options.size).unwrap_or((0, 0));
        let price = pricing.image_generation_for(&options.quality, width, height)?;
        let n = options.n.unwrap_or(1).max(1);
        Some(ImageGenerationSpend {
            pricing: price.clone(),
            n,
            spend_tokens: ceil_spend(self.quota_unit, price.once_ratio) * i64::from(n),
        })
    }

    fn vision_spend(&self, pricing: &Pricing, request: &GatewayRequest) -> Option<VisionSpend> {
        let mut matched = Vec::new();
        for message in &request.messages {
            for image in message.content.images() {
                let detail = image.detail.as_deref().unwrap_or(DEFAULT_IMAGE_DETAIL);
                if let Some(price) = pricing.vision_for(detail) {
                    matched.push(price.clone());
                }
            }
        }
        if matched.is_empty() {
            return None;
        }
        let spend_tokens = matched
            .iter()
            .map(|price| ceil_spend(self.quota_unit, price.once_ratio))
            .sum();
        Some(VisionSpend {
            pricing: matched,
            spend_tokens,
        })
    }

    fn flat(&self, pricing: &impl FlatPricing) -> FlatSpend {
        let once_ratio = pricing.once_ratio();
        FlatSpend {
            once_ratio,
            spend_tokens: ceil_spend(self.quota_unit, once_ratio),
        }
    }
}

fn cache_spend(pricing: &CachePricing, read: i64, write: i64) -> Option<CacheSpend> {
    if read <= 0 && write <= 0 {
        return None;
    }
    Some(CacheSpend {
        pricing: pricing.clone(),
        read_tokens: read,
        write_tokens: write,
        spend_tokens: ceil_tokens(read, pricing.read_ratio)
            + ceil_tokens(write, pricing.write_ratio),
    })
}
