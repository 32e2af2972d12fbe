//! # 计费明细
//!
//! 每个计费项记录所用定价快照、计量数量与折算后的 token 等价费用。

use serde::Serialize;

use super::pricing::{
    AudioPricing, CachePricing, ImageGenerationPricing, ImagePricing, TextPricing,
    TieredTextPricing, VisionPricing,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextSpend {
    pub pricing: TextPricing,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub spend_tokens: i64,
}

/// 缓存读写费用，文本、图片、音频缓存共用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSpend {
    pub pricing: CachePricing,
    pub read_tokens: i64,
    pub write_tokens: i64,
    pub spend_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredTextSpend {
    pub pricing: TieredTextPricing,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub spend_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredTextCacheSpend {
    pub pricing: TieredTextPricing,
    pub read_tokens: i64,
    pub write_tokens: i64,
    pub spend_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSpend {
    pub pricing: ImagePricing,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub spend_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageGenerationSpend {
    pub pricing: ImageGenerationPricing,
    pub n: u32,
    pub spend_tokens: i64,
}

/// 按图片逐张计费
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisionSpend {
    /// 每张图片命中的定价
    pub pricing: Vec<VisionPricing>,
    pub spend_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioSpend {
    pub pricing: AudioPricing,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub characters: i64,
    pub minutes: f64,
    pub spend_tokens: i64,
}

/// 按次计费项：视频、搜索、Midjourney 与 once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatSpend {
    pub once_ratio: f64,
    pub spend_tokens: i64,
}

/// 一次调用的计费结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Spend {
    pub text: Option<TextSpend>,
    pub text_cache: Option<CacheSpend>,
    pub tiered_text: Option<TieredTextSpend>,
    pub tiered_text_cache: Option<TieredTextCacheSpend>,
    pub image: Option<ImageSpend>,
    pub image_generation: Option<ImageGenerationSpend>,
    pub image_cache: Option<CacheSpend>,
    pub vision: Option<VisionSpend>,
    pub audio: Option<AudioSpend>,
    pub audio_cache: Option<CacheSpend>,
    pub video: Option<FlatSpend>,
    pub search: Option<FlatSpend>,
    pub midjourney: Option<FlatSpend>,
    pub once: Option<FlatSpend>,
    /// 折扣后的总费用
    pub total_spend_tokens: i64,
    /// 实际应用的分组折扣
    pub group_discount: Option<f64>,
}

impl Spend {
    /// 除 once 外各计费项之和
    pub fn additive_sum(&self) -> i64 {
        [
            self.text.as_ref().map(|s| s.spend_tokens),
            self.text_cache.as_ref().map(|s| s.spend_tokens),
            self.tiered_text.as_ref().map(|s| s.spend_tokens),
            self.tiered_text_cache.as_ref().map(|s| s.spend_tokens),
            self.image.as_ref().map(|s| s.spend_tokens),
            self.image_generation.as_ref().map(|s| s.spend_tokens),
            self.image_cache.as_ref().map(|s| s.spend_tokens),
            self.vision.as_ref().map(|s| s.spend_tokens),
            self.audio.as_ref().map(|s| s.spend_tokens),
            self.audio_cache.as_ref().map(|s| s.spend_tokens),
            self.video.as_ref().map(|s| s.spend_tokens),
            self.search.as_ref().map(|s| s.spend_tokens),
            self.midjourney.as_ref().map(|s| s.spend_tokens),
        ]
        .into_iter()
        .flatten()
        .sum()
    }

    pub fn once_spend(&self) -> i64 {
        self.once.as_ref().map_or(0, |s| s.spend_tokens)
    }

    pub const fn is_free(&self) -> bool {
        self.total_spend_tokens == 0
    }
}
