//! # 模型定价配置
//!
//! 倍率 (ratio) 均以 token 等价额度表示：按量项的费用为 `ceil(数量 × 倍率)`，
//! 按次项的费用为 `ceil(quota_unit × once_ratio)`。

use serde::{Deserialize, Serialize};

/// 计费规则
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRule {
    /// 优先使用提供商返回的用量
    #[default]
    Official,
    /// 始终由系统分词器重新计算
    SystemComputed,
}

/// 计费方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMethod {
    /// 按计费项累加
    Tokens,
    /// 按次
    Once,
}

/// 计费项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingItem {
    Text,
    TextCache,
    TieredText,
    TieredTextCache,
    Image,
    ImageGeneration,
    ImageCache,
    Vision,
    Audio,
    AudioCache,
    Video,
    Search,
    Midjourney,
    Once,
}

/// 思考模式分区
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    #[default]
    All,
    Thinking,
    NonThinking,
}

impl ThinkingMode {
    pub const fn matches(self, thinking: bool) -> bool {
        match self {
            Self::All => true,
            Self::Thinking => thinking,
            Self::NonThinking => !thinking,
        }
    }
}

/// 文本定价，按服务等级区分
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextPricing {
    /// 为空表示默认等级
    pub service_tier: String,
    pub input_ratio: f64,
    pub output_ratio: f64,
}

/// 缓存读写定价
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePricing {
    pub service_tier: String,
    pub read_ratio: f64,
    pub write_ratio: f64,
}

/// 阶梯文本定价，区间为 `(gt, lte]`，`lte = 0` 表示无上限
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredTextPricing {
    pub gt: i64,
    pub lte: i64,
    pub mode: ThinkingMode,
    pub input_ratio: f64,
    pub output_ratio: f64,
    pub read_ratio: f64,
    pub write_ratio: f64,
}

impl TieredTextPricing {
    pub const fn contains(&self, prompt_tokens: i64) -> bool {
        prompt_tokens > self.gt && (self.lte == 0 || prompt_tokens <= self.lte)
    }
}

/// 图片 token 定价
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePricing {
    pub input_ratio: f64,
    pub output_ratio: f64,
}

/// 图片生成定价
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGenerationPricing {
    pub quality: String,
    pub width: u32,
    pub height: u32,
    pub once_ratio: f64,
    pub is_default: bool,
}

/// 识图定价，按 detail 匹配
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionPricing {
    pub mode: String,
    pub once_ratio: f64,
    pub is_default: bool,
}

/// 音频定价
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioPricing {
    /// 每个输入音频 token
    pub input_ratio: f64,
    /// 每个输出音频 token
    pub output_ratio: f64,
    /// 每个输入字符（语音合成）
    pub character_ratio: f64,
    /// 每分钟（语音识别），乘以 quota_unit
    pub minute_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoPricing {
    pub once_ratio: f64,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchPricing {
    pub context_size: String,
    pub once_ratio: f64,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidjourneyPricing {
    pub path: String,
    pub once_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OncePricing {
    pub once_ratio: f64,
}

/// 按次计费的定价项
pub trait FlatPricing {
    fn once_ratio(&self) -> f64;
}

impl FlatPricing for VideoPricing {
    fn once_ratio(&self) -> f64 {
        self.once_ratio
    }
}

impl FlatPricing for SearchPricing {
    fn once_ratio(&self) -> f64 {
        self.once_ratio
    }
}

impl FlatPricing for MidjourneyPricing {
    fn once_ratio(&self) -> f64 {
        self.once_ratio
    }
}

impl FlatPricing for OncePricing {
    fn once_ratio(&self) -> f64 {
        self.once_ratio
    }
}

fn default_billing_methods() -> Vec<BillingMethod> {
    vec![BillingMethod::Tokens]
}

/// 模型定价
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub billing_rule: BillingRule,
    #[serde(default = "default_billing_methods")]
    pub billing_methods: Vec<BillingMethod>,
    /// 为空时按模型类型推断
    pub billing_items: Vec<BillingItem>,
    pub text: Vec<TextPricing>,
    pub text_cache: Vec<CachePricing>,
    pub tiered_text: Vec<TieredTextPricing>,
    pub image: Option<ImagePricing>,
    pub image_cache: Option<CachePricing>,
    pub image_generation: Vec<ImageGenerationPricing>,
    pub vision: Vec<VisionPricing>,
    pub audio: Option<AudioPricing>,
    pub audio_cache: Option<CachePricing>,
    pub video: Vec<VideoPricing>,
    pub search: Vec<SearchPricing>,
    pub midjourney: Vec<MidjourneyPricing>,
    pub once: Option<OncePricing>,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            billing_rule: BillingRule::default(),
            billing_methods: default_billing_methods(),
            billing_items: Vec::new(),
            text: Vec::new(),
            text_cache: Vec::new(),
            tiered_text: Vec::new(),
            image: None,
            image_cache: None,
            image_generation: Vec::new(),
            vision: Vec::new(),
            audio: None,
            audio_cache: None,
            video: Vec::new(),
            search: Vec::new(),
            midjourney: Vec::new(),
            once: None,
        }
    }
}

impl Pricing {
    /// 仅按次计费
    pub fn is_once_exclusive(&self) -> bool {
        self.billing_methods.contains(&BillingMethod::Once)
            && !self.billing_methods.contains(&BillingMethod::Tokens)
    }

    /// 按服务等级选择文本定价，未匹配时使用最后一项
    pub fn text_for_tier(&self, service_tier: Option<&str>) -> Option<&TextPricing> {
        select_tier(&self.text, service_tier, |p| p.service_tier.as_str())
    }

    pub fn text_cache_for_tier(&self, service_tier: Option<&str>) -> Option<&CachePricing> {
        select_tier(&self.text_cache, service_tier, |p| p.service_tier.as_str())
    }

    /// 按提示 token 数与思考模式选择阶梯，未命中时使用该模式下最后一档
    pub fn tiered_text_for(
        &self,
        prompt_tokens: i64,
        thinking: bool,
    ) -> Option<&TieredTextPricing> {
        let mut candidates = self
            .tiered_text
            .iter()
            .filter(|tier| tier.mode.matches(thinking))
            .peekable();
        candidates.peek()?;

        let mut last = None;
        for tier in candidates {
            if tier.contains(prompt_tokens) {
                return Some(tier);
            }
            last = Some(tier);
        }
        last
    }

    /// 图片生成：(quality, width, height) 精确匹配，否则默认项
    pub fn image_generation_for(
        &self,
        quality: &str,
        width: u32,
        height: u32,
    ) -> Option<&ImageGenerationPricing> {
        self.image_generation
            .iter()
            .find(|p| p.quality == quality && p.width == width && p.height == height)
            .or_else(|| self.image_generation.iter().find(|p| p.is_default))
    }

    pub fn vision_for(&self, detail: &str) -> Option<&VisionPricing> {
        self.vision
            .iter()
            .find(|p| p.mode == detail)
            .or_else(|| self.vision.iter().find(|p| p.is_default))
    }

    pub fn video_default(&self) -> Option<&VideoPricing> {
        self.video
            .iter()
            .find(|p| p.is_default)
            .or_else(|| self.video.last())
    }

    pub fn search_for(&self, context_size: &str) -> Option<&SearchPricing> {
        self.search
            .iter()
            .find(|p| p.context_size == context_size)
            .or_else(|| self.search.iter().find(|p| p.is_default))
    }

    pub fn midjourney_for(&self, path: &str) -> Option<&MidjourneyPricing> {
        self.midjourney.iter().find(|p| p.path == path)
    }
}

fn select_tier<'a, T>(
    entries: &'a [T],
    service_tier: Option<&str>,
    tier_of: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    service_tier
        .filter(|tier| !tier.is_empty())
        .and_then(|tier| entries.iter().find(|entry| tier_of(entry) == tier))
        .or_else(|| entries.last())
}
