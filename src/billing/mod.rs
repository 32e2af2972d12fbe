//! # 计费
//!
//! 把用量与模型定价折算为各计费项的 token 等价费用，合计后按分组折扣取整。

mod engine;
pub mod pricing;
mod spend;

pub use engine::{BillingEngine, BillingInput, default_items, parse_size};
pub use pricing::{BillingItem, BillingMethod, BillingRule, Pricing};
pub use spend::{
    AudioSpend, CacheSpend, FlatSpend, ImageGenerationSpend, ImageSpend, Spend, TextSpend,
    TieredTextCacheSpend, TieredTextSpend, VisionSpend,
};
