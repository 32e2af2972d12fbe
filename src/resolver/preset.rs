use crate::registry::PresetConfig;
use crate::types::{GatewayRequest, Message};

/// 把模型预设应用到发往上游的请求
///
/// 系统提示插到消息列表开头；`max_tokens` 取请求值与预设上限中较小者。
pub fn apply_preset(request: &mut GatewayRequest, preset: &PresetConfig) {
    if let Some(prompt) = preset.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        request.messages.insert(0, Message::system(prompt));
    }
    if let Some(limit) = preset.max_tokens {
        request.max_tokens =
            Some(request.max_tokens.map_or(limit, |requested| requested.min(limit)));
    }
}
