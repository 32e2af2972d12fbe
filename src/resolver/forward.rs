use crate::registry::{ForwardConfig, ForwardRule};
use crate::types::GatewayRequest;

/// 请求是否命中转发规则
pub fn should_forward(config: &ForwardConfig, request: &GatewayRequest) -> bool {
    match config.rule {
        ForwardRule::All => true,
        ForwardRule::Conditional => {
            let Some(message) = request.last_user_message() else {
                return false;
            };
            let text = message.content.text();
            let keyword_hit = config
                .keywords
                .iter()
                .filter(|keyword| !keyword.is_empty())
                .any(|keyword| text.contains(keyword.as_str()));
            let length_hit =
                config.content_length > 0 && text.chars().count() >= config.content_length;
            keyword_hit || length_hit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use rstest::rstest;

    fn conditional(keywords: &[&str], content_length: usize) -> ForwardConfig {
        ForwardConfig {
            rule: ForwardRule::Conditional,
            keywords: keywords.iter().map(ToString::to_string).collect(),
            content_length,
            target_model: "m-big".to_string(),
        }
    }

    #[rstest]
    #[case(conditional(&["画"], 0), "帮我画一只猫", true)]
    #[case(conditional(&["画"], 0), "写一首诗", false)]
    #[case(conditional(&[], 5), "hello", true)]
    #[case(conditional(&[], 6), "hello", false)]
    #[case(conditional(&[""], 0), "anything", false)]
    fn test_conditional_rule(
        #[case] config: ForwardConfig,
        #[case] text: &str,
        #[case] expected: bool,
    ) {
        let request = GatewayRequest::chat(
            "gpt-4o",
            vec![Message::user("画"), Message::new("assistant", "ok"), Message::user(text)],
        );
        assert_eq!(should_forward(&config, &request), expected);
    }

    #[test]
    fn test_all_rule_always_forwards() {
        let config = ForwardConfig {
            rule: ForwardRule::All,
            ..conditional(&[], 0)
        };
        assert!(should_forward(&config, &GatewayRequest::chat("gpt-4o", vec![])));
    }

    #[test]
    fn test_conditional_without_user_message() {
        let request = GatewayRequest::chat("gpt-4o", vec![Message::system("画")]);
        assert!(!should_forward(&conditional(&["画"], 0), &request));
    }
}
