//! Template resolver (spec.md §4.7): replaces `{{name}}` tokens using a
//! fixed priority — regex captures, then well-known message fields, then
//! caller-supplied extra values, else empty.

use crate::model::IncomingMessage;
use std::collections::HashMap;

pub fn resolve(
    template: &str,
    captures: &HashMap<String, String>,
    message: &IncomingMessage,
    extra: &HashMap<String, String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after_open[..end].trim();
        let value = captures
            .get(name)
            .cloned()
            .or_else(|| message.well_known_field(name))
            .or_else(|| extra.get(name).cloned())
            .unwrap_or_default();
        out.push_str(&value);
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    #[test]
    fn capture_takes_priority_over_well_known_field() {
        let mut captures = HashMap::new();
        captures.insert("text".to_string(), "from-capture".to_string());
        let msg = IncomingMessage::new(Source::Slack, "original text", serde_json::json!({}));
        let resolved = resolve("{{text}}", &captures, &msg, &HashMap::new());
        assert_eq!(resolved, "from-capture");
    }

    #[test]
    fn falls_back_through_well_known_then_extra_then_empty() {
        let msg = IncomingMessage::new(Source::Slack, "hello", serde_json::json!({}));
        let mut extra = HashMap::new();
        extra.insert("env".to_string(), "prod".to_string());

        assert_eq!(resolve("{{text}}", &HashMap::new(), &msg, &extra), "hello");
        assert_eq!(resolve("{{env}}", &HashMap::new(), &msg, &extra), "prod");
        assert_eq!(resolve("{{missing}}", &HashMap::new(), &msg, &extra), "");
    }

    #[test]
    fn multiple_tokens_and_surrounding_text_are_preserved() {
        let msg = IncomingMessage::new(Source::Telegram, "hi", serde_json::json!({}));
        let resolved = resolve("user {{username}} said {{text}}!", &HashMap::new(), &msg, &HashMap::new());
        assert_eq!(resolved, "user  said hi!");
    }
}
