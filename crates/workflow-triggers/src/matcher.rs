//! Matcher (spec.md §4.7): evaluates an incoming message against trigger
//! rules in declaration order and returns the first match.

use crate::error::{TriggerError, TriggerResult};
use crate::model::{IncomingMessage, MatchKind, MatchResult, TriggerRule};
use regex::RegexBuilder;
use std::collections::HashMap;
use std::sync::Arc;

/// Compiles and caches each rule's regex once, up front, instead of on
/// every message (spec.md §4.7: "compile and cache a regex ... per rule").
pub struct Matcher {
    rules: Vec<TriggerRule>,
    compiled: HashMap<String, Arc<regex::Regex>>,
}

impl Matcher {
    pub fn new(rules: Vec<TriggerRule>) -> TriggerResult<Self> {
        let mut compiled = HashMap::new();
        for rule in &rules {
            if let MatchKind::Pattern { pattern } = &rule.matcher {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| TriggerError::InvalidPattern(rule.id.clone(), e.to_string()))?;
                compiled.insert(rule.id.clone(), Arc::new(re));
            }
        }
        Ok(Self { rules, compiled })
    }

    /// Returns the first matching rule in declaration order, or `None`.
    pub fn matches(&self, message: &IncomingMessage) -> Option<MatchResult> {
        for rule in &self.rules {
            if !rule.enabled || !rule.sources.contains(&message.source) {
                continue;
            }
            if let Some(captures) = self.evaluate(rule, message) {
                return Some(MatchResult { rule: rule.clone(), captures, message: message.clone() });
            }
        }
        None
    }

    fn evaluate(&self, rule: &TriggerRule, message: &IncomingMessage) -> Option<HashMap<String, String>> {
        match &rule.matcher {
            MatchKind::Keyword { keywords } => {
                let haystack = message.text.to_lowercase();
                let hit = keywords.iter().any(|kw| haystack.contains(&kw.to_lowercase()));
                hit.then(HashMap::new)
            }
            MatchKind::Pattern { .. } => {
                let re = self.compiled.get(&rule.id)?;
                let captures = re.captures(&message.text)?;
                let mut named = HashMap::new();
                for name in re.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        named.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                Some(named)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn rule(id: &str, matcher: MatchKind) -> TriggerRule {
        TriggerRule {
            id: id.to_string(),
            name: id.to_string(),
            sources: vec![Source::Telegram],
            enabled: true,
            matcher,
            workflow_path: "wf.yaml".to_string(),
            response_template: None,
            extra_template_values: HashMap::new(),
        }
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let matcher = Matcher::new(vec![rule(
            "deploy",
            MatchKind::Keyword { keywords: vec!["deploy".to_string()] },
        )])
        .unwrap();
        let msg = IncomingMessage::new(Source::Telegram, "please DEPLOY now", serde_json::json!({}));
        let result = matcher.matches(&msg).unwrap();
        assert_eq!(result.rule.id, "deploy");
        assert!(result.captures.is_empty());
    }

    #[test]
    fn pattern_match_exposes_named_captures() {
        let matcher = Matcher::new(vec![rule(
            "build",
            MatchKind::Pattern { pattern: r"build (?P<target>\w+)".to_string() },
        )])
        .unwrap();
        let msg = IncomingMessage::new(Source::Telegram, "please build frontend", serde_json::json!({}));
        let result = matcher.matches(&msg).unwrap();
        assert_eq!(result.captures.get("target"), Some(&"frontend".to_string()));
    }

    #[test]
    fn disabled_rule_or_wrong_source_never_matches() {
        let mut disabled = rule("x", MatchKind::Keyword { keywords: vec!["x".to_string()] });
        disabled.enabled = false;
        let matcher = Matcher::new(vec![disabled]).unwrap();
        let msg = IncomingMessage::new(Source::Telegram, "x", serde_json::json!({}));
        assert!(matcher.matches(&msg).is_none());
    }

    #[test]
    fn first_matching_rule_wins_in_declaration_order() {
        let matcher = Matcher::new(vec![
            rule("first", MatchKind::Keyword { keywords: vec!["go".to_string()] }),
            rule("second", MatchKind::Keyword { keywords: vec!["go".to_string()] }),
        ])
        .unwrap();
        let msg = IncomingMessage::new(Source::Telegram, "go go go", serde_json::json!({}));
        assert_eq!(matcher.matches(&msg).unwrap().rule.id, "first");
    }
}
