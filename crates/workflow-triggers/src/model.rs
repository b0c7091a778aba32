//! Wire types shared by every listener and by the matcher/dispatcher
//! pipeline (spec.md §4.7), grounded in `meridian-workflow::triggers::Event`
//! generalized from a single JSON payload to the listener-agnostic
//! `IncomingMessage` shape the spec requires.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Which listener produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Telegram,
    Discord,
    Slack,
    #[serde(rename = "http")]
    HttpWebhook,
    #[serde(rename = "filewatch")]
    FileWatch,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Source::Telegram => "telegram",
            Source::Discord => "discord",
            Source::Slack => "slack",
            Source::HttpWebhook => "http_webhook",
            Source::FileWatch => "file_watch",
        };
        write!(f, "{name}")
    }
}

/// A message normalized from any listener (spec.md §4.7: "`IncomingMessage`
/// carries `MessageId`, `Source`, `Text`, optional `Username`, `UserId`,
/// `ChannelId`, and a raw payload blob").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub source: Source,
    pub text: String,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
    pub raw: serde_json::Value,
}

impl IncomingMessage {
    pub fn new(source: Source, text: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            source,
            text: text.into(),
            username: None,
            user_id: None,
            channel_id: None,
            extra: HashMap::new(),
            raw,
        }
    }

    /// Resolves a well-known field by name, used by the template resolver's
    /// second-priority tier (spec.md §4.7).
    pub fn well_known_field(&self, name: &str) -> Option<String> {
        match name {
            "text" => Some(self.text.clone()),
            "username" => self.username.clone(),
            "userId" => self.user_id.clone(),
            "channelId" => self.channel_id.clone(),
            "messageId" => Some(self.message_id.clone()),
            "source" => Some(self.source.to_string()),
            _ => None,
        }
    }
}

/// How a rule decides whether a message matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchKind {
    /// Case-insensitive substring match against any of `keywords`.
    Keyword { keywords: Vec<String> },
    /// A regex (`IgnoreCase | Compiled` per spec.md §4.7); named groups
    /// become captures on a match.
    Pattern { pattern: String },
}

/// A declarative trigger rule: when it fires, what workflow it dispatches,
/// and how to answer the originating listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    /// Not a YAML key (spec.md §6 lists no `id` field); filled in from
    /// `name` by the loader when the document doesn't set one explicitly.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub sources: Vec<Source>,
    #[serde(default = "default_rule_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub matcher: MatchKind,
    pub workflow_path: String,
    #[serde(default)]
    pub response_template: Option<String>,
    #[serde(default, rename = "parameters")]
    pub extra_template_values: HashMap<String, String>,
}

fn default_rule_enabled() -> bool {
    true
}

/// Root document for a trigger file (spec.md §6: "`triggers:` list of
/// `{name, type, sources, ...}`").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriggerFile {
    #[serde(default)]
    pub triggers: Vec<TriggerRule>,
}

/// Result of a successful match: the rule plus the captures it produced.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub rule: TriggerRule,
    pub captures: HashMap<String, String>,
    pub message: IncomingMessage,
}
