//! Slack Events API verification and payload parsing (spec.md §4.7).
//! Delivered over HTTP, so this module is a pure helper consumed by the
//! `/slack/events` route in [`super::http`] rather than its own
//! long-running [`crate::listener::Listener`].

use crate::model::{IncomingMessage, Source};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

/// Verifies `X-Slack-Signature` against `v0=hmac_sha256(signingSecret,
/// "v0:"+ts+":"+body)` in constant time, and rejects timestamps older than
/// 300s (spec.md §4.7).
pub fn verify_signature(signing_secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else { return false };
    let now = chrono::Utc::now().timestamp();
    if (now - ts).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return false;
    }

    let Some(hex_sig) = signature.strip_prefix("v0=") else { return false };
    let Ok(expected_bytes) = hex_decode(hex_sig) else { return false };

    let Ok(mut mac) = HmacSha256::new_from_slice(signing_secret.as_bytes()) else { return false };
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);

    mac.verify_slice(&expected_bytes).is_ok()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Slack event envelope kinds relevant to trigger ingress.
pub enum SlackEvent {
    UrlVerification { challenge: String },
    Message(IncomingMessage),
    Ignored,
}

/// Parses a Slack Events API JSON body into the three outcomes the spec
/// calls for (spec.md §4.7: "Respond to `url_verification` with the
/// challenge; for `event_callback` type `message` without `subtype`,
/// enqueue the message.").
pub fn parse_event(body: &Value) -> SlackEvent {
    match body.get("type").and_then(Value::as_str) {
        Some("url_verification") => {
            let challenge = body.get("challenge").and_then(Value::as_str).unwrap_or_default();
            SlackEvent::UrlVerification { challenge: challenge.to_string() }
        }
        Some("event_callback") => {
            let Some(event) = body.get("event") else { return SlackEvent::Ignored };
            if event.get("type").and_then(Value::as_str) != Some("message") {
                return SlackEvent::Ignored;
            }
            if event.get("subtype").is_some() {
                return SlackEvent::Ignored;
            }
            let Some(text) = event.get("text").and_then(Value::as_str) else {
                return SlackEvent::Ignored;
            };
            let mut message = IncomingMessage::new(Source::Slack, text, body.clone());
            message.user_id = event.get("user").and_then(Value::as_str).map(str::to_string);
            message.channel_id = event.get("channel").and_then(Value::as_str).map(str::to_string);
            SlackEvent::Message(message)
        }
        _ => SlackEvent::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_timestamp_is_rejected() {
        let old_ts = (chrono::Utc::now().timestamp() - 1000).to_string();
        assert!(!verify_signature("secret", &old_ts, b"body", "v0=deadbeef"));
    }

    #[test]
    fn matching_hmac_verifies() {
        let secret = "shh";
        let ts = chrono::Utc::now().timestamp().to_string();
        let body = b"payload=1";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"v0:");
        mac.update(ts.as_bytes());
        mac.update(b":");
        mac.update(body);
        let tag = mac.finalize().into_bytes();
        let signature = format!("v0={}", tag.iter().map(|b| format!("{b:02x}")).collect::<String>());

        assert!(verify_signature(secret, &ts, body, &signature));
    }

    #[test]
    fn url_verification_returns_challenge() {
        let body = serde_json::json!({"type": "url_verification", "challenge": "abc123"});
        match parse_event(&body) {
            SlackEvent::UrlVerification { challenge } => assert_eq!(challenge, "abc123"),
            _ => panic!("expected url_verification"),
        }
    }

    #[test]
    fn message_with_subtype_is_ignored() {
        let body = serde_json::json!({
            "type": "event_callback",
            "event": {"type": "message", "subtype": "message_changed", "text": "edited"}
        });
        assert!(matches!(parse_event(&body), SlackEvent::Ignored));
    }

    #[test]
    fn plain_message_event_is_enqueued() {
        let body = serde_json::json!({
            "type": "event_callback",
            "event": {"type": "message", "text": "deploy please", "user": "U1", "channel": "C1"}
        });
        match parse_event(&body) {
            SlackEvent::Message(message) => {
                assert_eq!(message.text, "deploy please");
                assert_eq!(message.user_id, Some("U1".to_string()));
            }
            _ => panic!("expected message"),
        }
    }
}
