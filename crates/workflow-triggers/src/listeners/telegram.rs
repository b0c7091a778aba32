//! Telegram listener (spec.md §4.7): long-polls `getUpdates`, advances the
//! offset past the last update, replies via `sendMessage`.

use crate::error::{TriggerError, TriggerResult};
use crate::listener::{run_receive_loop, ConnectionFlag, Listener};
use crate::model::{IncomingMessage, Source};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct TelegramListener {
    token: String,
    client: reqwest::Client,
    offset: AtomicI64,
    connected: Arc<ConnectionFlag>,
    stop: CancellationToken,
}

impl TelegramListener {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client: reqwest::Client::new(),
            offset: AtomicI64::new(0),
            connected: Arc::new(ConnectionFlag::new()),
            stop: CancellationToken::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.token)
    }

    async fn poll_once(&self, sink: &mpsc::Sender<IncomingMessage>) -> TriggerResult<()> {
        let offset = self.offset.load(Ordering::SeqCst);
        let response = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[
                ("offset", (offset + 1).to_string()),
                ("timeout", "30".to_string()),
                ("allowed_updates", "[\"message\"]".to_string()),
            ])
            .send()
            .await
            .map_err(|e| TriggerError::Transport("telegram".to_string(), e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| TriggerError::Transport("telegram".to_string(), e.to_string()))?;

        let Some(updates) = body.get("result").and_then(Value::as_array) else {
            return Ok(());
        };

        for update in updates {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                self.offset.store(update_id, Ordering::SeqCst);
            }
            if let Some(message) = to_incoming_message(update) {
                let _ = sink.send(message).await;
            }
        }
        Ok(())
    }
}

fn to_incoming_message(update: &Value) -> Option<IncomingMessage> {
    let message = update.get("message")?;
    let text = message.get("text")?.as_str()?.to_string();
    let mut incoming = IncomingMessage::new(Source::Telegram, text, update.clone());
    incoming.username = message
        .pointer("/from/username")
        .and_then(Value::as_str)
        .map(str::to_string);
    incoming.user_id = message
        .pointer("/from/id")
        .map(|v| v.to_string());
    incoming.channel_id = message.pointer("/chat/id").map(|v| v.to_string());
    Some(incoming)
}

#[async_trait]
impl Listener for TelegramListener {
    fn source(&self) -> Source {
        Source::Telegram
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    async fn start(&self, sink: mpsc::Sender<IncomingMessage>, cancel: CancellationToken) -> TriggerResult<()> {
        let linked = cancel.child_token();
        let child = linked.clone();
        let self_stop = self.stop.clone();
        tokio::spawn(async move {
            self_stop.cancelled().await;
            child.cancel();
        });

        run_receive_loop("telegram", linked, self.connected.clone(), || self.poll_once(&sink)).await;
        Ok(())
    }

    async fn stop(&self) -> TriggerResult<()> {
        self.stop.cancel();
        Ok(())
    }

    async fn send_response(&self, message: &IncomingMessage, text: &str) -> TriggerResult<()> {
        let Some(chat_id) = &message.channel_id else {
            return Ok(());
        };
        self.client
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await
            .map_err(|e| TriggerError::Transport("telegram".to_string(), e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_username_and_chat_id_from_update() {
        let update = serde_json::json!({
            "update_id": 42,
            "message": {
                "text": "hello",
                "from": {"id": 7, "username": "ada"},
                "chat": {"id": 99}
            }
        });
        let message = to_incoming_message(&update).unwrap();
        assert_eq!(message.text, "hello");
        assert_eq!(message.username, Some("ada".to_string()));
        assert_eq!(message.channel_id, Some("99".to_string()));
    }

    #[test]
    fn non_message_update_yields_none() {
        let update = serde_json::json!({"update_id": 1, "edited_message": {}});
        assert!(to_incoming_message(&update).is_none());
    }
}
