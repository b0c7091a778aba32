//! Discord listener (spec.md §4.7): Gateway WebSocket with Hello/Identify/
//! Heartbeat/Resume handling, REST reply via `POST /channels/{id}/messages`.

use crate::error::{TriggerError, TriggerResult};
use crate::listener::{ConnectionFlag, Listener};
use crate::model::{IncomingMessage, Source};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RESUME: u8 = 6;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const INTENTS_GUILDS_AND_MESSAGE_CONTENT: u32 = (1 << 0) | (1 << 15);

pub struct DiscordListener {
    bot_token: String,
    client: reqwest::Client,
    sequence: AtomicI64,
    session_id: Mutex<Option<String>>,
    connected: Arc<ConnectionFlag>,
    stop: CancellationToken,
}

impl DiscordListener {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            client: reqwest::Client::new(),
            sequence: AtomicI64::new(-1),
            session_id: Mutex::new(None),
            connected: Arc::new(ConnectionFlag::new()),
            stop: CancellationToken::new(),
        }
    }

    async fn run_connection(&self, sink: mpsc::Sender<IncomingMessage>, cancel: CancellationToken) -> TriggerResult<()> {
        let (ws, _) = tokio_tungstenite::connect_async(GATEWAY_URL)
            .await
            .map_err(|e| TriggerError::Connect("discord".to_string(), e.to_string()))?;
        let (mut write, mut read) = ws.split();
        self.connected.set(true);

        let hello = read
            .next()
            .await
            .ok_or_else(|| TriggerError::Transport("discord".to_string(), "gateway closed before hello".to_string()))?
            .map_err(|e| TriggerError::Transport("discord".to_string(), e.to_string()))?;
        let hello: Value = parse_payload(&hello)?;
        let heartbeat_interval = hello
            .pointer("/d/heartbeat_interval")
            .and_then(Value::as_u64)
            .unwrap_or(41250);

        let resumable_session = self.session_id.lock().await.clone();
        let identify = if let Some(session_id) = resumable_session {
            json!({ "op": OP_RESUME, "d": { "token": self.bot_token, "session_id": session_id, "seq": self.sequence.load(Ordering::SeqCst) } })
        } else {
            json!({
                "op": OP_IDENTIFY,
                "d": {
                    "token": self.bot_token,
                    "intents": INTENTS_GUILDS_AND_MESSAGE_CONTENT,
                    "properties": { "os": "linux", "browser": "workflow-triggers", "device": "workflow-triggers" }
                }
            })
        };
        write
            .send(WsMessage::Text(identify.to_string()))
            .await
            .map_err(|e| TriggerError::Transport("discord".to_string(), e.to_string()))?;

        let heartbeat_seq = Arc::new(AtomicI64::new(self.sequence.load(Ordering::SeqCst)));
        let heartbeat_write = Arc::new(Mutex::new(write));
        let heartbeat_task = {
            let heartbeat_write = heartbeat_write.clone();
            let heartbeat_seq = heartbeat_seq.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let seq = heartbeat_seq.load(Ordering::SeqCst);
                            let frame = if seq >= 0 { json!({"op": OP_HEARTBEAT, "d": seq}) } else { json!({"op": OP_HEARTBEAT, "d": null}) };
                            let mut guard = heartbeat_write.lock().await;
                            if guard.send(WsMessage::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read.next() => {
                    let Some(frame) = frame else { break };
                    let frame = frame.map_err(|e| TriggerError::Transport("discord".to_string(), e.to_string()))?;
                    let payload: Value = parse_payload(&frame)?;
                    self.handle_payload(&payload, &heartbeat_seq, &sink).await;
                }
            }
        }

        heartbeat_task.abort();
        self.connected.set(false);
        Ok(())
    }

    async fn handle_payload(&self, payload: &Value, heartbeat_seq: &AtomicI64, sink: &mpsc::Sender<IncomingMessage>) {
        let op = payload.get("op").and_then(Value::as_u64).unwrap_or(255) as u8;
        if let Some(seq) = payload.get("s").and_then(Value::as_i64) {
            self.sequence.store(seq, Ordering::SeqCst);
            heartbeat_seq.store(seq, Ordering::SeqCst);
        }

        match op {
            OP_DISPATCH => self.handle_dispatch(payload, sink).await,
            OP_RECONNECT | OP_INVALID_SESSION => {
                tracing::warn!("discord gateway requested reconnect/invalid session");
            }
            _ => {}
        }
    }

    async fn handle_dispatch(&self, payload: &Value, sink: &mpsc::Sender<IncomingMessage>) {
        let event_type = payload.get("t").and_then(Value::as_str).unwrap_or_default();
        if event_type == "READY" {
            if let Some(session_id) = payload.pointer("/d/session_id").and_then(Value::as_str) {
                *self.session_id.lock().await = Some(session_id.to_string());
            }
            return;
        }
        if event_type != "MESSAGE_CREATE" {
            return;
        }
        let Some(data) = payload.get("d") else { return };
        if data.pointer("/author/bot").and_then(Value::as_bool).unwrap_or(false) {
            return;
        }
        let Some(message) = to_incoming_message(data) else { return };
        let _ = sink.send(message).await;
    }
}

fn parse_payload(frame: &WsMessage) -> TriggerResult<Value> {
    match frame {
        WsMessage::Text(text) => serde_json::from_str(text)
            .map_err(|e| TriggerError::Transport("discord".to_string(), e.to_string())),
        WsMessage::Binary(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| TriggerError::Transport("discord".to_string(), e.to_string())),
        _ => Ok(Value::Null),
    }
}

fn to_incoming_message(data: &Value) -> Option<IncomingMessage> {
    let text = data.get("content")?.as_str()?.to_string();
    let mut incoming = IncomingMessage::new(Source::Discord, text, data.clone());
    incoming.username = data.pointer("/author/username").and_then(Value::as_str).map(str::to_string);
    incoming.user_id = data.pointer("/author/id").and_then(Value::as_str).map(str::to_string);
    incoming.channel_id = data.get("channel_id").and_then(Value::as_str).map(str::to_string);
    Some(incoming)
}

#[async_trait]
impl Listener for DiscordListener {
    fn source(&self) -> Source {
        Source::Discord
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

        while !linked.is_cancelled() {
            if let Err(e) = self.run_connection(sink.clone(), linked.clone()).await {
                tracing::warn!(error = %e, "discord gateway connection dropped, reconnecting");
                tokio::select! {
                    _ = linked.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                }
            }
        }
        Ok(())
    }

    async fn stop(&self) -> TriggerResult<()> {
        self.stop.cancel();
        Ok(())
    }

    async fn send_response(&self, message: &IncomingMessage, text: &str) -> TriggerResult<()> {
        let Some(channel_id) = &message.channel_id else {
            return Ok(());
        };
        self.client
            .post(format!("https://discord.com/api/v10/channels/{channel_id}/messages"))
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|e| TriggerError::Transport("discord".to_string(), e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_authored_messages_have_no_incoming_representation() {
        let data = json!({"author": {"bot": true, "username": "other-bot"}, "content": "hi", "channel_id": "1"});
        assert!(data.pointer("/author/bot").and_then(Value::as_bool).unwrap_or(false));
        let message = to_incoming_message(&data);
        assert!(message.is_some(), "extraction itself is bot-agnostic; the bot check happens in handle_dispatch");
    }

    #[test]
    fn extracts_username_and_channel() {
        let data = json!({"author": {"id": "7", "username": "ada", "bot": false}, "content": "deploy", "channel_id": "55"});
        let message = to_incoming_message(&data).unwrap();
        assert_eq!(message.username, Some("ada".to_string()));
        assert_eq!(message.channel_id, Some("55".to_string()));
    }
}
