//! HTTP webhook listener (spec.md §4.7): an in-process server accepting
//! POST on `/webhook`, `/trigger`, `/health`, and `/slack/events`.

use crate::error::TriggerResult;
use crate::listener::{ConnectionFlag, Listener};
use crate::listeners::slack::{self, SlackEvent};
use crate::model::{IncomingMessage, Source};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct AppState {
    sink: mpsc::Sender<IncomingMessage>,
    slack_signing_secret: Option<String>,
}

pub struct HttpWebhookListener {
    addr: SocketAddr,
    slack_signing_secret: Option<String>,
    connected: Arc<ConnectionFlag>,
    stop: CancellationToken,
}

impl HttpWebhookListener {
    pub fn new(addr: SocketAddr, slack_signing_secret: Option<String>) -> Self {
        Self {
            addr,
            slack_signing_secret,
            connected: Arc::new(ConnectionFlag::new()),
            stop: CancellationToken::new(),
        }
    }

    fn router(&self, sink: mpsc::Sender<IncomingMessage>) -> Router {
        let state = AppState { sink, slack_signing_secret: self.slack_signing_secret.clone() };
        Router::new()
            .route("/webhook", post(handle_generic_webhook))
            .route("/trigger", post(handle_generic_webhook))
            .route("/health", get(handle_health))
            .route("/slack/events", post(handle_slack_events))
            .with_state(state)
    }
}

async fn handle_health() -> impl IntoResponse {
    StatusCode::OK
}

/// Generic JSON webhook body: `text`/`message`/`body` becomes the message
/// text, other string fields become metadata, headers and query params
/// become `header:<name>` / `query:<name>` metadata (spec.md §4.7).
async fn handle_generic_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => serde_json::json!({}),
    };

    let text = ["text", "message", "body"]
        .iter()
        .find_map(|field| payload.get(field).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let mut message = IncomingMessage::new(Source::HttpWebhook, text, payload.clone());

    if let Value::Object(map) = &payload {
        for (key, value) in map {
            if matches!(key.as_str(), "text" | "message" | "body") {
                continue;
            }
            if let Some(s) = value.as_str() {
                message.extra.insert(key.clone(), s.to_string());
            }
        }
    }

    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if name_str.to_lowercase().starts_with("content-") {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            message.extra.insert(format!("header:{name_str}"), value_str.to_string());
        }
    }
    for (key, value) in &query {
        message.extra.insert(format!("query:{key}"), value.clone());
    }

    let _ = state.sink.send(message).await;
    StatusCode::OK.into_response()
}

async fn handle_slack_events(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(secret) = &state.slack_signing_secret {
        let timestamp = headers
            .get("X-Slack-Request-Timestamp")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let signature = headers
            .get("X-Slack-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !slack::verify_signature(secret, timestamp, &body, signature) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match slack::parse_event(&payload) {
        SlackEvent::UrlVerification { challenge } => challenge.into_response(),
        SlackEvent::Message(message) => {
            let _ = state.sink.send(message).await;
            StatusCode::OK.into_response()
        }
        SlackEvent::Ignored => StatusCode::OK.into_response(),
    }
}

#[async_trait]
impl Listener for HttpWebhookListener {
    fn source(&self) -> Source {
        Source::HttpWebhook
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

        let router = self.router(sink);
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| crate::error::TriggerError::Connect("http_webhook".to_string(), e.to_string()))?;
        self.connected.set(true);

        let shutdown = linked.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| crate::error::TriggerError::Transport("http_webhook".to_string(), e.to_string()))?;

        self.connected.set(false);
        Ok(())
    }

    async fn stop(&self) -> TriggerResult<()> {
        self.stop.cancel();
        Ok(())
    }

    /// Webhooks are fire-and-forget; there is no persistent connection to
    /// reply through.
    async fn send_response(&self, _message: &IncomingMessage, _text: &str) -> TriggerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generic_webhook_extracts_text_and_extra_metadata() {
        let (tx, mut rx) = mpsc::channel(8);
        let state = AppState { sink: tx, slack_signing_secret: None };
        let body = Bytes::from(serde_json::json!({"text": "deploy now", "env": "prod"}).to_string());
        let response = handle_generic_webhook(State(state), HeaderMap::new(), Query(HashMap::new()), body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let message = rx.try_recv().unwrap();
        assert_eq!(message.text, "deploy now");
        assert_eq!(message.extra.get("env"), Some(&"prod".to_string()));
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let response = handle_health().await;
        assert_eq!(response.into_response().status(), StatusCode::OK);
    }
}
