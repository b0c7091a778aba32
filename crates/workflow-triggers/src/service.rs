//! Trigger service (spec.md §4.7): wires listeners to a bounded channel,
//! runs a single consumer that matches and dispatches, and emits an event
//! stream for observability.

use crate::dispatcher::{render_response, Dispatcher};
use crate::listener::Listener;
use crate::matcher::Matcher;
use crate::model::IncomingMessage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum TriggerEvent {
    MessageReceived { message_id: String, source: String },
    TriggerMatched { message_id: String, rule_id: String },
    TriggerDispatched { message_id: String, rule_id: String, run_id: String },
    TriggerDispatchFailed { message_id: String, rule_id: String, error: String },
    TriggerError { component: String, message: String },
}

pub type EventSink = mpsc::UnboundedSender<TriggerEvent>;

/// Bounded mailbox with drop-oldest backpressure (spec.md §4.7: "writes to
/// the channel (`DropOldest` when full)"). `tokio::sync::mpsc` blocks the
/// sender when full rather than dropping, so the mailbox is a small
/// mutex-guarded ring buffer instead: pushing past capacity evicts the
/// front entry before the new one is appended.
struct Mailbox {
    queue: Mutex<VecDeque<IncomingMessage>>,
    capacity: usize,
    notify: Notify,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), capacity, notify: Notify::new() }
    }

    async fn push(&self, message: IncomingMessage) {
        let mut guard = self.queue.lock().await;
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(message);
        drop(guard);
        self.notify.notify_one();
    }

    async fn pop(&self) -> IncomingMessage {
        loop {
            {
                let mut guard = self.queue.lock().await;
                if let Some(message) = guard.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }
}

pub struct TriggerService {
    listeners: Vec<Arc<dyn Listener>>,
    matcher: Arc<Matcher>,
    dispatcher: Arc<dyn Dispatcher>,
    events: Option<EventSink>,
    cancel: CancellationToken,
}

impl TriggerService {
    pub fn new(
        listeners: Vec<Arc<dyn Listener>>,
        matcher: Matcher,
        dispatcher: Arc<dyn Dispatcher>,
        events: Option<EventSink>,
    ) -> Self {
        Self {
            listeners,
            matcher: Arc::new(matcher),
            dispatcher,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Starts every listener and the single consumer, running until
    /// `shutdown()` is called.
    pub async fn run(&self) {
        let mailbox = Arc::new(Mailbox::new(CHANNEL_CAPACITY));
        let (internal_tx, mut internal_rx) = mpsc::channel::<IncomingMessage>(CHANNEL_CAPACITY);

        for listener in &self.listeners {
            let listener = listener.clone();
            let tx = internal_tx.clone();
            let cancel = self.cancel.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.start(tx, cancel).await {
                    emit(&events, TriggerEvent::TriggerError {
                        component: listener.source().to_string(),
                        message: e.to_string(),
                    });
                }
            });
        }
        drop(internal_tx);

        let feeder_mailbox = mailbox.clone();
        let feeder_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    message = internal_rx.recv() => {
                        match message {
                            Some(message) => feeder_mailbox.push(message).await,
                            None => break,
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = mailbox.pop() => self.handle_message(message).await,
            }
        }
    }

    async fn handle_message(&self, message: IncomingMessage) {
        emit(&self.events, TriggerEvent::MessageReceived {
            message_id: message.message_id.clone(),
            source: message.source.to_string(),
        });

        let Some(matched) = self.matcher.matches(&message) else {
            return;
        };
        emit(&self.events, TriggerEvent::TriggerMatched {
            message_id: message.message_id.clone(),
            rule_id: matched.rule.id.clone(),
        });

        match self.dispatcher.dispatch(&matched).await {
            Ok(run_id) => {
                emit(&self.events, TriggerEvent::TriggerDispatched {
                    message_id: message.message_id.clone(),
                    rule_id: matched.rule.id.clone(),
                    run_id,
                });
                if let Some(response) = render_response(&matched) {
                    if let Some(listener) = self.listeners.iter().find(|l| l.source() == message.source) {
                        if let Err(e) = listener.send_response(&message, &response).await {
                            emit(&self.events, TriggerEvent::TriggerError {
                                component: message.source.to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => {
                emit(&self.events, TriggerEvent::TriggerDispatchFailed {
                    message_id: message.message_id.clone(),
                    rule_id: matched.rule.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// `Shutdown`: cancel, stop all listeners in parallel, wait for the
    /// consumer with a grace period, then dispose (spec.md §4.7).
    pub async fn shutdown(&self, grace_period: Duration) {
        self.cancel.cancel();
        let stops = self.listeners.iter().map(|l| l.stop());
        let _ = tokio::time::timeout(grace_period, futures_util::future::join_all(stops)).await;
    }
}

fn emit(events: &Option<EventSink>, event: TriggerEvent) {
    if let Some(sink) = events {
        let _ = sink.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TriggerResult;
    use crate::model::{MatchKind, Source, TriggerRule};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc as tmpsc;

    struct StubListener {
        source: Source,
        responses: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Listener for StubListener {
        fn source(&self) -> Source {
            self.source
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn start(&self, _sink: tmpsc::Sender<IncomingMessage>, _cancel: CancellationToken) -> TriggerResult<()> {
            Ok(())
        }
        async fn stop(&self) -> TriggerResult<()> {
            Ok(())
        }
        async fn send_response(&self, _message: &IncomingMessage, text: &str) -> TriggerResult<()> {
            self.responses.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct CountingDispatcher(AtomicUsize);

    #[async_trait]
    impl Dispatcher for CountingDispatcher {
        async fn dispatch(&self, _matched: &crate::model::MatchResult) -> TriggerResult<String> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("run-{n}"))
        }
    }

    fn rule() -> TriggerRule {
        TriggerRule {
            id: "greet".to_string(),
            name: "greet".to_string(),
            sources: vec![Source::Telegram],
            enabled: true,
            matcher: MatchKind::Keyword { keywords: vec!["hello".to_string()] },
            workflow_path: "wf.yaml".to_string(),
            response_template: Some("hi {{username}}".to_string()),
            extra_template_values: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn matched_message_dispatches_and_sends_rendered_response() {
        let listener = Arc::new(StubListener { source: Source::Telegram, responses: std::sync::Mutex::new(Vec::new()) });
        let matcher = Matcher::new(vec![rule()]).unwrap();
        let dispatcher = Arc::new(CountingDispatcher(AtomicUsize::new(0)));
        let (events_tx, mut events_rx) = tmpsc::unbounded_channel();

        let service = TriggerService::new(
            vec![listener.clone() as Arc<dyn Listener>],
            matcher,
            dispatcher,
            Some(events_tx),
        );

        let mut message = IncomingMessage::new(Source::Telegram, "hello there", serde_json::json!({}));
        message.username = Some("ada".to_string());
        service.handle_message(message).await;

        assert_eq!(listener.responses.lock().unwrap().as_slice(), ["hi ada".to_string()]);

        let mut seen = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], TriggerEvent::MessageReceived { .. }));
        assert!(matches!(seen[1], TriggerEvent::TriggerMatched { .. }));
        assert!(matches!(seen[2], TriggerEvent::TriggerDispatched { .. }));
    }

    #[tokio::test]
    async fn non_matching_message_emits_only_received_event() {
        let listener = Arc::new(StubListener { source: Source::Telegram, responses: std::sync::Mutex::new(Vec::new()) });
        let matcher = Matcher::new(vec![rule()]).unwrap();
        let dispatcher = Arc::new(CountingDispatcher(AtomicUsize::new(0)));
        let (events_tx, mut events_rx) = tmpsc::unbounded_channel();

        let service = TriggerService::new(vec![listener], matcher, dispatcher, Some(events_tx));
        let message = IncomingMessage::new(Source::Telegram, "goodbye", serde_json::json!({}));
        service.handle_message(message).await;

        let event = events_rx.try_recv().unwrap();
        assert!(matches!(event, TriggerEvent::MessageReceived { .. }));
        assert!(events_rx.try_recv().is_err());
    }
}
