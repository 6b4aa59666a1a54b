//! Webhook event fan-out
//!
//! The core announces call lifecycle changes; sinks decide what to do
//! with them (HTTP delivery, logging, test capture). Delivery is
//! fire-and-forget from the core's perspective.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

/// Events the core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookEvent {
    CallStarted,
    CallConnected,
    CallEnded,
    ExtensionRegistered,
    ExtensionUnregistered,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::CallStarted => "call.started",
            WebhookEvent::CallConnected => "call.connected",
            WebhookEvent::CallEnded => "call.ended",
            WebhookEvent::ExtensionRegistered => "extension.registered",
            WebhookEvent::ExtensionUnregistered => "extension.unregistered",
        }
    }
}

/// A webhook delivery target
pub trait WebhookSink: Send + Sync {
    fn deliver(&self, event: WebhookEvent, payload: &Value);
}

/// Fans events out to every registered sink
#[derive(Default)]
pub struct WebhookSystem {
    sinks: Vec<Arc<dyn WebhookSink>>,
}

impl WebhookSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn WebhookSink>) {
        self.sinks.push(sink);
    }

    pub fn trigger(&self, event: WebhookEvent, payload: Value) {
        for sink in &self.sinks {
            sink.deliver(event, &payload);
        }
    }
}

/// Sink that logs every event
pub struct LogSink;

impl WebhookSink for LogSink {
    fn deliver(&self, event: WebhookEvent, payload: &Value) {
        info!(event = event.as_str(), %payload, "webhook event");
    }
}

/// Sink that records events for test assertions
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<(WebhookEvent, Value)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(WebhookEvent, Value)> {
        self.events.lock().clone()
    }

    pub fn count_of(&self, event: WebhookEvent) -> usize {
        self.events.lock().iter().filter(|(e, _)| *e == event).count()
    }
}

impl WebhookSink for CollectingSink {
    fn deliver(&self, event: WebhookEvent, payload: &Value) {
        self.events.lock().push((event, payload.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_reach_every_sink() {
        let collector = Arc::new(CollectingSink::new());
        let mut system = WebhookSystem::new();
        system.add_sink(collector.clone());
        system.add_sink(Arc::new(LogSink));

        system.trigger(WebhookEvent::CallStarted, json!({"call_id": "x"}));
        system.trigger(WebhookEvent::CallEnded, json!({"call_id": "x"}));

        assert_eq!(collector.count_of(WebhookEvent::CallStarted), 1);
        assert_eq!(collector.count_of(WebhookEvent::CallEnded), 1);
        assert_eq!(collector.events()[0].1["call_id"], "x");
    }
}
