//! Automatic capture of failures the application did not report itself
//!
//! - [`CaptureLayer`] turns `tracing` ERROR events into telemetry events
//!   when `auto_capture.errors` is set.
//! - [`install_panic_hook`] reports panics from any thread when
//!   `auto_capture.panics` is set, then defers to the previous hook.
//!
//! Neither reports anything raised inside the queue's own storage or
//! online-check callbacks.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Level as TracingLevel, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::client::Client;
use crate::event::{Event, ExceptionInfo, Level};
use crate::queue::in_queue_callback;

/// Events from these targets are never captured, so queue diagnostics
/// cannot feed back into the queue.
const INTERNAL_TARGET: &str = "faultline_core";

/// Visitor that extracts the message and fields from a tracing event
#[derive(Default)]
struct FieldVisitor {
    fields: Map<String, Value>,
    message: Option<String>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value_str = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(value_str);
        } else {
            self.insert(field, Value::String(value_str));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.insert(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// `tracing` layer reporting ERROR events through a [`Client`]
pub struct CaptureLayer {
    client: Arc<Client>,
}

impl CaptureLayer {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() != TracingLevel::ERROR
            || metadata.target().starts_with(INTERNAL_TARGET)
            || !self.client.settings().auto_capture.errors
            || in_queue_callback()
        {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut captured = Event::new(
            Level::Error,
            visitor.message.unwrap_or_else(|| metadata.name().to_string()),
        );
        captured.extra = visitor.fields;
        captured
            .extra
            .insert("logger".to_string(), Value::String(metadata.target().to_string()));
        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            captured
                .extra
                .insert("location".to_string(), Value::String(format!("{file}:{line}")));
        }

        self.client.capture_event(captured);
    }
}

/// Report panics through `client`, chaining the previously installed hook
pub fn install_panic_hook(client: Arc<Client>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if client.settings().auto_capture.panics && !in_queue_callback() {
            let payload = info.payload();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "Box<dyn Any>".to_string());

            let mut event = Event::new(Level::Fatal, message.clone());
            event.exception = Some(ExceptionInfo {
                kind: "panic".to_string(),
                value: message,
                chain: Vec::new(),
            });
            event.fingerprint = Some(event.compute_fingerprint());
            if let Some(location) = info.location() {
                event.extra.insert(
                    "location".to_string(),
                    Value::String(format!("{}:{}", location.file(), location.line())),
                );
            }
            if let Some(name) = std::thread::current().name() {
                event
                    .extra
                    .insert("thread".to_string(), Value::String(name.to_string()));
            }

            client.capture_event(event);
        }
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::queue::{EventQueue, QueueOptions};
    use crate::resolver::{resolve, ConfigInput};
    use crate::storage::{MemoryStorage, StorageAdapter};
    use crate::transport::sender_fn;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;

    /// Storage that logs an application-level error on every write
    struct NoisyStorage {
        inner: MemoryStorage,
    }

    impl StorageAdapter for NoisyStorage {
        fn load(&self) -> Result<Vec<Event>> {
            self.inner.load()
        }

        fn save(&self, events: &[Event]) -> Result<()> {
            tracing::error!(target: "app::storage", "disk nearly full");
            self.inner.save(events)
        }
    }

    fn client_with(auto_capture: Value, storage: Option<Arc<dyn StorageAdapter>>) -> Arc<Client> {
        let input = ConfigInput::from_value(json!({
            "api_key": "k",
            "api_url": "https://collector.example.com",
            "max_batch_size": 100,
            "auto_capture": auto_capture,
        }))
        .unwrap();
        let config = resolve(&input).unwrap();
        let sender = sender_fn(|_events: Vec<crate::event::Event>| async { Ok(()) });
        let options = QueueOptions::from_settings(&config.settings);
        let mut builder = EventQueue::builder(options, Arc::new(sender));
        if let Some(storage) = storage {
            builder = builder.storage(storage);
        }
        Arc::new(Client::with_queue(config, builder.build()))
    }

    fn client(auto_capture: Value) -> Arc<Client> {
        client_with(auto_capture, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_captures_error_events() {
        let client = client(json!({}));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(client.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not captured");
            tracing::error!(target: "app::db", attempts = 3, "connection pool exhausted");
        });

        let queued = client.queue().buffered_events();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message, "connection pool exhausted");
        assert_eq!(queued[0].level, Level::Error);
        assert_eq!(queued[0].extra["attempts"], 3);
        assert_eq!(queued[0].extra["logger"], "app::db");
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_respects_auto_capture_errors() {
        let client = client(json!({"errors": false}));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(client.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "app", "ignored");
        });

        assert_eq!(client.queue().size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_skips_internal_targets() {
        let client = client(json!({}));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(client.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "faultline_core::queue", "internal failure");
        });

        assert_eq!(client.queue().size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_logged_by_storage_are_not_captured() {
        let storage = Arc::new(NoisyStorage {
            inner: MemoryStorage::new(),
        });
        let client = client_with(json!({}), Some(storage.clone()));
        let dispatch = tracing::Dispatch::new(
            tracing_subscriber::registry().with(CaptureLayer::new(client.clone())),
        );

        let (done_tx, done_rx) = mpsc::channel();
        let worker = client.clone();
        std::thread::spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                worker.capture_message("hello", Level::Error);
            });
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("capture_message should return while storage logs errors");

        let queued = client.queue().buffered_events();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message, "hello");
        assert_eq!(storage.inner.snapshot(), queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_hook_reports_thread_panics() {
        let client = client(json!({}));
        install_panic_hook(client.clone());

        let result = std::thread::Builder::new()
            .name("capture-worker".to_string())
            .spawn(|| panic!("worker exploded"))
            .unwrap()
            .join();
        assert!(result.is_err());

        let queued: Vec<_> = client
            .queue()
            .buffered_events()
            .into_iter()
            .filter(|e| e.message == "worker exploded")
            .collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].level, Level::Fatal);
        assert_eq!(queued[0].exception.as_ref().unwrap().kind, "panic");
        assert_eq!(queued[0].extra["thread"], "capture-worker");
    }
}
