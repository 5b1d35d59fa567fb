//! Capture pipeline in front of the event queue
//!
//! Every captured event goes through, in order:
//! 1. the `enabled` switch
//! 2. sampling at `sample_rate`
//! 3. enrichment with environment, tags, user and breadcrumbs
//! 4. the `before_send` hook, which may rewrite or drop it
//! 5. [`EventQueue::enqueue`]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::error::Result;
use crate::event::{Breadcrumb, Event, Level};
use crate::queue::{EventQueue, FlushOptions, FlushOutcome, QueueOptions, QueueStats};
use crate::resolver::{ResolvedConfig, Settings};
use crate::transport::{HttpSender, DEFAULT_TIMEOUT_SECS};

/// Application-facing telemetry client
pub struct Client {
    settings: Settings,
    queue: EventQueue,
    breadcrumbs: Mutex<VecDeque<Breadcrumb>>,
}

impl Client {
    /// Client delivering over HTTP with in-memory buffering only
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ResolvedConfig) -> Result<Self> {
        let sender = HttpSender::new(&config, Duration::from_secs(DEFAULT_TIMEOUT_SECS))?;
        let options = QueueOptions::from_settings(&config.settings);
        let queue = EventQueue::builder(options, Arc::new(sender)).build();
        Ok(Self::with_queue(config, queue))
    }

    /// Client on top of an existing queue
    pub fn with_queue(config: ResolvedConfig, queue: EventQueue) -> Self {
        Self {
            settings: config.settings,
            queue,
            breadcrumbs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Run `event` through the pipeline; returns its ID if it was queued
    pub fn capture_event(&self, event: Event) -> Option<Uuid> {
        if !self.settings.enabled {
            return None;
        }
        if !self.sampled() {
            tracing::trace!(event_id = %event.event_id, "Event dropped by sampling");
            return None;
        }

        let event = self.enrich(event);
        let event = match &self.settings.before_send {
            Some(hook) => match hook.apply(event) {
                Some(event) => event,
                None => {
                    tracing::trace!("Event dropped by before_send");
                    return None;
                }
            },
            None => event,
        };

        Some(self.queue.enqueue(&event).event_id)
    }

    pub fn capture_message(&self, message: impl Into<String>, level: Level) -> Option<Uuid> {
        self.capture_event(Event::new(level, message))
    }

    pub fn capture_error<E>(&self, err: &E) -> Option<Uuid>
    where
        E: std::error::Error + ?Sized,
    {
        self.capture_event(Event::from_error(err))
    }

    /// Record a breadcrumb; keeps the most recent `max_breadcrumbs`
    pub fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        let mut trail = self.trail();
        trail.push_back(breadcrumb);
        while trail.len() > self.settings.max_breadcrumbs {
            trail.pop_front();
        }
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.trail().iter().cloned().collect()
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.queue.flush(FlushOptions::default()).await
    }

    fn trail(&self) -> std::sync::MutexGuard<'_, VecDeque<Breadcrumb>> {
        self.breadcrumbs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sampled(&self) -> bool {
        let rate = self.settings.sample_rate;
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            rand::random::<f64>() < rate
        }
    }

    /// Fill in context the caller left unset; event values win
    fn enrich(&self, mut event: Event) -> Event {
        if event.environment.is_none() {
            event.environment = Some(self.settings.environment.clone());
        }
        for (key, value) in &self.settings.tags {
            event
                .tags
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if event.user.is_none() {
            event.user = self.settings.user.clone();
        }
        if event.breadcrumbs.is_empty() {
            event.breadcrumbs = self.breadcrumbs();
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{resolve, BeforeSend, ConfigInput, TagValue};
    use crate::transport::sender_fn;
    use serde_json::json;

    fn client_with(values: serde_json::Value, before_send: Option<BeforeSend>) -> Client {
        let mut input = ConfigInput::from_value(values).unwrap();
        if let Some(hook) = before_send {
            input = input.with_before_send(hook);
        }
        let config = resolve(&input).unwrap();
        let sender = sender_fn(|_events: Vec<Event>| async { Ok(()) });
        let options = QueueOptions::from_settings(&config.settings);
        let queue = EventQueue::builder(options, Arc::new(sender)).build();
        Client::with_queue(config, queue)
    }

    fn base() -> serde_json::Value {
        json!({"api_key": "k", "api_url": "https://collector.example.com", "max_batch_size": 100})
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_enriches_event() {
        let mut values = base();
        values["environment"] = json!("staging");
        values["tags"] = json!({"region": "eu", "release": "1.2.0"});
        values["user"] = json!({"id": "u-1"});
        let client = client_with(values, None);

        client.add_breadcrumb(Breadcrumb::new("opened settings").with_category("ui"));
        let event = Event::new(Level::Error, "boom").with_tag("region", "us");
        let id = client.capture_event(event).unwrap();

        let queued = client.queue().buffered_events();
        assert_eq!(queued.len(), 1);
        let queued = &queued[0];
        assert_eq!(queued.event_id, id);
        assert_eq!(queued.environment.as_deref(), Some("staging"));
        assert_eq!(queued.tags["region"], TagValue::from("us"));
        assert_eq!(queued.tags["release"], TagValue::from("1.2.0"));
        assert_eq!(queued.user.as_ref().unwrap()["id"], "u-1");
        assert_eq!(queued.breadcrumbs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sample_rate_drops_everything() {
        let mut values = base();
        values["sample_rate"] = json!(0);
        let client = client_with(values, None);

        for _ in 0..20 {
            assert!(client.capture_message("noise", Level::Info).is_none());
        }
        assert_eq!(client.queue().size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_client_drops() {
        let mut values = base();
        values["enabled"] = json!(false);
        let client = client_with(values, None);

        assert!(client.capture_message("boom", Level::Error).is_none());
        assert_eq!(client.queue().size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_before_send_can_drop_or_rewrite() {
        let hook = BeforeSend::new(|mut event: Event| {
            if event.message.contains("ignore") {
                return None;
            }
            event.message = event.message.to_uppercase();
            Some(event)
        });
        let client = client_with(base(), Some(hook));

        assert!(client.capture_message("please ignore", Level::Error).is_none());
        assert!(client.capture_message("keep", Level::Error).is_some());

        let queued = client.queue().buffered_events();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message, "KEEP");
    }

    #[tokio::test(start_paused = true)]
    async fn test_breadcrumbs_capped() {
        let mut values = base();
        values["max_breadcrumbs"] = json!(3);
        let client = client_with(values, None);

        for n in 0..5 {
            client.add_breadcrumb(Breadcrumb::new(format!("step {n}")));
        }
        let trail: Vec<String> = client.breadcrumbs().into_iter().map(|b| b.message).collect();
        assert_eq!(trail, vec!["step 2", "step 3", "step 4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_error_and_flush() {
        let client = client_with(base(), None);
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");

        client.capture_error(&err).unwrap();
        assert_eq!(client.flush().await, FlushOutcome::Delivered(1));
        assert_eq!(client.stats().events_sent, 1);
    }
}
