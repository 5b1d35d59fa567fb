//! Delivery of event batches to a remote collector
//!
//! [`BatchSender`] is the seam the queue delivers through. [`HttpSender`]
//! is the production implementation; [`sender_fn`] adapts a closure for
//! tests and custom transports.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::resolver::ResolvedConfig;
use crate::scrub::Scrubber;

/// Default request timeout for [`HttpSender`]
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Delivers one batch; an `Err` puts the batch back for retry
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send_batch(&self, events: Vec<Event>) -> Result<()>;
}

/// [`BatchSender`] backed by an async closure
pub struct SenderFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`BatchSender`]
pub fn sender_fn<F, Fut>(f: F) -> SenderFn<F, Fut>
where
    F: Fn(Vec<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    SenderFn {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> BatchSender for SenderFn<F, Fut>
where
    F: Fn(Vec<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn send_batch(&self, events: Vec<Event>) -> Result<()> {
        (self.f)(events).await
    }
}

/// Request body for POST {api_url}
#[derive(Serialize)]
struct BatchPayload<'a> {
    sent_at: DateTime<Utc>,
    events: &'a [Event],
}

/// HTTP sender posting JSON batches to the collector
pub struct HttpSender {
    http_client: reqwest::Client,
    endpoint: Url,
    scrubber: Scrubber,
}

impl HttpSender {
    /// Build a sender for a resolved configuration
    pub fn new(config: &ResolvedConfig, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(&config.api_url)
            .map_err(|e| Error::Config(format!("invalid api_url: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = format!("Bearer {}", config.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
        );
        headers.insert(
            "X-Faultline-Environment",
            HeaderValue::from_str(&config.settings.environment)
                .map_err(|e| Error::Config(format!("invalid environment: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
            scrubber: Scrubber::from_settings(&config.settings),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl BatchSender for HttpSender {
    async fn send_batch(&self, events: Vec<Event>) -> Result<()> {
        let events: Vec<Event> = events
            .into_iter()
            .map(|event| self.scrubber.scrub_event(event))
            .collect();
        let body = BatchPayload {
            sent_at: Utc::now(),
            events: &events,
        };

        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::trace!(events = events.len(), %status, "Collector accepted batch");
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Delivery(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;
    use crate::resolver::{resolve, ConfigInput};
    use std::sync::{Arc, Mutex};

    fn resolved(api_url: &str) -> ResolvedConfig {
        resolve(
            &ConfigInput::new()
                .set("api_key", "flt_test_key")
                .set("api_url", api_url),
        )
        .unwrap()
    }

    #[test]
    fn test_http_sender_with_valid_config() {
        let sender = HttpSender::new(
            &resolved("https://collector.example.com/v1/events"),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
        .unwrap();
        assert_eq!(sender.endpoint().path(), "/v1/events");
    }

    #[test]
    fn test_http_sender_rejects_bad_header_values() {
        let mut config = resolved("https://collector.example.com");
        config.api_key = "line\nbreak".to_string();
        let result = HttpSender::new(&config, Duration::from_secs(1));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_payload_shape() {
        let events = vec![Event::new(Level::Error, "boom")];
        let body = BatchPayload {
            sent_at: Utc::now(),
            events: &events,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["sent_at"].is_string());
        assert_eq!(json["events"][0]["message"], "boom");
    }

    #[tokio::test]
    async fn test_sender_fn_forwards_batches() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sender = sender_fn(move |events: Vec<Event>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(events.len());
                Ok(())
            }
        });

        sender.send_batch(vec![Event::new(Level::Info, "a")]).await.unwrap();
        sender.send_batch(Vec::new()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }
}
