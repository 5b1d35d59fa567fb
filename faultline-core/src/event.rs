//! Event records buffered by the queue and shipped to the collector.
//!
//! An [`Event`] is an owned value: the queue stores clones and hands out
//! clones, so nothing it holds is ever shared with the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::resolver::TagValue;

/// Severity of an event or breadcrumb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

/// Exception details attached to an error event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Error type name (e.g. `std::io::Error`)
    #[serde(rename = "type")]
    pub kind: String,
    /// Display output of the error
    pub value: String,
    /// Display output of each `source()` in the chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

/// A trail entry recorded before an event occurred
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Breadcrumb {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: Level::Info,
            category: None,
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Error/event record as buffered by the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, TagValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breadcrumbs: Vec<Breadcrumb>,
    /// Free-form payload; not validated
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    /// Content hash for server-side grouping and deduplication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Event {
    /// Create an event with a fresh ID and the current time
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            exception: None,
            environment: None,
            tags: BTreeMap::new(),
            user: None,
            breadcrumbs: Vec::new(),
            extra: Map::new(),
            fingerprint: None,
        };
        event.fingerprint = Some(event.compute_fingerprint());
        event
    }

    /// Create an error event from an error and its `source()` chain
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let mut event = Self::new(Level::Error, err.to_string());
        event.exception = Some(ExceptionInfo {
            kind: short_type_name::<E>(),
            value: err.to_string(),
            chain,
        });
        event.fingerprint = Some(event.compute_fingerprint());
        event
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Compute a content-based hash for grouping
    ///
    /// Returns a 32-character hex digest of SHA-256(level + exception type + message).
    /// Timestamps and IDs are excluded so repeats of the same error collide.
    pub fn compute_fingerprint(&self) -> String {
        let kind = self
            .exception
            .as_ref()
            .map(|e| e.kind.as_str())
            .unwrap_or("");
        let hash_input = format!("{}:{}:{}", self.level.as_str(), kind, self.message);

        let mut hasher = Sha256::new();
        hasher.update(hash_input.as_bytes());
        let result = hasher.finalize();

        hex::encode(&result[..16])
    }
}

fn short_type_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    // Keep generic arguments intact, trim only the leading module path
    let base_end = full.find('<').unwrap_or(full.len());
    match full[..base_end].rfind("::") {
        Some(idx) => full[idx + 2..].to_string(),
        None => full.to_string(),
    }
}
