//! Configuration resolver
//!
//! Turns a loosely-typed [`ConfigInput`] (a JSON object, usually the
//! `[telemetry]` table of `config.toml`) into an immutable
//! [`ResolvedConfig`]. Validation stops at the first bad field and runs in
//! four passes:
//!
//! 1. required fields (`api_key`, `api_url`)
//! 2. type/shape of every field
//! 3. semantic checks (URL parsing, sample rate bounds, positive integers)
//! 4. normalization of nested records (`auto_capture`, `tags`,
//!    `scrub_fields`, `scrub_patterns`, `user`)
//!
//! Nothing partially validated is ever returned.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use url::Url;

use crate::error::ValidationError;
use crate::event::Event;

pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_SAMPLE_RATE: f64 = 1.0;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 20;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1_000;
pub const DEFAULT_MAX_BREADCRUMBS: usize = 50;

const DEFAULT_SCRUB_FIELDS: [&str; 14] = [
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_token",
    "refresh_token",
    "authorization",
    "cookie",
    "credit_card",
    "card_number",
    "cvv",
    "ssn",
];

const DEFAULT_SCRUB_PATTERNS: [&str; 2] = [
    // US social security number
    r"\b\d{3}-\d{2}-\d{4}\b",
    // 13 to 19 digit card numbers, optionally grouped
    r"\b(?:\d[ -]?){12,18}\d\b",
];

/// Tag value attached to every event: string, number or boolean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Number(Number),
    String(String),
}

impl TagValue {
    pub fn to_json(&self) -> Value {
        match self {
            TagValue::Bool(b) => Value::Bool(*b),
            TagValue::Number(n) => Value::Number(n.clone()),
            TagValue::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Number(value.into())
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Number::from_f64(value)
            .map(TagValue::Number)
            .unwrap_or_else(|| TagValue::String(value.to_string()))
    }
}

/// Hook run on every event before it is queued; `None` drops the event
#[derive(Clone)]
pub struct BeforeSend(Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>);

impl BeforeSend {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Event) -> Option<Event> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, event: Event) -> Option<Event> {
        (self.0)(event)
    }
}

impl fmt::Debug for BeforeSend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BeforeSend(..)")
    }
}

impl PartialEq for BeforeSend {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Which failures are captured without an explicit call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoCapture {
    /// `tracing` events at ERROR level
    pub errors: bool,
    /// Panics on any thread or task
    pub panics: bool,
}

impl Default for AutoCapture {
    fn default() -> Self {
        Self {
            errors: true,
            panics: true,
        }
    }
}

/// Every optional setting of a resolved configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: String,
    pub enabled: bool,
    pub sample_rate: f64,
    pub before_send: Option<BeforeSend>,
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub max_breadcrumbs: usize,
    pub auto_capture: AutoCapture,
    pub scrub_fields: BTreeSet<String>,
    pub scrub_patterns: Vec<Regex>,
    pub tags: BTreeMap<String, TagValue>,
    pub user: Option<Map<String, Value>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            enabled: true,
            sample_rate: DEFAULT_SAMPLE_RATE,
            before_send: None,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            auto_capture: AutoCapture::default(),
            scrub_fields: DEFAULT_SCRUB_FIELDS.iter().map(|s| s.to_string()).collect(),
            scrub_patterns: default_scrub_patterns(),
            tags: BTreeMap::new(),
            user: None,
        }
    }
}

impl PartialEq for Settings {
    fn eq(&self, other: &Self) -> bool {
        self.environment == other.environment
            && self.enabled == other.enabled
            && self.sample_rate == other.sample_rate
            && self.before_send == other.before_send
            && self.flush_interval_ms == other.flush_interval_ms
            && self.max_batch_size == other.max_batch_size
            && self.max_queue_size == other.max_queue_size
            && self.max_breadcrumbs == other.max_breadcrumbs
            && self.auto_capture == other.auto_capture
            && self.scrub_fields == other.scrub_fields
            && self.scrub_patterns.len() == other.scrub_patterns.len()
            && self
                .scrub_patterns
                .iter()
                .zip(&other.scrub_patterns)
                .all(|(a, b)| a.as_str() == b.as_str())
            && self.tags == other.tags
            && self.user == other.user
    }
}

impl Settings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Plain JSON view for display; patterns are shown as their source text
    pub fn to_json(&self) -> Value {
        let mut values = settings_values(self);
        values.insert(
            "scrub_patterns".to_string(),
            Value::Array(
                self.scrub_patterns
                    .iter()
                    .map(|p| Value::String(p.as_str().to_string()))
                    .collect(),
            ),
        );
        values.insert(
            "before_send".to_string(),
            Value::Bool(self.before_send.is_some()),
        );
        Value::Object(values)
    }
}

/// Validated configuration for one session
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub api_key: String,
    pub api_url: String,
    pub settings: Settings,
}

impl ResolvedConfig {
    /// Plain-object equivalent that resolves back to `self`
    pub fn to_input(&self) -> ConfigInput {
        let mut values = Map::new();
        values.insert("api_key".to_string(), Value::String(self.api_key.clone()));
        values.insert("api_url".to_string(), Value::String(self.api_url.clone()));
        values.extend(settings_values(&self.settings));

        ConfigInput {
            values,
            before_send: self.settings.before_send.clone(),
            scrub_patterns: Some(self.settings.scrub_patterns.clone()),
        }
    }
}

/// Unvalidated resolver input
///
/// A JSON object plus the two things JSON cannot carry: a `before_send`
/// callable and compiled scrub patterns.
#[derive(Debug, Clone, Default)]
pub struct ConfigInput {
    values: Map<String, Value>,
    before_send: Option<BeforeSend>,
    scrub_patterns: Option<Vec<Regex>>,
}

impl ConfigInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(values) => Ok(Self {
                values,
                ..Default::default()
            }),
            _ => Err(ValidationError::invalid_type("config", "an object")),
        }
    }

    pub fn from_toml(table: toml::Table) -> Result<Self, ValidationError> {
        let value = serde_json::to_value(table).map_err(|e| {
            ValidationError::invalid_type("config", &format!("a JSON-compatible table ({e})"))
        })?;
        Self::from_value(value)
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_before_send(mut self, before_send: BeforeSend) -> Self {
        self.before_send = Some(before_send);
        self
    }

    pub fn with_scrub_patterns(mut self, patterns: Vec<Regex>) -> Self {
        self.scrub_patterns = Some(patterns);
        self
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// All defaults, without the required `api_key` / `api_url`
pub fn default_config() -> Settings {
    Settings::default()
}

/// Validate and normalize `input`
pub fn resolve(input: &ConfigInput) -> Result<ResolvedConfig, ValidationError> {
    let values = &input.values;

    // Pass 1: required fields
    for key in ["api_key", "api_url"] {
        if lookup(values, key).is_none() {
            return Err(ValidationError::required(key));
        }
    }

    // Pass 2: type and shape
    let api_key = expect_str(values, "api_key")?.unwrap_or_default();
    let api_url = expect_str(values, "api_url")?.unwrap_or_default();
    let environment = expect_str(values, "environment")?;
    let enabled = expect_bool(values, "enabled")?;
    let sample_rate = expect_number(values, "sample_rate")?;
    let flush_interval_ms = expect_number(values, "flush_interval_ms")?;
    let max_batch_size = expect_number(values, "max_batch_size")?;
    let max_queue_size = expect_number(values, "max_queue_size")?;
    let max_breadcrumbs = expect_number(values, "max_breadcrumbs")?;
    let auto_capture = expect_object(values, "auto_capture")?;
    let tags = expect_object(values, "tags")?;
    let scrub_fields = expect_array(values, "scrub_fields")?;
    let scrub_patterns = expect_array(values, "scrub_patterns")?;
    let user = expect_object(values, "user")?;

    // Pass 3: semantic checks
    if api_key.trim().is_empty() {
        return Err(ValidationError::out_of_range("api_key", "must not be empty"));
    }
    if api_url.trim().is_empty() {
        return Err(ValidationError::out_of_range("api_url", "must not be empty"));
    }
    Url::parse(api_url).map_err(|_| ValidationError::invalid_type("api_url", "a valid URL"))?;

    let mut settings = Settings::default();

    if let Some(environment) = environment {
        if environment.trim().is_empty() {
            return Err(ValidationError::out_of_range(
                "environment",
                "must not be empty",
            ));
        }
        settings.environment = environment.to_string();
    }
    if let Some(enabled) = enabled {
        settings.enabled = enabled;
    }
    if let Some(rate) = sample_rate {
        let rate = rate.as_f64().unwrap_or(f64::NAN);
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(ValidationError::out_of_range(
                "sample_rate",
                "must be between 0 and 1",
            ));
        }
        settings.sample_rate = rate;
    }
    if let Some(n) = flush_interval_ms {
        settings.flush_interval_ms = positive_integer("flush_interval_ms", n)?;
    }
    if let Some(n) = max_batch_size {
        settings.max_batch_size = positive_integer("max_batch_size", n)? as usize;
    }
    if let Some(n) = max_queue_size {
        settings.max_queue_size = positive_integer("max_queue_size", n)? as usize;
    }
    if let Some(n) = max_breadcrumbs {
        settings.max_breadcrumbs = positive_integer("max_breadcrumbs", n)? as usize;
    }

    // Pass 4: nested records
    if let Some(record) = auto_capture {
        let errors = expect_bool(record, "errors").map_err(|e| nested("auto_capture", e))?;
        if let Some(errors) = errors {
            settings.auto_capture.errors = errors;
        }
        let panics = expect_bool(record, "panics").map_err(|e| nested("auto_capture", e))?;
        if let Some(panics) = panics {
            settings.auto_capture.panics = panics;
        }
    }

    if let Some(record) = tags {
        settings.tags = normalize_tags(record)?;
    }

    if let Some(entries) = scrub_fields {
        settings.scrub_fields = normalize_scrub_fields(entries)?;
    }

    // JSON entries are never patterns, even alongside compiled ones
    let first_entry = scrub_patterns.and_then(|entries| entries.iter().enumerate().next());
    if let Some((idx, entry)) = first_entry {
        let field = format!("scrub_patterns[{idx}]");
        return Err(if entry.is_string() {
            ValidationError::invalid_type(
                field,
                "a compiled pattern; strings are not compiled implicitly",
            )
        } else {
            ValidationError::invalid_type(field, "a compiled pattern")
        });
    }
    match (&input.scrub_patterns, scrub_patterns) {
        (Some(compiled), _) => settings.scrub_patterns = compiled.clone(),
        (None, Some(_)) => settings.scrub_patterns = Vec::new(),
        (None, None) => {}
    }

    settings.before_send = input.before_send.clone();
    settings.user = user.cloned();

    Ok(ResolvedConfig {
        api_key: api_key.to_string(),
        api_url: api_url.to_string(),
        settings,
    })
}

fn default_scrub_patterns() -> Vec<Regex> {
    DEFAULT_SCRUB_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("built-in scrub pattern compiles"))
        .collect()
}

fn settings_values(settings: &Settings) -> Map<String, Value> {
    let mut values = Map::new();
    values.insert(
        "environment".to_string(),
        Value::String(settings.environment.clone()),
    );
    values.insert("enabled".to_string(), Value::Bool(settings.enabled));
    if let Some(rate) = Number::from_f64(settings.sample_rate) {
        values.insert("sample_rate".to_string(), Value::Number(rate));
    }
    values.insert(
        "flush_interval_ms".to_string(),
        Value::from(settings.flush_interval_ms),
    );
    values.insert(
        "max_batch_size".to_string(),
        Value::from(settings.max_batch_size),
    );
    values.insert(
        "max_queue_size".to_string(),
        Value::from(settings.max_queue_size),
    );
    values.insert(
        "max_breadcrumbs".to_string(),
        Value::from(settings.max_breadcrumbs),
    );
    values.insert(
        "auto_capture".to_string(),
        serde_json::json!({
            "errors": settings.auto_capture.errors,
            "panics": settings.auto_capture.panics,
        }),
    );
    values.insert(
        "tags".to_string(),
        Value::Object(
            settings
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        ),
    );
    values.insert(
        "scrub_fields".to_string(),
        Value::Array(
            settings
                .scrub_fields
                .iter()
                .map(|f| Value::String(f.clone()))
                .collect(),
        ),
    );
    values.insert(
        "user".to_string(),
        settings.user.clone().map(Value::Object).unwrap_or(Value::Null),
    );
    values
}

/// Null counts as absent
fn lookup<'a>(values: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    values.get(key).filter(|v| !v.is_null())
}

fn expect_str<'a>(
    values: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, ValidationError> {
    match lookup(values, key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ValidationError::invalid_type(key, "a string")),
    }
}

fn expect_bool(values: &Map<String, Value>, key: &str) -> Result<Option<bool>, ValidationError> {
    match lookup(values, key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ValidationError::invalid_type(key, "a boolean")),
    }
}

fn expect_number<'a>(
    values: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Number>, ValidationError> {
    match lookup(values, key) {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n)),
        Some(_) => Err(ValidationError::invalid_type(key, "a number")),
    }
}

fn expect_object<'a>(
    values: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, ValidationError> {
    match lookup(values, key) {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(ValidationError::invalid_type(key, "an object")),
    }
}

fn expect_array<'a>(
    values: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Vec<Value>>, ValidationError> {
    match lookup(values, key) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(ValidationError::invalid_type(key, "an array")),
    }
}

fn nested(parent: &str, mut err: ValidationError) -> ValidationError {
    err.field = format!("{parent}.{}", err.field);
    err
}

fn positive_integer(key: &str, n: &Number) -> Result<u64, ValidationError> {
    let value = match n.as_u64() {
        Some(v) => Some(v),
        None => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64),
    };
    match value {
        Some(v) if v > 0 => Ok(v),
        _ => Err(ValidationError::out_of_range(
            key,
            "must be a positive integer",
        )),
    }
}

fn normalize_tags(
    record: &Map<String, Value>,
) -> Result<BTreeMap<String, TagValue>, ValidationError> {
    record
        .iter()
        .map(|(key, value)| {
            let tag = match value {
                Value::String(s) => TagValue::String(s.clone()),
                Value::Number(n) => TagValue::Number(n.clone()),
                Value::Bool(b) => TagValue::Bool(*b),
                _ => {
                    return Err(ValidationError::invalid_type(
                        format!("tags.{key}"),
                        "a string, number or boolean",
                    ))
                }
            };
            Ok((key.clone(), tag))
        })
        .collect()
}

fn normalize_scrub_fields(entries: &[Value]) -> Result<BTreeSet<String>, ValidationError> {
    let mut fields = BTreeSet::new();
    for (idx, entry) in entries.iter().enumerate() {
        let field = format!("scrub_fields[{idx}]");
        let name = entry
            .as_str()
            .ok_or_else(|| ValidationError::invalid_type(field.clone(), "a string"))?
            .trim()
            .to_lowercase();
        if name.is_empty() {
            return Err(ValidationError::out_of_range(field, "must not be empty"));
        }
        fields.insert(name);
    }
    Ok(fields)
}
