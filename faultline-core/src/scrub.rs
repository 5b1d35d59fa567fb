//! Redaction of sensitive data before events leave the process

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::{Map, Value};

use crate::event::Event;
use crate::resolver::Settings;

/// Replacement for redacted values
pub const FILTERED: &str = "[Filtered]";

/// Applies `scrub_fields` and `scrub_patterns` to an event
#[derive(Debug, Clone, Default)]
pub struct Scrubber {
    fields: BTreeSet<String>,
    patterns: Vec<Regex>,
}

impl Scrubber {
    pub fn new(fields: BTreeSet<String>, patterns: Vec<Regex>) -> Self {
        Self { fields, patterns }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.scrub_fields.clone(), settings.scrub_patterns.clone())
    }

    /// Redact an event
    ///
    /// Values under a scrubbed key (case-insensitive, at any depth) become
    /// `[Filtered]`. Pattern matches are replaced inside every remaining
    /// string, including the message and exception text.
    pub fn scrub_event(&self, mut event: Event) -> Event {
        event.message = self.scrub_str(&event.message);

        if let Some(exception) = event.exception.as_mut() {
            exception.value = self.scrub_str(&exception.value);
            for cause in exception.chain.iter_mut() {
                *cause = self.scrub_str(cause);
            }
        }

        event.extra = self.scrub_map(&event.extra);
        if let Some(user) = event.user.as_ref() {
            event.user = Some(self.scrub_map(user));
        }

        for crumb in event.breadcrumbs.iter_mut() {
            crumb.message = self.scrub_str(&crumb.message);
            crumb.data = self.scrub_map(&crumb.data);
        }

        event
    }

    fn is_scrubbed_key(&self, key: &str) -> bool {
        self.fields.contains(&key.to_lowercase())
    }

    fn scrub_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.scrub_value(k, v)))
            .collect()
    }

    fn scrub_value(&self, key: &str, value: &Value) -> Value {
        if self.is_scrubbed_key(key) {
            return Value::String(FILTERED.to_string());
        }

        match value {
            Value::String(s) => Value::String(self.scrub_str(s)),
            Value::Object(map) => Value::Object(self.scrub_map(map)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.scrub_value("", item))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }

    fn scrub_str(&self, raw: &str) -> String {
        let mut out = raw.to_string();
        for pattern in &self.patterns {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, FILTERED).into_owned();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Breadcrumb, ExceptionInfo, Level};
    use crate::resolver::default_config;
    use serde_json::json;

    fn scrubber() -> Scrubber {
        Scrubber::from_settings(&default_config())
    }

    #[test]
    fn test_redacts_fields_at_any_depth() {
        let event = Event::new(Level::Error, "login failed")
            .with_extra("Password", "hunter2")
            .with_extra(
                "request",
                json!({"headers": {"Authorization": "Bearer abc"}, "path": "/login"}),
            )
            .with_extra("attempts", json!([{"token": "t1"}, {"token": "t2"}]));

        let scrubbed = scrubber().scrub_event(event);

        assert_eq!(scrubbed.extra["Password"], FILTERED);
        assert_eq!(scrubbed.extra["request"]["headers"]["Authorization"], FILTERED);
        assert_eq!(scrubbed.extra["request"]["path"], "/login");
        assert_eq!(scrubbed.extra["attempts"][1]["token"], FILTERED);
    }

    #[test]
    fn test_redacts_patterns_in_text() {
        let mut event = Event::new(Level::Error, "customer 123-45-6789 rejected");
        event.exception = Some(ExceptionInfo {
            kind: "PaymentError".to_string(),
            value: "card 4111 1111 1111 1111 declined".to_string(),
            chain: vec![],
        });
        let user = json!({"id": "u1", "note": "ssn 987-65-4321"});
        event.user = Some(user.as_object().unwrap().clone());
        let mut crumb = Breadcrumb::new("checkout");
        crumb.data.insert("cvv".to_string(), json!("123"));
        event.breadcrumbs.push(crumb);

        let scrubbed = scrubber().scrub_event(event);

        assert_eq!(scrubbed.message, "customer [Filtered] rejected");
        assert_eq!(scrubbed.exception.unwrap().value, "card [Filtered] declined");
        let user = scrubbed.user.unwrap();
        assert_eq!(user["id"], "u1");
        assert_eq!(user["note"], "ssn [Filtered]");
        assert_eq!(scrubbed.breadcrumbs[0].data["cvv"], FILTERED);
    }

    #[test]
    fn test_empty_scrubber_is_identity() {
        let event = Event::new(Level::Info, "123-45-6789").with_extra("password", "x");
        let scrubbed = Scrubber::default().scrub_event(event.clone());
        assert_eq!(scrubbed, event);
    }
}
