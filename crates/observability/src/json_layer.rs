//! JSONL layer for the delivery log.
//!
//! Every event becomes one line. The fields the delivery crates attach to
//! nearly every event are lifted to the top level so the log can be filtered
//! without digging into nested objects:
//!
//! - `endpoint` and `payload` (cache key) of the call being handled
//! - `error` of a failed operation
//! - `pass`: the counters of a finished drain pass
//!
//! Anything else lands in `fields`. `spans` lists the active spans, root first.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Counters reported at the end of a drain pass.
pub const PASS_COUNTERS: [&str; 5] = [
    "delivered",
    "dropped",
    "requeued",
    "rate_limited",
    "transient",
];

/// One line of the delivery log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogEntry {
    pub ts: String,
    pub level: &'static str,
    pub service: String,
    pub pid: u32,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pass: BTreeMap<&'static str, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<&'static str>,
}

impl LogEntry {
    fn record(&mut self, field: &Field, value: Value) {
        let name = field.name();
        match name {
            "message" => self.message = text(value),
            "endpoint" => self.endpoint = Some(text(value)),
            "payload" => self.payload = Some(text(value)),
            "error" => self.error = Some(text(value)),
            _ => match (PASS_COUNTERS.iter().find(|c| **c == name), value.as_u64()) {
                (Some(counter), Some(count)) => {
                    self.pass.insert(*counter, count);
                }
                (_, _) => {
                    self.fields.insert(name.to_string(), value);
                }
            },
        }
    }
}

fn text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for LogEntry {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record(field, Value::String(value.to_string()));
    }
}

/// Layer appending one [`LogEntry`] per event to `make_writer`.
pub struct JsonLayer<W> {
    service_name: String,
    pid: u32,
    make_writer: W,
}

impl<W> JsonLayer<W> {
    pub fn new(service_name: String, make_writer: W) -> Self {
        Self {
            service_name,
            pid: std::process::id(),
            make_writer,
        }
    }
}

impl<S, W> Layer<S> for JsonLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut entry = LogEntry {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: metadata.level().as_str(),
            service: self.service_name.clone(),
            pid: self.pid,
            target: metadata.target().to_string(),
            ..Default::default()
        };
        event.record(&mut entry);
        if let Some(scope) = ctx.event_scope(event) {
            entry.spans = scope.from_root().map(|span| span.name()).collect();
        }

        let Ok(mut line) = serde_json::to_vec(&entry) else {
            return;
        };
        line.push(b'\n');
        let _ = self.make_writer.make_writer().write_all(&line);
    }
}
