use crate::dispatch::{in_delivery, DispatchHook};
use crate::record::{Level, LogRecord};
use crate::INTERNAL_TARGET;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Crates the outputs drive to reach their collectors. Their events are
/// raised by the delivery itself, sometimes on tasks the outputs do not
/// own, and would otherwise feed every batch back into the next one.
const TRANSPORT_TARGETS: &[&str] = &["hyper", "reqwest", "h2", "want", "rustls", "tokio_rustls"];

fn is_transport_target(target: &str) -> bool {
    TRANSPORT_TARGETS.iter().any(|krate| {
        target
            .strip_prefix(krate)
            .map_or(false, |rest| rest.is_empty() || rest.starts_with("::"))
    })
}

/// `tracing_subscriber` layer that turns every event into a [`LogRecord`]
/// and hands it to a [`DispatchHook`].
///
/// Events emitted on [`INTERNAL_TARGET`] (delivery failures reported by
/// outputs themselves), from inside a delivery task, or by the transport
/// crates are skipped so they cannot loop back into the targets that
/// produced them.
#[derive(Clone)]
pub struct DispatchLayer {
    hook: DispatchHook,
}

impl DispatchLayer {
    pub fn new(hook: DispatchHook) -> Self {
        Self { hook }
    }

    pub fn hook(&self) -> &DispatchHook {
        &self.hook
    }
}

impl<S> Layer<S> for DispatchLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with(INTERNAL_TARGET) || is_transport_target(meta.target()) || in_delivery() {
            return;
        }
        if self.hook.active_routes() == 0 {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.hook.fire(LogRecord {
            timestamp: Utc::now(),
            level: Level::from(meta.level()),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

/// Collects an event's fields; `message` is kept apart from the rest.
#[derive(Default)]
pub(crate) struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(text)) => self.message = Some(text),
            (name, value) => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{:?}", value)));
    }
}
