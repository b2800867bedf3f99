use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;

pub(crate) const RING_CAPACITY: usize = 500;

/// Mirrors every log event as a JSON line into a bounded ring and a
/// broadcast channel.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

struct MessageVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.into());
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() != "message" {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}").into());
            return;
        }
        self.message.clear();
        use std::fmt::Write;
        let _ = write!(self.message, "{value:?}");
        // Strip surrounding quotes added by Debug on &str
        if self.message.len() >= 2 && self.message.starts_with('"') && self.message.ends_with('"') {
            *self.message = self.message[1..self.message.len() - 1].to_string();
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let target = event.metadata().target();
        let category = if target.contains("pipeline") || target.contains("submitter") {
            "pipeline"
        } else if target.starts_with("issuefix_agent") || target.contains("fixer") {
            "agent"
        } else if target.contains("webhook") || target.contains("routes") {
            "webhook"
        } else {
            "system"
        };

        let mut message = String::new();
        let mut fields = serde_json::Map::new();
        event.record(&mut MessageVisitor {
            message: &mut message,
            fields: &mut fields,
        });

        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let json = serde_json::json!({
            "ts": ts,
            "level": level,
            "message": message,
            "category": category,
            "target": target,
            "fields": fields,
        })
        .to_string();

        let _ = self.tx.send(json.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(json);
            if ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}
