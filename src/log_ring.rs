//! Per task-id bounded log ring (spec.md §3 "Log Ring", §9 "per-id bounded
//! ring buffer keyed by task id plus one special id 'general'; eviction is
//! O(1) append, oldest-dropped").

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const GENERAL: &str = "general";
const CAPACITY: usize = 1000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[derive(Default)]
pub struct LogRingRegistry {
    rings: DashMap<String, VecDeque<LogLine>>,
}

impl LogRingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the named ring (and, unless the id already is `general`,
    /// to `general` as well), evicting the oldest line once at capacity.
    pub fn push(&self, id: &str, level: &str, message: impl Into<String>) {
        let line = LogLine {
            at: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        };
        self.push_to(id, line.clone());
        if id != GENERAL {
            self.push_to(GENERAL, line);
        }
    }

    fn push_to(&self, id: &str, line: LogLine) {
        let mut ring = self.rings.entry(id.to_string()).or_insert_with(VecDeque::new);
        if ring.len() >= CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    /// Returns up to the last `n` lines for `id`, oldest first.
    pub fn tail(&self, id: &str, n: usize) -> Vec<LogLine> {
        match self.rings.get(id) {
            Some(ring) => {
                let len = ring.len();
                let skip = len.saturating_sub(n);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn clear(&self, id: &str) {
        if let Some(mut ring) = self.rings.get_mut(id) {
            ring.clear();
        }
    }
}

/// A `tracing_subscriber::Layer` that mirrors every event into the log
/// ring alongside stdout/file logging (SPEC_FULL.md §2.9): events carrying
/// a `task_id` field land in that task's ring; everything else lands only
/// in `"general"`.
pub struct LogRingLayer {
    registry: Arc<LogRingRegistry>,
}

impl LogRingLayer {
    pub fn new(registry: Arc<LogRingRegistry>) -> Self {
        LogRingLayer { registry }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    task_id: Option<String>,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "task_id" => self.task_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "task_id" => self.task_id = Some(format!("{value:?}").trim_matches('"').to_string()),
            _ => {}
        }
    }
}

impl<S> Layer<S> for LogRingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message.unwrap_or_default();
        if message.is_empty() {
            return;
        }
        let level = event.metadata().level().as_str();
        let id = visitor.task_id.unwrap_or_else(|| GENERAL.to_string());
        self.registry.push(&id, level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_past_capacity() {
        let reg = LogRingRegistry::new();
        for i in 0..(CAPACITY + 10) {
            reg.push("t1", "INFO", format!("line {i}"));
        }
        let tail = reg.tail("t1", CAPACITY + 10);
        assert_eq!(tail.len(), CAPACITY);
        assert!(tail[0].message.contains("line 10"));
    }

    #[test]
    fn non_general_id_also_mirrors_to_general() {
        let reg = LogRingRegistry::new();
        reg.push("task-a", "WARN", "oops");
        assert_eq!(reg.tail(GENERAL, 10).len(), 1);
        assert_eq!(reg.tail("task-a", 10).len(), 1);
    }

    #[test]
    fn layer_routes_task_id_field_into_matching_ring() {
        use tracing_subscriber::prelude::*;

        let registry = Arc::new(LogRingRegistry::new());
        let layer = LogRingLayer::new(registry.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(task_id = "t1", "copy failed");
            tracing::info!("general-only line");
        });

        assert_eq!(registry.tail("t1", 10).len(), 1);
        assert_eq!(registry.tail(GENERAL, 10).len(), 2);
    }

    #[test]
    fn clear_empties_ring() {
        let reg = LogRingRegistry::new();
        reg.push("task-a", "INFO", "hi");
        reg.clear("task-a");
        assert!(reg.tail("task-a", 10).is_empty());
    }
}
