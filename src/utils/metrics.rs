//! OTel-native metrics instruments.
//!
//! Instruments are created once from a caller-supplied [`Meter`] and handed
//! to the store and the change feeds. Naming follows OTel semantic
//! conventions (dot-separated).

use std::time::Instant;

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;

/// Instruments shared by the store and the watch machinery.
#[derive(Clone)]
pub struct StorageMetrics {
    write_duration: Histogram<f64>,
    write_total: Counter<u64>,
    poll_batch: Histogram<u64>,
    watch_events: Counter<u64>,
    subscribers: UpDownCounter<i64>,
    history_removed: Counter<u64>,
}

impl StorageMetrics {
    /// Register the instruments on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            write_duration: meter
                .f64_histogram("sqlstash.write.duration")
                .with_description("Entity write duration")
                .with_unit("s")
                .build(),
            write_total: meter
                .u64_counter("sqlstash.write.total")
                .with_description("Entity writes by operation and outcome")
                .build(),
            poll_batch: meter
                .u64_histogram("sqlstash.poll.batch")
                .with_description("History rows returned per poll query")
                .build(),
            watch_events: meter
                .u64_counter("sqlstash.watch.events")
                .with_description("Events published to the broadcaster")
                .build(),
            subscribers: meter
                .i64_up_down_counter("sqlstash.watch.subscribers")
                .with_description("Active broadcaster subscribers")
                .build(),
            history_removed: meter
                .u64_counter("sqlstash.history.removed")
                .with_description("History rows removed by pruning and garbage collection")
                .build(),
        }
    }

    /// Instruments backed by the global (no-op unless configured) provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("sqlstash"))
    }

    pub fn record_write(&self, op: &'static str, outcome: &'static str, started: Instant) {
        let attrs = [KeyValue::new("op", op), KeyValue::new("outcome", outcome)];
        self.write_duration
            .record(started.elapsed().as_secs_f64(), &attrs);
        self.write_total.add(1, &attrs);
    }

    pub fn record_poll_batch(&self, rows: usize) {
        self.poll_batch.record(rows as u64, &[]);
    }

    pub fn record_watch_event(&self, group: &str, resource: &str) {
        self.watch_events.add(
            1,
            &[
                KeyValue::new("group", group.to_string()),
                KeyValue::new("resource", resource.to_string()),
            ],
        );
    }

    pub fn record_history_removed(&self, reason: &'static str, rows: u64) {
        self.history_removed
            .add(rows, &[KeyValue::new("reason", reason)]);
    }

    pub fn subscriber_added(&self) {
        self.subscribers.add(1, &[]);
    }

    pub fn subscriber_removed(&self) {
        self.subscribers.add(-1, &[]);
    }
}

impl Default for StorageMetrics {
    fn default() -> Self {
        Self::global()
    }
}

impl std::fmt::Debug for StorageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageMetrics").finish_non_exhaustive()
    }
}
