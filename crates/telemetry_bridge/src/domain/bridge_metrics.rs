use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use std::sync::atomic::{AtomicU64, Ordering};

const METER_NAME: &str = "telemetry_bridge";

/// One pipeline event counter: exported through the global meter and
/// mirrored locally so the totals can be read back in-process.
struct EventCounter {
    exported: Counter<u64>,
    total: AtomicU64,
}

impl EventCounter {
    fn new(meter: &Meter, name: &'static str, description: &'static str) -> Self {
        Self {
            exported: meter
                .u64_counter(name)
                .with_description(description)
                .build(),
            total: AtomicU64::new(0),
        }
    }

    fn increment(&self) {
        self.exported.add(1, &[]);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub validation_rejected: u64,
    pub unresolved_identity: u64,
    pub handler_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub duplicates_ignored: u64,
    pub transactions_completed: u64,
    pub transactions_failed: u64,
    pub transactions_expired: u64,
    pub transactions_evicted: u64,
}

macro_rules! bridge_metrics {
    ($($record:ident => $field:ident : $name:literal, $description:literal;)*) => {
        /// Counters for every countable pipeline event.
        ///
        /// Instruments come from the global meter provider, so they are
        /// no-ops on the export side until OTLP is enabled at startup.
        /// Shared behind an `Arc`; the hot path never takes a lock.
        pub struct BridgeMetrics {
            $($field: EventCounter,)*
        }

        impl BridgeMetrics {
            pub fn with_meter(meter: &Meter) -> Self {
                Self {
                    $($field: EventCounter::new(meter, $name, $description),)*
                }
            }

            $(
                pub fn $record(&self) {
                    self.$field.increment();
                }
            )*

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($field: self.$field.get(),)*
                }
            }
        }
    };
}

bridge_metrics! {
    record_received => messages_received:
        "bridge.messages.received", "MQTT messages handed to the pipeline";
    record_validation_rejected => validation_rejected:
        "bridge.messages.rejected", "Messages dropped by validation";
    record_unresolved_identity => unresolved_identity:
        "bridge.messages.unresolved", "Messages from devices with no tenant mapping";
    record_handler_failure => handler_failures:
        "bridge.handler.failures", "Handler errors and panics";
    record_published => messages_published:
        "bridge.stream.published", "Messages acknowledged by the stream";
    record_publish_failure => publish_failures:
        "bridge.stream.publish_failures", "Publishes that failed after retries";
    record_duplicate => duplicates_ignored:
        "bridge.transactions.duplicates", "Redelivered group members ignored";
    record_transaction_completed => transactions_completed:
        "bridge.transactions.completed", "Groups released in full";
    record_transaction_failed => transactions_failed:
        "bridge.transactions.failed", "Groups failed by conflict or publish error";
    record_transaction_expired => transactions_expired:
        "bridge.transactions.expired", "Groups that timed out incomplete";
    record_transaction_evicted => transactions_evicted:
        "bridge.transactions.evicted", "Groups dropped at the pending limit";
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::with_meter(&global::meter(METER_NAME))
    }

    /// Emit all counters as one structured log line
    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            messages_received = s.messages_received,
            validation_rejected = s.validation_rejected,
            unresolved_identity = s.unresolved_identity,
            handler_failures = s.handler_failures,
            messages_published = s.messages_published,
            publish_failures = s.publish_failures,
            duplicates_ignored = s.duplicates_ignored,
            transactions_completed = s.transactions_completed,
            transactions_failed = s.transactions_failed,
            transactions_expired = s.transactions_expired,
            transactions_evicted = s.transactions_evicted,
            "telemetry bridge counters"
        );
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BridgeMetrics").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = BridgeMetrics::new();
        metrics.record_unresolved_identity();
        metrics.record_unresolved_identity();
        metrics.record_published();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.unresolved_identity, 2);
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.transactions_expired, 0);
    }

    #[test]
    fn test_instances_count_independently() {
        let meter = global::meter(METER_NAME);
        let first = BridgeMetrics::with_meter(&meter);
        let second = BridgeMetrics::with_meter(&meter);

        first.record_transaction_evicted();

        assert_eq!(first.snapshot().transactions_evicted, 1);
        assert_eq!(second.snapshot(), MetricsSnapshot::default());
    }
}
