//! Metrics emission helpers.
//!
//! Emissions go to tracing by default; tests can install a capturing sink.

use std::sync::{Arc, OnceLock, RwLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(target: "metrics", metric = event.name, value);
            }
            MetricValue::Gauge(value) => {
                tracing::info!(target: "metrics", metric = event.name, value);
            }
        }
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue) {
    sink().record(MetricEvent { name, value });
}

pub fn processor_backoff() {
    emit("dcp_processor_backoff", MetricValue::Counter(1));
}

pub fn rollback_completed() {
    emit("dcp_rollback_completed", MetricValue::Counter(1));
}

pub fn buffer_ack_sent(bytes: u32) {
    emit("dcp_buffer_ack_bytes", MetricValue::Counter(u64::from(bytes)));
}

pub fn stream_created() {
    emit("dcp_streams_created", MetricValue::Counter(1));
}

pub fn stream_dead() {
    emit("dcp_streams_dead", MetricValue::Counter(1));
}

pub fn set_buffered_bytes(bytes: u64) {
    emit("dcp_buffered_bytes", MetricValue::Gauge(bytes));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricSink for TestSink {
        fn record(&self, event: MetricEvent) {
            self.events.lock().expect("metrics lock").push(event);
        }
    }

    #[test]
    fn emits_counters() {
        let sink = Arc::new(TestSink::default());
        set_sink(sink.clone());

        processor_backoff();
        buffer_ack_sent(128);

        let events = sink.events.lock().expect("metrics lock");
        assert!(events.iter().any(|e| e.name == "dcp_processor_backoff"));
        assert!(events
            .iter()
            .any(|e| e.name == "dcp_buffer_ack_bytes"
                && e.value == MetricValue::Counter(128)));
    }
}
