//! In-process metrics.
//!
//! The library keeps its own counters so a host can wire them into any
//! exposition layer it likes; nothing here knows about Prometheus or
//! OpenTelemetry.  Counters are process-wide (one ESL library per process
//! in practice) behind a `OnceLock`.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// A count + total-duration pair, the poor man's histogram.
#[derive(Debug, Default)]
pub struct DurationStat {
    count: AtomicU64,
    total_micros: AtomicU64,
}

impl DurationStat {
    pub fn record(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(duration.as_micros().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed))
    }
}

/// All counters the library maintains.
#[derive(Debug, Default)]
pub struct Metrics {
    pub commands_sent: AtomicU64,
    pub command_errors: AtomicU64,
    pub events_received: AtomicU64,
    /// O(1) channel-table routing hits.
    pub channel_routing_hits: AtomicU64,
    /// Events that fell through to the global table.
    pub global_routing_fallbacks: AtomicU64,
    pub channel_operations: AtomicU64,
    pub dtmf_received: AtomicU64,
    pub bridge_operations: AtomicU64,
    pub timeouts: AtomicU64,
    pub command_duration: DurationStat,
    pub call_duration: DurationStat,
    hangup_causes: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn record_hangup_cause(&self, cause: &str) {
        let mut causes = self.hangup_causes.lock().unwrap();
        *causes.entry(cause.to_owned()).or_insert(0) += 1;
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            channel_routing_hits: self.channel_routing_hits.load(Ordering::Relaxed),
            global_routing_fallbacks: self.global_routing_fallbacks.load(Ordering::Relaxed),
            channel_operations: self.channel_operations.load(Ordering::Relaxed),
            dtmf_received: self.dtmf_received.load(Ordering::Relaxed),
            bridge_operations: self.bridge_operations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            commands_duration_count: self.command_duration.count(),
            commands_duration_total_ms: self.command_duration.total().as_millis() as u64,
            calls_duration_count: self.call_duration.count(),
            calls_duration_total_ms: self.call_duration.total().as_millis() as u64,
            hangup_causes: self.hangup_causes.lock().unwrap().clone(),
        }
    }
}

/// Serializable copy of the counters for host-side exposition.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub commands_sent: u64,
    pub command_errors: u64,
    pub events_received: u64,
    pub channel_routing_hits: u64,
    pub global_routing_fallbacks: u64,
    pub channel_operations: u64,
    pub dtmf_received: u64,
    pub bridge_operations: u64,
    pub timeouts: u64,
    pub commands_duration_count: u64,
    pub commands_duration_total_ms: u64,
    pub calls_duration_count: u64,
    pub calls_duration_total_ms: u64,
    pub hangup_causes: HashMap<String, u64>,
}

impl MetricsSnapshot {
    /// Render as a JSON object for log shipping or a host-side metrics
    /// endpoint.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// The process-wide metrics registry.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}
