// src/metrics.rs
//
// Operator counters via the `metrics` crate facade. The engine registers
// no exporter; hosts install their own recorder.

use metrics::{counter, Counter};
use once_cell::sync::Lazy;

/// Global metrics registry for the engine.
pub static METRICS: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

pub struct MetricsRegistry {
    pub requests_total: Counter,
    pub requests_streaming_total: Counter,

    // Key lifecycle
    pub key_rotations_total: Counter,
    pub key_failures_total: Counter,
    pub key_lockouts_total: Counter,
    pub cooldowns_set_total: Counter,

    // The two faces of "no key": every configured key was tried, versus
    // every key was merely cooling down when the deadline hit. Callers see
    // the same empty outcome; operators should not.
    pub pool_exhausted_total: Counter,
    pub pool_cooling_total: Counter,

    // Streaming
    pub streams_recovered_total: Counter,
    pub stream_errors_emitted_total: Counter,

    // Persistence
    pub snapshots_written_total: Counter,
    pub snapshot_errors_total: Counter,
}

impl MetricsRegistry {
    fn new() -> Self {
        Self {
            requests_total: counter!("llm_rotator_requests_total"),
            requests_streaming_total: counter!("llm_rotator_requests_streaming_total"),
            key_rotations_total: counter!("llm_rotator_key_rotations_total"),
            key_failures_total: counter!("llm_rotator_key_failures_total"),
            key_lockouts_total: counter!("llm_rotator_key_lockouts_total"),
            cooldowns_set_total: counter!("llm_rotator_cooldowns_set_total"),
            pool_exhausted_total: counter!("llm_rotator_pool_exhausted_total"),
            pool_cooling_total: counter!("llm_rotator_pool_cooling_total"),
            streams_recovered_total: counter!("llm_rotator_streams_recovered_total"),
            stream_errors_emitted_total: counter!("llm_rotator_stream_errors_emitted_total"),
            snapshots_written_total: counter!("llm_rotator_snapshots_written_total"),
            snapshot_errors_total: counter!("llm_rotator_snapshot_errors_total"),
        }
    }
}
