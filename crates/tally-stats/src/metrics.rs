//! Prometheus metrics for the accounting runtime.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// History Log Metrics
// ============================================================================

/// Records written to the history log
pub static HISTORY_RECORDS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("tally_history_records", "Records written to the history log").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Self-cancelling updates merged away by rewind compaction
pub static HISTORY_MERGES: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "tally_history_merges",
        "Self-cancelling updates merged away by rewind compaction",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// History buffer rotations
pub static HISTORY_ROTATIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("tally_history_rotations", "History buffer rotations").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Active history buffer size in bytes
pub static HISTORY_BUFFER_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "tally_history_buffer_bytes",
        "Active history buffer size in bytes",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Interned tags in the pool
pub static TAG_POOL_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("tally_tag_pool_entries", "Interned tags in the pool").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Tag writes that spilled past the pool ceiling
pub static TAG_POOL_OVERFLOWS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "tally_tag_pool_overflows",
        "Tag writes that spilled past the pool ceiling",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Kernel Metrics
// ============================================================================

/// Timers currently held (nesting > 0)
pub static TIMERS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("tally_timers_active", "Timers currently held").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Workload events fed into the kernel
pub static EVENTS_NOTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter =
        IntCounter::new("tally_events_noted_total", "Workload events fed into the kernel").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Persistence Metrics
// ============================================================================

/// Checkpoints written
pub static CHECKPOINT_WRITES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("tally_checkpoint_writes_total", "Checkpoints written").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Checkpoint writes or loads that failed
pub static CHECKPOINT_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tally_checkpoint_failures_total",
        "Checkpoint writes or loads that failed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Rotated history buffers flushed to the store
pub static BUFFERS_FLUSHED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "tally_buffers_flushed_total",
        "Rotated history buffers flushed to the store",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let path = request.url();

            match path {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = REGISTRY.gather();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let response = Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    );
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once the workload has recorded something.
                    if HISTORY_RECORDS.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = HISTORY_RECORDS.get();
    let _ = HISTORY_MERGES.get();
    let _ = HISTORY_ROTATIONS.get();
    let _ = HISTORY_BUFFER_BYTES.get();
    let _ = TAG_POOL_ENTRIES.get();
    let _ = TAG_POOL_OVERFLOWS.get();
    let _ = TIMERS_ACTIVE.get();
    let _ = EVENTS_NOTED.get();
    let _ = CHECKPOINT_WRITES.get();
    let _ = CHECKPOINT_FAILURES.get();
    let _ = BUFFERS_FLUSHED.get();
}

/// Push the kernel's current counters into the gauges.
pub fn update_from(stats: &tally_history::HistoryStats, active_timers: usize) {
    HISTORY_RECORDS.set(stats.records as i64);
    HISTORY_MERGES.set(stats.merges as i64);
    HISTORY_ROTATIONS.set(stats.rotations as i64);
    HISTORY_BUFFER_BYTES.set(stats.buffer_bytes as i64);
    TAG_POOL_ENTRIES.set(stats.tag_pool_entries as i64);
    TAG_POOL_OVERFLOWS.set(stats.tag_pool_overflows as i64);
    TIMERS_ACTIVE.set(active_timers as i64);
}
