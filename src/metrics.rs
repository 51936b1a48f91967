// src/metrics.rs
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::ToSocketAddrs;
use std::thread;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Error-taxonomy counters: fatal_session / recoverable_flow /
// recoverable_record / advisory. The granular counters below feed these.
static ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(Opts::new("errors", "Errors by taxonomy kind"), &["kind"])
        .expect("errors");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static CAPTURE_FRAMES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("capture_frames", "Frames delivered by the capture device")
        .expect("capture_frames");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static CAPTURE_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("capture_bytes", "Bytes delivered by the capture device")
        .expect("capture_bytes");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static CAPTURE_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("capture_drops", "Frames dropped on worker backpressure")
        .expect("capture_drops");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FLOWS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("flows_active", "Tracked TCP flows").expect("flows_active");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static FLOWS_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("flows_evicted", "Flows evicted after idle timeout")
        .expect("flows_evicted");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FLOWS_CLOSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("flows_closed", "Flows closed by FIN/RST").expect("flows_closed");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FLOW_OOO: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("flow_out_of_order", "Segments buffered out of order")
        .expect("flow_out_of_order");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FLOW_RETRANSMITS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("flow_retransmits", "Segments dropped as retransmit/overlap")
        .expect("flow_retransmits");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FLOW_RESYNCS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("flow_resyncs", "Reorder-buffer overflows forcing a stream resync")
        .expect("flow_resyncs");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RECORDS: Lazy<IntCounter> =
    Lazy::new(|| {
        let c = IntCounter::new("records", "Application records framed").expect("records");
        REGISTRY.register(Box::new(c.clone())).ok();
        c
    });

static RECORD_SCHEMA_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("record_schema_errors", "Records rejected by schema checks")
        .expect("record_schema_errors");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RECORD_DECOMPRESS_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("record_decompress_errors", "Zstd containers that failed to inflate")
        .expect("record_decompress_errors");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RECORD_RESYNCS_ENTERED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("record_resyncs_entered", "Framing resync scans started")
        .expect("record_resyncs_entered");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RECORD_RESYNCS_LOCKED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("record_resyncs_locked", "Framing resync scans that re-locked")
        .expect("record_resyncs_locked");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static UNKNOWN_KINDS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("record_unknown_kinds", "Records with an unmapped kind tag")
        .expect("record_unknown_kinds");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("events_dispatched", "Events applied to the combat model")
        .expect("events_dispatched");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static EVENTS_PAUSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("events_discarded_paused", "Events discarded while paused")
        .expect("events_discarded_paused");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static EVENTS_IGNORED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("events_ignored", "Events ignored by dispatch rules")
        .expect("events_ignored");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FETCH_OK: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("fetch_ok", "Successful metadata fetches").expect("fetch_ok");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FETCH_FAIL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("fetch_fail", "Failed metadata fetches (negative-cached)")
        .expect("fetch_fail");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FETCH_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("fetch_dropped", "Fetch requests dropped on queue overflow")
        .expect("fetch_dropped");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static WORKER_RESTARTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("worker_restarts", "Packet worker restarts after a panic")
        .expect("worker_restarts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn inc_capture(bytes: usize) {
    CAPTURE_FRAMES.inc();
    CAPTURE_BYTES.inc_by(bytes as u64);
}
pub fn inc_capture_drop() {
    CAPTURE_DROPS.inc();
}

pub fn set_flows_active(n: usize) {
    FLOWS_ACTIVE.set(n as i64);
}
pub fn inc_flows_evicted(n: u64) {
    FLOWS_EVICTED.inc_by(n);
}
pub fn inc_flow_closed() {
    FLOWS_CLOSED.inc();
}
pub fn inc_flow_ooo() {
    FLOW_OOO.inc();
}
pub fn inc_flow_retransmit() {
    FLOW_RETRANSMITS.inc();
}
pub fn inc_flow_resync() {
    FLOW_RESYNCS.inc();
    ERRORS.with_label_values(&["recoverable_flow"]).inc();
}

pub fn inc_records(n: u64) {
    RECORDS.inc_by(n);
}
pub fn inc_record_schema_error() {
    RECORD_SCHEMA_ERRORS.inc();
    ERRORS.with_label_values(&["recoverable_record"]).inc();
}
pub fn inc_record_decompress_error() {
    RECORD_DECOMPRESS_ERRORS.inc();
    ERRORS.with_label_values(&["recoverable_record"]).inc();
}
pub fn inc_record_resync_entered() {
    RECORD_RESYNCS_ENTERED.inc();
    ERRORS.with_label_values(&["recoverable_record"]).inc();
}
pub fn inc_record_resync_locked() {
    RECORD_RESYNCS_LOCKED.inc();
}
pub fn inc_unknown_kind() {
    UNKNOWN_KINDS.inc();
    ERRORS.with_label_values(&["advisory"]).inc();
}

pub fn inc_events(n: u64) {
    EVENTS.inc_by(n);
}
pub fn inc_events_discarded_paused() {
    EVENTS_PAUSED.inc();
}
pub fn inc_events_ignored() {
    EVENTS_IGNORED.inc();
    ERRORS.with_label_values(&["advisory"]).inc();
}

pub fn inc_fetch_ok() {
    FETCH_OK.inc();
}
pub fn inc_fetch_fail() {
    FETCH_FAIL.inc();
    ERRORS.with_label_values(&["advisory"]).inc();
}
pub fn inc_fetch_dropped() {
    FETCH_DROPPED.inc();
    ERRORS.with_label_values(&["advisory"]).inc();
}

pub fn inc_fatal_session() {
    ERRORS.with_label_values(&["fatal_session"]).inc();
}
pub fn inc_worker_restart() {
    WORKER_RESTARTS.inc();
}

/// Counter dump for the read-side API.
pub fn errors_snapshot() -> serde_json::Value {
    serde_json::json!({
        "fatalSession": ERRORS.with_label_values(&["fatal_session"]).get(),
        "recoverableFlow": ERRORS.with_label_values(&["recoverable_flow"]).get(),
        "recoverableRecord": ERRORS.with_label_values(&["recoverable_record"]).get(),
        "advisory": ERRORS.with_label_values(&["advisory"]).get(),
        "captureFrames": CAPTURE_FRAMES.get(),
        "captureDrops": CAPTURE_DROPS.get(),
        "flowResyncs": FLOW_RESYNCS.get(),
        "flowsEvicted": FLOWS_EVICTED.get(),
        "records": RECORDS.get(),
        "schemaErrors": RECORD_SCHEMA_ERRORS.get(),
        "decompressErrors": RECORD_DECOMPRESS_ERRORS.get(),
        "unknownKinds": UNKNOWN_KINDS.get(),
        "eventsDispatched": EVENTS.get(),
        "fetchFailures": FETCH_FAIL.get(),
        "workerRestarts": WORKER_RESTARTS.get(),
    })
}

pub fn spawn_http<A: ToSocketAddrs + Send + 'static>(addr: A) -> thread::JoinHandle<()> {
    let addr_string = addr
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "127.0.0.1:9100".to_string());

    thread::spawn(move || {
        let server = tiny_http::Server::http(&addr_string).expect("start metrics http");
        log::info!("prometheus metrics listening on http://{addr_string}/metrics");
        let encoder = TextEncoder::new();
        loop {
            if let Ok(req) = server.recv() {
                let url = req.url().to_string();
                if url == "/metrics" {
                    let metric_families = REGISTRY.gather();
                    let mut buf = Vec::with_capacity(16 * 1024);
                    encoder.encode(&metric_families, &mut buf).ok();
                    let resp = tiny_http::Response::from_data(buf)
                        .with_status_code(200)
                        .with_header(
                            tiny_http::Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"text/plain; version=0.0.4"[..],
                            )
                            .unwrap(),
                        );
                    let _ = req.respond(resp);
                } else if url == "/live" || url == "/healthz" {
                    let _ =
                        req.respond(tiny_http::Response::from_string("OK").with_status_code(200));
                } else if url == "/shutdown" {
                    let _ =
                        req.respond(tiny_http::Response::from_string("BYE").with_status_code(200));
                    break;
                } else {
                    let _ = req.respond(tiny_http::Response::empty(404));
                }
            }
        }
    })
}
