//! Prometheus counters and gauges for the feed handler.
//!
//! Counters are monotonic and may be bumped from any task; reads are racy
//! but consistent enough for telemetry.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};

const LABEL_CLASS: &str = "class";
const LABEL_SESSION: &str = "session";
const LABEL_RESOURCE: &str = "resource";
const LABEL_CLOCK: &str = "clock";

/// HTTP responses by class: "1xx".."5xx" plus the exact "200" and "304".
static HTTP_RESPONSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "psych_http_responses_total",
        "Upstream HTTP responses by status class",
        &[LABEL_CLASS]
    )
    .expect("Failed to register http_responses metric")
});

static HTTP_MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "psych_http_malformed_total",
        "Upstream responses rejected before publishing"
    )
    .expect("Failed to register http_malformed metric")
});

static HTTP_RETRIES_EXCEEDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "psych_http_retries_exceeded_total",
        "Fetch cycles abandoned with connections still pending"
    )
    .expect("Failed to register retries_exceeded metric")
});

static TICKS_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "psych_ticks_skipped_total",
        "Timer ticks dropped because a cycle was still running"
    )
    .expect("Failed to register ticks_skipped metric")
});

static MSGS_SENT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "psych_msgs_sent_total",
        "Refresh messages dispatched to the provider"
    )
    .expect("Failed to register msgs_sent metric")
});

/// Clock drift gauges, one per resource and clock source
/// (`httpd` = server Date header, `http` = file modification time,
/// `psych` = bulletin close time), all relative to the request time.
static CLOCK_OFFSET: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "psych_clock_offset_seconds",
        "Upstream clock offsets relative to the request time",
        &[LABEL_RESOURCE, LABEL_CLOCK]
    )
    .expect("Failed to register clock_offset metric")
});

static CYCLE_DURATION: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "psych_cycle_duration_milliseconds",
        "Duration of the last fetch-and-publish cycle"
    )
    .expect("Failed to register cycle_duration metric")
});

static SUBMITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "psych_session_submits_total",
        "Messages submitted through the wire library per session",
        &[LABEL_SESSION]
    )
    .expect("Failed to register session_submits metric")
});

static TOKENS_GENERATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "psych_session_tokens_generated_total",
        "Item tokens issued per session",
        &[LABEL_SESSION]
    )
    .expect("Failed to register tokens_generated metric")
});

static CMD_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "psych_session_cmd_errors_total",
        "Command error events received per session",
        &[LABEL_SESSION]
    )
    .expect("Failed to register cmd_errors metric")
});

static EVENTS_DISCARDED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "psych_session_events_discarded_total",
        "Inbound events dropped without a handler per session",
        &[LABEL_SESSION]
    )
    .expect("Failed to register events_discarded metric")
});

static LOCK_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "psych_lock_failures_total",
        "Permission locks that failed to encode"
    )
    .expect("Failed to register lock_failures metric")
});

/// Count one upstream response. 200 and 304 are counted under their exact
/// code in addition to their class.
pub fn inc_http_response(status: u16) {
    let class = match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };
    HTTP_RESPONSES.with_label_values(&[class]).inc();
    if status == 200 {
        HTTP_RESPONSES.with_label_values(&["200"]).inc();
    }
    if status == 304 {
        HTTP_RESPONSES.with_label_values(&["304"]).inc();
    }
}

pub fn http_response_count(class: &str) -> u64 {
    HTTP_RESPONSES.with_label_values(&[class]).get()
}

pub fn inc_http_malformed() {
    HTTP_MALFORMED.inc();
}

pub fn http_malformed_count() -> u64 {
    HTTP_MALFORMED.get()
}

pub fn inc_retries_exceeded() {
    HTTP_RETRIES_EXCEEDED.inc();
}

pub fn inc_tick_skipped() {
    TICKS_SKIPPED.inc();
}

pub fn ticks_skipped_count() -> u64 {
    TICKS_SKIPPED.get()
}

pub fn inc_msgs_sent() {
    MSGS_SENT.inc();
}

pub fn msgs_sent_count() -> u64 {
    MSGS_SENT.get()
}

pub fn inc_lock_failure() {
    LOCK_FAILURES.inc();
}

pub fn set_clock_offset(resource: &str, clock: &str, seconds: i64) {
    CLOCK_OFFSET.with_label_values(&[resource, clock]).set(seconds);
}

pub fn set_cycle_duration_ms(millis: f64) {
    CYCLE_DURATION.set(millis);
}

/// Handle for recording per-session counters.
#[derive(Clone)]
pub struct SessionMetrics {
    session: String,
}

impl SessionMetrics {
    pub fn new(session: impl Into<String>) -> Self {
        Self { session: session.into() }
    }

    pub fn inc_submit(&self) {
        SUBMITS.with_label_values(&[&self.session]).inc();
    }

    pub fn inc_token_generated(&self) {
        TOKENS_GENERATED.with_label_values(&[&self.session]).inc();
    }

    pub fn inc_cmd_error(&self) {
        CMD_ERRORS.with_label_values(&[&self.session]).inc();
    }

    pub fn inc_event_discarded(&self) {
        EVENTS_DISCARDED.with_label_values(&[&self.session]).inc();
    }

    pub fn cmd_error_count(&self) -> u64 {
        CMD_ERRORS.with_label_values(&[&self.session]).get()
    }
}

/// Encode all registered metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_response_classes() {
        inc_http_response(503);
        let fives = http_response_count("5xx");
        inc_http_response(500);
        assert_eq!(http_response_count("5xx"), fives + 1);

        let ok = http_response_count("200");
        inc_http_response(200);
        assert_eq!(http_response_count("200"), ok + 1);
    }

    #[test]
    fn test_session_metrics() {
        let metrics = SessionMetrics::new("SESSIONA");
        let before = metrics.cmd_error_count();
        metrics.inc_cmd_error();
        metrics.inc_submit();
        metrics.inc_token_generated();
        assert_eq!(metrics.cmd_error_count(), before + 1);
    }

    #[test]
    fn test_encode_metrics() {
        inc_msgs_sent();
        let output = encode_metrics().unwrap();
        assert!(output.contains("psych_msgs_sent_total"));
    }
}
