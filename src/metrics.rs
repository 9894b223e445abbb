// Prometheus metrics definitions for the arena.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Matches currently running (0 or 1 per server).
    pub static ref ACTIVE_MATCHES: IntGauge =
        IntGauge::new("arena_active_matches", "Currently running matches").unwrap();

    /// Agent child processes that have been launched and not yet stopped.
    pub static ref LIVE_AGENT_PROCESSES: IntGauge =
        IntGauge::new("arena_live_agent_processes", "Live agent child processes").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Total matches started, by format (1v1, ffa).
    pub static ref MATCHES_STARTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_matches_started_total", "Total matches started"),
        &["format"],
    )
    .unwrap();

    /// Total matches that produced a winner, by format.
    pub static ref MATCHES_COMPLETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_matches_completed_total", "Total matches completed"),
        &["format"],
    )
    .unwrap();

    /// Total matches cancelled or failed, by format.
    pub static ref MATCHES_ABORTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_matches_aborted_total", "Total matches aborted"),
        &["format"],
    )
    .unwrap();

    /// Agent turns, by outcome (move, forfeit, idle).
    pub static ref AGENT_TURNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_agent_turns_total", "Total agent turns"),
        &["outcome"],
    )
    .unwrap();

    /// Agent forfeits, by reason.
    pub static ref AGENT_FORFEITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_agent_forfeits_total", "Agents eliminated for a process fault"),
        &["reason"],
    )
    .unwrap();

    /// Diagnostic lines captured from agent stderr.
    pub static ref DIAGNOSTIC_LINES_TOTAL: IntCounter = IntCounter::new(
        "arena_diagnostic_lines_total",
        "Diagnostic lines captured from agents",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Time an agent took to answer one request, by format.
    pub static ref DECISION_DURATION_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("arena_decision_duration_ms", "Agent decision time in ms")
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]),
        &["format"],
    )
    .unwrap();

    /// Wall-clock match duration in seconds, by format.
    pub static ref MATCH_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("arena_match_duration_seconds", "Match duration in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["format"],
    )
    .unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with the custom registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(ACTIVE_MATCHES.clone()),
            Box::new(LIVE_AGENT_PROCESSES.clone()),
            Box::new(MATCHES_STARTED_TOTAL.clone()),
            Box::new(MATCHES_COMPLETED_TOTAL.clone()),
            Box::new(MATCHES_ABORTED_TOTAL.clone()),
            Box::new(AGENT_TURNS_TOTAL.clone()),
            Box::new(AGENT_FORFEITS_TOTAL.clone()),
            Box::new(DIAGNOSTIC_LINES_TOTAL.clone()),
            Box::new(DECISION_DURATION_MS.clone()),
            Box::new(MATCH_DURATION_SECONDS.clone()),
        ];

        for c in collectors {
            if let Err(e) = REGISTRY.register(c) {
                tracing::warn!("Failed to register metric: {e}");
            }
        }
    });
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {e}");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Metric label for a match with `agents` usable agents.
pub fn format_label(agents: usize) -> &'static str {
    if agents == 2 {
        "1v1"
    } else {
        "ffa"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_label() {
        assert_eq!(format_label(2), "1v1");
        assert_eq!(format_label(3), "ffa");
        assert_eq!(format_label(4), "ffa");
    }

    #[test]
    fn test_gather_metrics_returns_string() {
        register_metrics();
        register_metrics();
        MATCHES_STARTED_TOTAL.with_label_values(&["1v1"]).inc();
        let output = gather_metrics();
        assert!(output.contains("arena_matches_started_total"));
    }

    #[test]
    fn test_metric_increments() {
        let before = AGENT_FORFEITS_TOTAL.with_label_values(&["timeout"]).get();
        AGENT_FORFEITS_TOTAL.with_label_values(&["timeout"]).inc();
        assert_eq!(
            AGENT_FORFEITS_TOTAL.with_label_values(&["timeout"]).get(),
            before + 1
        );

        AGENT_TURNS_TOTAL.with_label_values(&["move"]).inc();
        DIAGNOSTIC_LINES_TOTAL.inc_by(3);
        DECISION_DURATION_MS.with_label_values(&["1v1"]).observe(1.5);
        MATCH_DURATION_SECONDS.with_label_values(&["ffa"]).observe(2.0);
    }
}
