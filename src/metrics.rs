//! Prometheus instrumentation for the claim-trie processor.
//!
//! Grounded on the teacher's `lazy_static!` + `Registry` + `prometheus`
//! idiom (`examples/Liquid369-rusty-blox/src/metrics.rs`), with the
//! catalog itself rebuilt around this processor's own stages: chain
//! catch-up, the mempool mirror, the derived-data caches, and command
//! dispatch (spec.md §6/§8).

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use lazy_static::lazy_static;
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // -- catch-up / chain progress -----------------------------------

    /// Highest block height this processor has applied.
    pub static ref INDEXED_HEIGHT: IntGauge = IntGauge::new(
        "ddcs_processor_indexed_height",
        "Highest block height applied to storage"
    ).unwrap();

    /// Daemon-reported chain tip height, as last observed.
    pub static ref DAEMON_HEIGHT: IntGauge = IntGauge::new(
        "ddcs_processor_daemon_height",
        "Daemon-reported chain tip height"
    ).unwrap();

    /// Blocks applied, split by whether they extended the tip or replaced
    /// blocks during a reorg.
    pub static ref BLOCKS_APPLIED: IntCounterVec = IntCounterVec::new(
        Opts::new("ddcs_processor_blocks_applied_total", "Blocks applied by outcome"),
        &["outcome"]
    ).unwrap();

    /// Reorgs detected, labeled by the depth bucket rolled back.
    pub static ref REORGS_DETECTED: IntCounter = IntCounter::new(
        "ddcs_processor_reorgs_detected_total",
        "Total chain reorganizations detected"
    ).unwrap();

    /// Depth (in blocks) of the most recently handled reorg.
    pub static ref LAST_REORG_DEPTH: IntGauge = IntGauge::new(
        "ddcs_processor_last_reorg_depth",
        "Depth in blocks of the most recent reorg"
    ).unwrap();

    /// Wall-clock time spent applying a single block.
    pub static ref BLOCK_APPLY_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("ddcs_processor_block_apply_duration_seconds", "Time to apply one block")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    /// Daemon JSON-RPC call latency, labeled by method.
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("ddcs_processor_rpc_call_duration_seconds", "Daemon RPC call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    /// Daemon RPC errors, labeled by the processor's own classification.
    pub static ref RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("ddcs_processor_rpc_errors_total", "Daemon RPC errors by classification"),
        &["kind"]
    ).unwrap();

    // -- mempool mirror -------------------------------------------------

    /// Transactions currently held in the mempool mirror.
    pub static ref MEMPOOL_SIZE: IntGauge = IntGauge::new(
        "ddcs_processor_mempool_size",
        "Transactions currently tracked in the mempool mirror"
    ).unwrap();

    /// Mempool refresh cycles completed.
    pub static ref MEMPOOL_REFRESHES: IntCounter = IntCounter::new(
        "ddcs_processor_mempool_refreshes_total",
        "Total mempool refresh cycles completed"
    ).unwrap();

    /// Time spent on one mempool refresh cycle.
    pub static ref MEMPOOL_REFRESH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ddcs_processor_mempool_refresh_duration_seconds",
            "Time spent refreshing the mempool mirror"
        )
        .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    // -- derived-data caches ---------------------------------------------

    /// Cache lookups, labeled by region (short_term, long_term) and outcome
    /// (hit, miss).
    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("ddcs_processor_cache_lookups_total", "Cache lookups by region and outcome"),
        &["region", "outcome"]
    ).unwrap();

    /// Entries currently held per cache region.
    pub static ref CACHE_ENTRIES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ddcs_processor_cache_entries", "Entries currently held per cache region"),
        &["region"]
    ).unwrap();

    /// Wholesale cache clears (fired on every applied block).
    pub static ref CACHE_CLEARS: IntCounterVec = IntCounterVec::new(
        Opts::new("ddcs_processor_cache_clears_total", "Wholesale cache clears by region"),
        &["region"]
    ).unwrap();

    // -- command dispatch -------------------------------------------------

    /// Commands dispatched, labeled by method and outcome (ready, deferred,
    /// error).
    pub static ref COMMANDS_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("ddcs_processor_commands_dispatched_total", "Commands dispatched by method and outcome"),
        &["method", "outcome"]
    ).unwrap();

    /// Command dispatch latency, labeled by method.
    pub static ref COMMAND_DISPATCH_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "ddcs_processor_command_dispatch_duration_seconds",
            "Command dispatch latency by method"
        )
        .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    // -- subscriptions ----------------------------------------------------

    /// Active subscriber sessions, labeled by subscription kind.
    pub static ref SUBSCRIPTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ddcs_processor_subscriptions_active", "Active subscriptions by kind"),
        &["kind"]
    ).unwrap();

    /// Notifications fanned out to subscribers.
    pub static ref NOTIFICATIONS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("ddcs_processor_notifications_sent_total", "Notifications sent by kind"),
        &["kind"]
    ).unwrap();

    // -- operational -------------------------------------------------------

    /// Unix timestamp the process started at.
    pub static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::new(
        "ddcs_processor_start_timestamp_seconds",
        "Unix timestamp when the process started"
    ).unwrap();
}

/// Registers every metric with the global registry. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(INDEXED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(DAEMON_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_APPLIED.clone()))?;
    REGISTRY.register(Box::new(REORGS_DETECTED.clone()))?;
    REGISTRY.register(Box::new(LAST_REORG_DEPTH.clone()))?;
    REGISTRY.register(Box::new(BLOCK_APPLY_DURATION.clone()))?;
    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;

    REGISTRY.register(Box::new(MEMPOOL_SIZE.clone()))?;
    REGISTRY.register(Box::new(MEMPOOL_REFRESHES.clone()))?;
    REGISTRY.register(Box::new(MEMPOOL_REFRESH_DURATION.clone()))?;

    REGISTRY.register(Box::new(CACHE_LOOKUPS.clone()))?;
    REGISTRY.register(Box::new(CACHE_ENTRIES.clone()))?;
    REGISTRY.register(Box::new(CACHE_CLEARS.clone()))?;

    REGISTRY.register(Box::new(COMMANDS_DISPATCHED.clone()))?;
    REGISTRY.register(Box::new(COMMAND_DISPATCH_DURATION.clone()))?;

    REGISTRY.register(Box::new(SUBSCRIPTIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(NOTIFICATIONS_SENT.clone()))?;

    REGISTRY.register(Box::new(SERVICE_START_TIMESTAMP.clone()))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    SERVICE_START_TIMESTAMP.set(now as i64);

    Ok(())
}

/// Renders the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Simple wall-clock timer for histogram instrumentation.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Records a block apply and bumps the indexed-height gauge.
pub fn record_block_applied(outcome: &str, height: i32, duration_secs: f64) {
    BLOCKS_APPLIED.with_label_values(&[outcome]).inc();
    BLOCK_APPLY_DURATION.observe(duration_secs);
    INDEXED_HEIGHT.set(height as i64);
}

/// Records a detected reorg and its rollback depth.
pub fn record_reorg(depth: u32) {
    REORGS_DETECTED.inc();
    LAST_REORG_DEPTH.set(depth as i64);
}

/// Records one daemon RPC call's latency.
pub fn record_rpc_call(method: &str, duration_secs: f64) {
    RPC_CALL_DURATION.with_label_values(&[method]).observe(duration_secs);
}

/// Records a daemon RPC error, classified by kind (e.g. "unavailable",
/// "fatal", "rejected").
pub fn record_rpc_error(kind: &str) {
    RPC_ERRORS.with_label_values(&[kind]).inc();
}

/// Records one mempool refresh cycle, updating the size gauge.
pub fn record_mempool_refresh(size: usize, duration_secs: f64) {
    MEMPOOL_REFRESHES.inc();
    MEMPOOL_REFRESH_DURATION.observe(duration_secs);
    MEMPOOL_SIZE.set(size as i64);
}

/// Records a cache lookup outcome ("hit" or "miss") for a region
/// ("short_term" or "long_term").
pub fn record_cache_lookup(region: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS.with_label_values(&[region, outcome]).inc();
}

/// Sets the current entry count for a cache region.
pub fn set_cache_entries(region: &str, entries: usize) {
    CACHE_ENTRIES.with_label_values(&[region]).set(entries as i64);
}

/// Records a wholesale cache clear for a region.
pub fn record_cache_clear(region: &str) {
    CACHE_CLEARS.with_label_values(&[region]).inc();
}

/// Records a dispatched command's outcome and latency.
pub fn record_command_dispatch(method: &str, outcome: &str, duration_secs: f64) {
    COMMANDS_DISPATCHED.with_label_values(&[method, outcome]).inc();
    COMMAND_DISPATCH_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Sets the active subscription count for a kind ("numblocks", "headers",
/// "address").
pub fn set_subscriptions_active(kind: &str, count: usize) {
    SUBSCRIPTIONS_ACTIVE.with_label_values(&[kind]).set(count as i64);
}

/// Records a notification fanned out to subscribers of a given kind.
pub fn record_notification_sent(kind: &str) {
    NOTIFICATIONS_SENT.with_label_values(&[kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_reports_nonzero_elapsed() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed_secs() > 0.0);
    }

    #[test]
    fn record_helpers_do_not_panic_without_registration() {
        record_block_applied("extend", 100, 0.01);
        record_reorg(2);
        record_rpc_call("getblock", 0.02);
        record_rpc_error("unavailable");
        record_mempool_refresh(5, 0.03);
        record_cache_lookup("short_term", true);
        record_cache_lookup("long_term", false);
        set_cache_entries("short_term", 10);
        record_cache_clear("short_term");
        record_command_dispatch("blockchain.address.get_history", "ready", 0.005);
        set_subscriptions_active("address", 3);
        record_notification_sent("numblocks");
    }

    #[test]
    fn gather_metrics_after_init_contains_known_metric() {
        init_metrics().unwrap();
        let text = gather_metrics();
        assert!(text.contains("ddcs_processor_indexed_height"));
    }
}
