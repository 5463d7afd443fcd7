//! Prometheus metrics for the bridge coordinator
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    Gauge, HistogramVec, IntCounterVec, IntGaugeVec,
};

use crate::types::{Chain, Direction, TransferState};

lazy_static! {
    // Event source metrics
    pub static ref LATEST_BLOCK: IntGaugeVec = register_int_gauge_vec!(
        "coordinator_latest_block",
        "Latest confirmed block reported by the event source",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_OBSERVED: IntCounterVec = register_int_counter_vec!(
        "coordinator_events_observed_total",
        "Total number of bridge events delivered to the engine",
        &["chain", "kind"]
    ).unwrap();

    pub static ref DUPLICATE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "coordinator_duplicate_events_total",
        "Events for transfers already in the ledger",
        &["chain"]
    ).unwrap();

    pub static ref REORGS: IntCounterVec = register_int_counter_vec!(
        "coordinator_reorgs_total",
        "Chain reorganisations detected by the event source",
        &["chain"]
    ).unwrap();

    pub static ref SOURCE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "coordinator_source_errors_total",
        "Transient errors while polling a chain",
        &["chain"]
    ).unwrap();

    pub static ref DEFERRED_EVENTS: IntGaugeVec = register_int_gauge_vec!(
        "coordinator_deferred_events",
        "Origin events waiting to be recorded after a ledger write failed",
        &["chain"]
    ).unwrap();

    // Transfer lifecycle
    pub static ref TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "coordinator_transitions_total",
        "Transfer state transitions",
        &["direction", "to"]
    ).unwrap();

    pub static ref TRANSFERS_BY_STATE: IntGaugeVec = register_int_gauge_vec!(
        "coordinator_transfers",
        "Transfers currently in each state",
        &["state"]
    ).unwrap();

    pub static ref FLAGGED: IntCounterVec = register_int_counter_vec!(
        "coordinator_flagged_total",
        "Transfers flagged for operator review",
        &["reason"]
    ).unwrap();

    // Actuation
    pub static ref ACTUATIONS: IntCounterVec = register_int_counter_vec!(
        "coordinator_actuations_total",
        "Destination calls by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref ACTUATION_LATENCY: HistogramVec = register_histogram_vec!(
        "coordinator_actuation_latency_seconds",
        "Time from submission to destination finality",
        &["direction"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "coordinator_up",
        "Whether the coordinator is up and running"
    ).unwrap();
}

/// Record an event delivered by a source
pub fn record_event(chain: Chain, direction: Direction) {
    EVENTS_OBSERVED
        .with_label_values(&[chain.as_str(), direction.as_str()])
        .inc();
}

/// Record a committed state transition
pub fn record_transition(direction: Direction, to: TransferState) {
    TRANSITIONS
        .with_label_values(&[direction.as_str(), to.as_str()])
        .inc();
}

/// Record the outcome of a destination call
pub fn record_actuation(chain: Chain, outcome: &str) {
    ACTUATIONS.with_label_values(&[chain.as_str(), outcome]).inc();
}

pub fn record_flag(reason: &str) {
    FLAGGED.with_label_values(&[reason]).inc();
}

/// Publish the ledger's per-state counts
pub fn set_state_counts<'a>(counts: impl IntoIterator<Item = (&'a TransferState, &'a usize)>) {
    for (state, count) in counts {
        TRANSFERS_BY_STATE
            .with_label_values(&[state.as_str()])
            .set(*count as i64);
    }
}
