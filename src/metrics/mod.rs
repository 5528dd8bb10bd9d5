//! Prometheus metrics

use crate::events::WalletEvent;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    pub static ref EVENTS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "multisig_events_processed_total",
        "Wallet events processed by type",
        &["event_type"]
    )
    .expect("metric registration");

    pub static ref BLOCK_HEIGHT: IntGaugeVec = register_int_gauge_vec!(
        "multisig_block_height",
        "Last processed block per chain",
        &["chain_id"]
    )
    .expect("metric registration");

    pub static ref PROPOSALS: IntCounterVec = register_int_counter_vec!(
        "multisig_proposals_total",
        "Proposal lifecycle outcomes",
        &["outcome"]
    )
    .expect("metric registration");

    pub static ref SIGNATURES_COLLECTED: IntCounter = register_int_counter!(
        "multisig_signatures_collected_total",
        "Signatures accepted into local proposals"
    )
    .expect("metric registration");

    pub static ref INSTANCE_SWITCHES: IntCounter = register_int_counter!(
        "multisig_instance_switches_total",
        "Active instance changes"
    )
    .expect("metric registration");

    pub static ref PROJECTION_RESYNCS: IntCounter = register_int_counter!(
        "multisig_projection_resyncs_total",
        "Full projection rebuilds triggered by detected gaps"
    )
    .expect("metric registration");

    pub static ref ACTIVE_EPOCH: IntGauge = register_int_gauge!(
        "multisig_active_epoch",
        "Current instance selection epoch"
    )
    .expect("metric registration");
}

pub fn record_event(event: &WalletEvent) {
    EVENTS_PROCESSED.with_label_values(&[event.name()]).inc();
}

pub fn record_blocks_processed(chain_id: u64, block: u64) {
    BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block as i64);
}

pub fn record_proposal_outcome(outcome: &str) {
    PROPOSALS.with_label_values(&[outcome]).inc();
}

pub fn record_signature() {
    SIGNATURES_COLLECTED.inc();
}

pub fn record_instance_switch(epoch: u64) {
    INSTANCE_SWITCHES.inc();
    ACTIVE_EPOCH.set(epoch as i64);
}

pub fn record_resync() {
    PROJECTION_RESYNCS.inc();
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serve `/metrics` on the configured port.
pub async fn serve(port: u16) {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server on {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics server listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}
