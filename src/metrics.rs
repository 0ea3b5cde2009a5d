// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gateway metrics, in the counters-behind-`Lazy`-statics style
//! `iota-proxy`'s `middleware.rs` uses.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge, Registry,
};

pub static PIPELINE_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gateway_pipeline_decisions_total",
        "Pipeline stage decisions by stage and outcome.",
        &["stage", "outcome"]
    )
    .unwrap()
});

pub static CU_CHARGED: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_cu_charged",
        "Compute units charged per request, by network and tier.",
        &["network", "tier"]
    )
    .unwrap()
});

pub static OPEN_CIRCUITS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gateway_open_circuit_breakers",
        "Number of KV backend circuit breakers currently open."
    )
    .unwrap()
});

/// Starts a minimal Prometheus text-exposition endpoint on `listener`,
/// mirroring `iota-proxy`'s dedicated metrics listener pattern.
pub fn start_prometheus_server(listener: std::net::TcpListener) -> Registry {
    let registry = Registry::new();
    registry
        .register(Box::new(PIPELINE_DECISIONS.clone()))
        .ok();
    registry.register(Box::new(CU_CHARGED.clone())).ok();
    registry.register(Box::new(OPEN_CIRCUITS.clone())).ok();

    let registry_clone = registry.clone();
    listener.set_nonblocking(true).ok();
    let listener = tokio::net::TcpListener::from_std(listener).expect("metrics listener");
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || render_metrics(registry_clone.clone())),
        );
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server exited");
        }
    });
    registry
}

async fn render_metrics(registry: Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}
