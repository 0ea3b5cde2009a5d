// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios (spec §8): drives the full axum router built by
//! `admin::app` with an in-memory KV store and a real upstream HTTP
//! server, so nothing here needs a live Redis.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use serde_json::json;
use tower::ServiceExt;

use unifra_gateway::admin::{app, GatewayState, RouteBinding};
use unifra_gateway::circuit_breaker::BreakerRegistry;
use unifra_gateway::config::tests_support::sample_route;
use unifra_gateway::config_store::ConfigStore;
use unifra_gateway::kv::fake::FakeKvStore;
use unifra_gateway::kv::KvStore;
use unifra_gateway::pipeline::consumer_vars::ConsumerVarsStage;
use unifra_gateway::pipeline::cu_calc::CuCalcStage;
use unifra_gateway::pipeline::guard::GuardStage;
use unifra_gateway::pipeline::monthly_limiter::MonthlyLimiterStage;
use unifra_gateway::pipeline::parser::ParserStage;
use unifra_gateway::pipeline::rate_limiter::RateLimiterStage;
use unifra_gateway::pipeline::whitelist::WhitelistStage;
use unifra_gateway::pipeline::Pipeline;
use unifra_gateway::upstream::{ResolvedUpstream, Scheme, UpstreamResolver};

struct FixedUpstreamResolver(SocketAddr);

impl UpstreamResolver for FixedUpstreamResolver {
    fn resolve(&self, _upstream: &str) -> anyhow::Result<ResolvedUpstream> {
        Ok(ResolvedUpstream {
            scheme: Scheme::Http,
            host: self.0.ip().to_string(),
            port: self.0.port(),
            tls: false,
        })
    }
}

/// Starts a minimal upstream that always answers with `body`, and returns
/// its bound address.
async fn spawn_upstream(body: serde_json::Value) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = axum::Router::new().route(
        "/",
        post(move || {
            let body = body.clone();
            async move { axum::Json(body).into_response() }
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "unifra-gateway-e2e-{}-{}-{}",
        std::process::id(),
        name,
        nonce()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

fn nonce() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static N: AtomicU64 = AtomicU64::new(0);
    N.fetch_add(1, Ordering::SeqCst)
}

struct Harness {
    state: Arc<GatewayState>,
    kv: Arc<FakeKvStore>,
}

async fn build_harness(upstream_addr: SocketAddr) -> Harness {
    let whitelist_path = write_temp(
        "whitelist.json",
        r#"{"networks":{"eth-mainnet":{"free":["eth_*"],"paid":["debug_*"]}}}"#,
    );
    let pricing_path = write_temp(
        "pricing.json",
        r#"{"default":1,"methods":{"eth_call":15,"debug_*":50}}"#,
    );

    let mut route = sample_route();
    route.whitelist.config_path = whitelist_path;
    route.cu_calc.config_path = pricing_path;

    let config_store = Arc::new(ConfigStore::new());
    let kv = Arc::new(FakeKvStore::new());
    let kv_dyn: Arc<dyn KvStore> = kv.clone();
    let breakers = Arc::new(BreakerRegistry::new(5, Duration::from_secs(60)));

    let pipeline = Arc::new(Pipeline::new(vec![
        Box::new(ParserStage),
        Box::new(GuardStage),
        Box::new(ConsumerVarsStage),
        Box::new(WhitelistStage {
            store: config_store.clone(),
        }),
        Box::new(CuCalcStage {
            store: config_store.clone(),
        }),
        Box::new(RateLimiterStage {
            store: kv_dyn.clone(),
            breakers: breakers.clone(),
        }),
        Box::new(MonthlyLimiterStage {
            store: kv_dyn.clone(),
            breakers: breakers.clone(),
        }),
    ]));

    let state = Arc::new(GatewayState {
        routes: vec![RouteBinding {
            route,
            pipeline,
            ws_pipeline: None,
            kv: kv_dyn,
            config_store,
            resolver: Arc::new(FixedUpstreamResolver(upstream_addr)),
            breakers,
            http_client: reqwest::Client::new(),
        }],
    });

    Harness { state, kv }
}

fn request(body: &str, consumer: serde_json::Value) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri("/")
        .header("host", "eth-mainnet.example")
        .header("content-type", "application/json")
        .header("x-unifra-consumer", consumer.to_string())
        .body(Body::from(body.to_string()))
        .unwrap();
    req.extensions_mut()
        .insert(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 5000))));
    req
}

fn default_consumer() -> serde_json::Value {
    json!({"name": "acme", "seconds_quota": 100, "monthly_quota": 10000})
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn scenario_1_single_allowed_call_is_forwarded_with_quota_headers() {
    let upstream = spawn_upstream(json!({"jsonrpc":"2.0","result":"0x1","id":1})).await;
    let harness = build_harness(upstream).await;

    let req = request(
        r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#,
        default_consumer(),
    );
    let resp = app(harness.state.clone()).oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-monthly-remaining").unwrap(), "9999");
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "99");
    let body = body_json(resp).await;
    assert_eq!(body["result"], "0x1");
}

#[tokio::test]
async fn scenario_2_paid_method_by_free_consumer_is_forbidden_without_kv_write() {
    let upstream = spawn_upstream(json!({"jsonrpc":"2.0","result":"ok","id":1})).await;
    let harness = build_harness(upstream).await;

    let req = request(
        r#"{"jsonrpc":"2.0","method":"debug_traceTransaction","id":1}"#,
        default_consumer(),
    );
    let resp = app(harness.state.clone()).oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32603, "message": "method debug_traceTransaction requires paid tier"},
            "id": 1,
        })
    );
    assert_eq!(harness.kv.get("quota:monthly:acme:202608"), 0);
}

#[tokio::test]
async fn scenario_3_batch_cu_sums_across_methods() {
    let upstream = spawn_upstream(json!([
        {"jsonrpc":"2.0","result":"0x1","id":1},
        {"jsonrpc":"2.0","result":"0x2","id":2},
        {"jsonrpc":"2.0","result":"0x1","id":3},
    ]))
    .await;
    let harness = build_harness(upstream).await;

    let req = request(
        r#"[{"method":"eth_blockNumber","id":1},{"method":"eth_call","id":2},{"method":"eth_blockNumber","id":3}]"#,
        default_consumer(),
    );
    let resp = app(harness.state.clone()).oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    // eth_blockNumber (default=1) + eth_call (15) + eth_blockNumber (1) = 17
    assert_eq!(resp.headers().get("x-monthly-remaining").unwrap(), "9983");
}

#[tokio::test]
async fn scenario_4_monthly_overrun_rejects_without_mutating_kv() {
    let upstream = spawn_upstream(json!({"jsonrpc":"2.0","result":"ok","id":1})).await;
    let harness = build_harness(upstream).await;
    harness.kv.preload("quota:monthly:acme:202608", 9990);

    let req = request(
        r#"{"jsonrpc":"2.0","method":"eth_call","id":1}"#,
        default_consumer(),
    );
    let resp = app(harness.state.clone()).oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], -32005);
    assert_eq!(body["error"]["message"], "monthly quota exceeded");
    assert_eq!(harness.kv.get("quota:monthly:acme:202608"), 9990);
}

#[tokio::test]
async fn scenario_5_kv_outage_fails_open_then_breaker_bypasses_kv() {
    let upstream = spawn_upstream(json!({"jsonrpc":"2.0","result":"ok","id":1})).await;
    let harness = build_harness(upstream).await;
    // monthly_quota=0 keeps MonthlyLimiter a no-op so only RateLimiter's
    // breaker is under test (spec §8 scenario 5 only concerns the rate
    // limiter's KV path).
    let consumer = json!({"name": "acme", "seconds_quota": 100, "monthly_quota": 0});
    harness
        .kv
        .fail_next
        .store(5, std::sync::atomic::Ordering::SeqCst);

    for _ in 0..5 {
        let req = request(r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#, consumer.clone());
        let resp = app(harness.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "fail-open request should still be allowed");
    }

    let req = request(r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#, consumer);
    let resp = app(harness.state.clone()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK, "6th request bypasses the open breaker and is allowed");
    assert_eq!(
        harness.kv.fail_next.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "the 6th call never reached the kv store: fail_next was never consumed past the 5th"
    );
}
