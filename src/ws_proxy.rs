// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! WSProxy stage (spec §4.10): a WebSocket man-in-the-middle that opens
//! the upstream connection first, accepts the client upgrade only on
//! upstream success, then runs two concurrent forwarders that re-run the
//! pipeline (§4.1-§4.6, no MonthlyLimiter, since spec §2's dependency chain
//! stops WSProxy's re-run at RateLimiter) per inbound client text frame.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::MaybeTlsStream;

use crate::circuit_breaker::BreakerRegistry;
use crate::config::RouteConfig;
use crate::config_store::ConfigStore;
use crate::context::{Context, ConsumerIdentity};
use crate::error::StageOutcome;
use crate::kv::KvStore;
use crate::pipeline::consumer_vars::ConsumerVarsStage;
use crate::pipeline::cu_calc::CuCalcStage;
use crate::pipeline::guard::GuardStage;
use crate::pipeline::parser::ParserStage;
use crate::pipeline::rate_limiter::RateLimiterStage;
use crate::pipeline::whitelist::WhitelistStage;
use crate::pipeline::Pipeline;

pub type UpstreamWs = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Builds the frame-level pipeline spec §4.10 calls out: Parser through
/// RateLimiter, deliberately omitting MonthlyLimiter. `enable_rate_limit`
/// mirrors the route's `ws_proxy.enable_rate_limit` knob.
pub fn build_frame_pipeline(
    store: Arc<ConfigStore>,
    kv: Arc<dyn KvStore>,
    breakers: Arc<BreakerRegistry>,
    enable_rate_limit: bool,
) -> Pipeline {
    let mut stages: Vec<Box<dyn crate::pipeline::Stage>> = vec![
        Box::new(ParserStage),
        Box::new(GuardStage),
        Box::new(ConsumerVarsStage),
        Box::new(WhitelistStage { store: store.clone() }),
        Box::new(CuCalcStage { store }),
    ];
    if enable_rate_limit {
        stages.push(Box::new(RateLimiterStage {
            store: kv,
            breakers,
        }));
    }
    Pipeline::new(stages)
}

pub enum FrameDecision {
    Forward,
    Reject(crate::error::JsonRpcError),
}

/// Runs the frame pipeline against one inbound text frame, reusing the
/// handshake-phase consumer identity (spec §4.10 step 4).
pub async fn process_frame(
    pipeline: &Pipeline,
    route: &RouteConfig,
    consumer: &Option<ConsumerIdentity>,
    client_ip: Option<IpAddr>,
    frame_body: &[u8],
) -> FrameDecision {
    let mut route = route.clone();
    // The websocket variant of a route carries its own whitelist/pricing
    // documents and network override (spec §6 "Configuration files" applies
    // per-route; a route's ws_proxy block names its own pair rather than
    // sharing the HTTP ones). The override has to land on `route.parser`,
    // not just `ctx`, or ParserStage clobbers it straight back to the
    // host-derived network a moment later.
    if let Some(ws_cfg) = route.ws_proxy.clone() {
        route.whitelist.config_path = ws_cfg.whitelist_config_path;
        route.cu_calc.config_path = ws_cfg.cu_config_path;
        if ws_cfg.network.is_some() {
            route.parser.network = ws_cfg.network;
        }
    }

    let mut ctx = Context::new(route.clone());
    ctx.http_method = "POST".to_string();
    ctx.content_type = Some("application/json".to_string());
    ctx.upgrade_header = None;
    ctx.client_ip = client_ip;
    ctx.consumer = consumer.clone();
    ctx.body = frame_body.to_vec();

    match pipeline.run(&mut ctx).await {
        StageOutcome::Continue => FrameDecision::Forward,
        StageOutcome::Reject(err) => FrameDecision::Reject(err),
    }
}

fn tungstenite_to_axum(msg: TungsteniteMessage) -> Option<AxumMessage> {
    match msg {
        TungsteniteMessage::Text(t) => Some(AxumMessage::Text(t.as_str().to_string().into())),
        TungsteniteMessage::Binary(b) => Some(AxumMessage::Binary(b.to_vec().into())),
        TungsteniteMessage::Ping(p) => Some(AxumMessage::Ping(p.to_vec().into())),
        TungsteniteMessage::Pong(p) => Some(AxumMessage::Pong(p.to_vec().into())),
        TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => None,
    }
}

/// Runs the two-directional session (spec §4.10 steps 4-5). Either side's
/// close or read error ends both tasks; the second task is always awaited
/// before this returns (spec §4.10 step 5, §5 "Cancellation").
pub async fn run_session(
    client_ws: WebSocket,
    upstream_ws: UpstreamWs,
    pipeline: Arc<Pipeline>,
    route: RouteConfig,
    consumer: Option<ConsumerIdentity>,
    client_ip: Option<IpAddr>,
    ws_timeout: Duration,
) {
    let (client_tx, mut client_rx) = client_ws.split();
    let client_tx = tokio::sync::Mutex::new(client_tx);
    let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let mut stop_tx = Some(stop_tx);

    let upstream_to_client = async {
        loop {
            let next = tokio::time::timeout(ws_timeout, upstream_rx.next()).await;
            let msg = match next {
                Ok(Some(Ok(m))) => m,
                _ => break,
            };
            match &msg {
                TungsteniteMessage::Close(_) => {
                    let _ = client_tx.lock().await.send(AxumMessage::Close(None)).await;
                    break;
                }
                TungsteniteMessage::Ping(payload) => {
                    // Upstream pings are answered with a pong back to the
                    // client per the protocol, not echoed upstream (spec
                    // §4.10 step 4, upstream->client direction).
                    let _ = client_tx.lock().await.send(AxumMessage::Pong(payload.to_vec().into())).await;
                }
                _ => {
                    if let Some(out) = tungstenite_to_axum(msg) {
                        if client_tx.lock().await.send(out).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    };

    let client_to_upstream = async {
        loop {
            let msg = match client_rx.next().await {
                Some(Ok(m)) => m,
                _ => break,
            };
            match msg {
                AxumMessage::Text(text) => {
                    match process_frame(&pipeline, &route, &consumer, client_ip, text.as_bytes())
                        .await
                    {
                        FrameDecision::Forward => {
                            if upstream_tx
                                .send(TungsteniteMessage::Text(text.to_string().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        FrameDecision::Reject(err) => {
                            // Invariant (vi): never forward a rejected
                            // frame; answer the client directly instead.
                            let body = err.to_body().to_string();
                            if client_tx.lock().await.send(AxumMessage::Text(body.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                AxumMessage::Binary(bytes) => {
                    if upstream_tx
                        .send(TungsteniteMessage::Binary(bytes.to_vec().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                AxumMessage::Ping(payload) => {
                    if upstream_tx
                        .send(TungsteniteMessage::Ping(payload.to_vec().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                AxumMessage::Pong(_) => {}
                AxumMessage::Close(_) => {
                    let _ = upstream_tx.send(TungsteniteMessage::Close(None)).await;
                    break;
                }
            }
        }
    };

    tokio::pin!(upstream_to_client);
    tokio::pin!(client_to_upstream);

    tokio::select! {
        _ = &mut upstream_to_client => {
            if let Some(tx) = stop_tx.take() {
                let _ = tx.send(());
            }
        }
        _ = &mut client_to_upstream => {
            if let Some(tx) = stop_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    // Give the still-running direction a brief grace window to notice the
    // partner closed, then drop it: never leak the paired task (spec §5
    // "Cancellation").
    let _ = tokio::time::timeout(Duration::from_millis(500), &mut stop_rx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerRegistry;
    use crate::config::tests_support::sample_route;
    use crate::kv::fake::FakeKvStore;

    fn pipeline() -> Pipeline {
        build_frame_pipeline(
            Arc::new(ConfigStore::new()),
            Arc::new(FakeKvStore::new()),
            Arc::new(BreakerRegistry::new(5, Duration::from_secs(60))),
            true,
        )
    }

    #[tokio::test]
    async fn unsupported_method_is_rejected_not_forwarded() {
        let route = sample_route();
        let consumer = Some(ConsumerIdentity::new("acme", 100, 10000, 0, 1_000_000));
        let body = br#"{"method":"eth_mining","id":1}"#;
        let decision = process_frame(&pipeline(), &route, &consumer, None, body).await;
        match decision {
            FrameDecision::Reject(err) => assert_eq!(err.code, -32601),
            FrameDecision::Forward => panic!("expected rejection"),
        }
    }
}
