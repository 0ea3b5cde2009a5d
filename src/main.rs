// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unifra_gateway::admin::{self, GatewayState, RouteBinding};
use unifra_gateway::circuit_breaker::BreakerRegistry;
use unifra_gateway::config::{self, GatewayConfig, RouteConfig};
use unifra_gateway::config_store::ConfigStore;
use unifra_gateway::kv::{KvStore, RedisKvStore};
use unifra_gateway::metrics;
use unifra_gateway::pipeline::consumer_vars::ConsumerVarsStage;
use unifra_gateway::pipeline::cu_calc::CuCalcStage;
use unifra_gateway::pipeline::guard::GuardStage;
use unifra_gateway::pipeline::monthly_limiter::MonthlyLimiterStage;
use unifra_gateway::pipeline::parser::ParserStage;
use unifra_gateway::pipeline::rate_limiter::RateLimiterStage;
use unifra_gateway::pipeline::whitelist::WhitelistStage;
use unifra_gateway::pipeline::Pipeline;
use unifra_gateway::upstream::{StaticUpstreamResolver, UpstreamResolver};
use unifra_gateway::ws_proxy;

// WARNING!!!
//
// Do not move or use similar logic to generate git revision information
// outside of a binary entry point (e.g. main.rs). Placing the below logic
// into a library can result in unnecessary rebuilds.
const GIT_REVISION: &str = {
    if let Some(revision) = option_env!("GIT_REVISION") {
        revision
    } else {
        git_version::git_version!(
            args = ["--always", "--abbrev=12", "--dirty", "--exclude", "*"],
            fallback = "DIRTY"
        )
    }
};

pub const VERSION: &str = const_str::concat!(env!("CARGO_PKG_VERSION"), "-", GIT_REVISION);

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version = VERSION)]
struct Args {
    #[arg(
        long,
        short,
        default_value = "./unifra-gateway.yaml",
        help = "Specify the gateway config file path to use"
    )]
    config: String,
}

async fn build_route(
    route: RouteConfig,
    config_store: Arc<ConfigStore>,
    breakers: Arc<BreakerRegistry>,
    resolver: Arc<dyn UpstreamResolver>,
) -> Result<RouteBinding> {
    let kv: Arc<dyn KvStore> = Arc::new(RedisKvStore::connect(&route.rate_limiter.redis).await?);

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
            store: kv.clone(),
            breakers: breakers.clone(),
        }),
        Box::new(MonthlyLimiterStage {
            store: kv.clone(),
            breakers: breakers.clone(),
        }),
    ]));

    let ws_pipeline = if let Some(ws_cfg) = &route.ws_proxy {
        Some(Arc::new(ws_proxy::build_frame_pipeline(
            config_store.clone(),
            kv.clone(),
            breakers.clone(),
            ws_cfg.enable_rate_limit,
        )))
    } else {
        None
    };

    Ok(RouteBinding {
        route,
        pipeline,
        ws_pipeline,
        kv,
        config_store,
        resolver,
        breakers,
        http_client: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config: GatewayConfig = config::load(&args.config)?;

    info!(listen = ?config.listen_address, metrics = ?config.metrics_address, routes = config.routes.len(), "starting gateway");

    let config_store = Arc::new(ConfigStore::new());
    let breakers = Arc::new(BreakerRegistry::new(5, Duration::from_secs(60)));
    let resolver: Arc<dyn UpstreamResolver> = Arc::new(StaticUpstreamResolver);

    let mut routes = Vec::with_capacity(config.routes.len());
    for route in config.routes {
        let id = route.id.clone();
        let binding = build_route(route, config_store.clone(), breakers.clone(), resolver.clone())
            .await
            .map_err(|e| anyhow::anyhow!("failed to initialize route {id}: {e}"))?;
        routes.push(binding);
    }

    let state = Arc::new(GatewayState { routes });
    let app = admin::app(state);

    let metrics_listener = std::net::TcpListener::bind(config.metrics_address)?;
    metrics::start_prometheus_server(metrics_listener);

    let listener = std::net::TcpListener::bind(config.listen_address)?;
    admin::server(listener, app).await?;

    Ok(())
}
