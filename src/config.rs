// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gateway-level configuration: listen addresses and per-route stage knobs
//! (spec §6 "Route-stage configuration knobs").

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_time_window() -> u64 {
    1
}

fn default_config_ttl() -> u64 {
    60
}

fn default_paid_quota_threshold() -> i64 {
    1_000_000
}

fn default_ws_timeout() -> u64 {
    60
}

fn default_redis_timeout_ms() -> u64 {
    1000
}

fn default_rejected_code() -> u16 {
    429
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: i64,
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisConfig {
    pub fn backend_key(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn to_url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{pw}@{}:{}/{}", self.host, self.port, self.database),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Overrides network extraction from the Host header (spec §4.1).
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub blocked_consumers: Vec<String>,
    #[serde(default)]
    pub blocked_methods: Vec<String>,
    #[serde(default)]
    pub blocked_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistStageConfig {
    pub config_path: PathBuf,
    #[serde(default = "default_config_ttl")]
    pub config_ttl: u64,
    #[serde(default = "default_paid_quota_threshold")]
    pub paid_quota_threshold: i64,
    #[serde(default)]
    pub bypass_networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuCalcStageConfig {
    pub config_path: PathBuf,
    #[serde(default = "default_config_ttl")]
    pub config_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStageConfig {
    pub redis: RedisConfig,
    #[serde(default = "default_limit_var")]
    pub limit_var: String,
    #[serde(default = "default_time_window")]
    pub time_window: u64,
    #[serde(default = "default_true")]
    pub allow_degradation: bool,
}

fn default_limit_var() -> String {
    "seconds_quota".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyLimiterStageConfig {
    pub redis: RedisConfig,
    #[serde(default = "default_quota_var")]
    pub quota_var: String,
    #[serde(default = "default_used_var")]
    pub used_var: String,
    #[serde(default = "default_rejected_code")]
    pub rejected_code: u16,
    #[serde(default = "default_rejected_msg")]
    pub rejected_msg: String,
    /// When set, `cycle_id`/`cycle_end_at` MUST come from consumer config
    /// (spec §4.7); otherwise they are derived from the UTC calendar.
    #[serde(default)]
    pub control_plane_cycles: bool,
}

fn default_quota_var() -> String {
    "monthly_quota".to_string()
}

fn default_used_var() -> String {
    "monthly_used".to_string()
}

fn default_rejected_msg() -> String {
    "monthly quota exceeded".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsProxyStageConfig {
    pub whitelist_config_path: PathBuf,
    pub cu_config_path: PathBuf,
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
    #[serde(default = "default_ws_timeout")]
    pub ws_timeout: u64,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default = "default_paid_quota_threshold")]
    pub paid_quota_threshold: i64,
    #[serde(default)]
    pub bypass_networks: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub verify_upstream_tls: bool,
}

/// Per-route stage configuration (spec §6). A route is matched by an
/// upstream path/host prefix resolved by the external routing collaborator
/// (out of scope, spec §1); here it is identified by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub upstream: String,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    pub whitelist: WhitelistStageConfig,
    pub cu_calc: CuCalcStageConfig,
    pub rate_limiter: RateLimiterStageConfig,
    pub monthly_limiter: MonthlyLimiterStageConfig,
    #[serde(default)]
    pub ws_proxy: Option<WsProxyStageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen_address: SocketAddr,
    pub metrics_address: SocketAddr,
    pub routes: Vec<RouteConfig>,
}

#[cfg(any(test, feature = "test-kv"))]
pub mod tests_support {
    use super::*;

    pub fn sample_route() -> RouteConfig {
        RouteConfig {
            id: "eth-mainnet".to_string(),
            upstream: "http://127.0.0.1:9000".to_string(),
            parser: ParserConfig::default(),
            guard: GuardConfig::default(),
            whitelist: WhitelistStageConfig {
                config_path: PathBuf::from("whitelist.json"),
                config_ttl: 60,
                paid_quota_threshold: 1_000_000,
                bypass_networks: vec![],
            },
            cu_calc: CuCalcStageConfig {
                config_path: PathBuf::from("pricing.json"),
                config_ttl: 60,
            },
            rate_limiter: RateLimiterStageConfig {
                redis: RedisConfig {
                    host: "127.0.0.1".to_string(),
                    port: 6379,
                    password: None,
                    database: 0,
                    timeout_ms: 1000,
                },
                limit_var: "seconds_quota".to_string(),
                time_window: 1,
                allow_degradation: true,
            },
            monthly_limiter: MonthlyLimiterStageConfig {
                redis: RedisConfig {
                    host: "127.0.0.1".to_string(),
                    port: 6379,
                    password: None,
                    database: 0,
                    timeout_ms: 1000,
                },
                quota_var: "monthly_quota".to_string(),
                used_var: "monthly_used".to_string(),
                rejected_code: 429,
                rejected_msg: "monthly quota exceeded".to_string(),
                control_plane_cycles: false,
            },
            ws_proxy: None,
        }
    }
}

/// Loads the top-level gateway configuration file, YAML first, falling
/// back to JSON if the path ends in `.json` (mirrors `iota-proxy`'s
/// `config::load`, which this module is named after).
pub fn load<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("unable to read gateway config at {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&raw)
            .with_context(|| format!("unable to parse {} as JSON", path.display()))
    } else {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("unable to parse {} as YAML", path.display()))
    }
}
