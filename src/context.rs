// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-request `Context` the pipeline stages read from and write to
//! (spec §3, §9 "Ambient request state").

use std::collections::HashMap;
use std::net::IpAddr;

use serde_json::Value;

use crate::config::RouteConfig;

/// Tier is `paid` iff `monthly_quota` exceeds the route's
/// `paid_quota_threshold` (spec §3, default 1,000,000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Paid,
}

impl Tier {
    pub fn from_monthly_quota(monthly_quota: i64, paid_quota_threshold: i64) -> Self {
        if monthly_quota > paid_quota_threshold {
            Tier::Paid
        } else {
            Tier::Free
        }
    }
}

/// `ConsumerIdentity` as placed into the Context by the authentication
/// collaborator before the Parser stage runs (spec §3, §6).
#[derive(Debug, Clone)]
pub struct ConsumerIdentity {
    pub name: String,
    pub seconds_quota: i64,
    pub monthly_quota: i64,
    pub monthly_used_hint: i64,
    pub tier: Tier,
    /// Static string map injected by ConsumerVars (spec §4.3), metadata
    /// keys already filtered out.
    pub vars: HashMap<String, String>,
    /// Opaque billing-cycle id, present only when the control-plane
    /// integration supplies one (spec §4.7).
    pub cycle_id: Option<String>,
    pub cycle_end_at: Option<i64>,
}

impl ConsumerIdentity {
    pub fn new(
        name: impl Into<String>,
        seconds_quota: i64,
        monthly_quota: i64,
        monthly_used_hint: i64,
        paid_quota_threshold: i64,
    ) -> Self {
        Self {
            name: name.into(),
            seconds_quota,
            monthly_quota,
            monthly_used_hint,
            tier: Tier::from_monthly_quota(monthly_quota, paid_quota_threshold),
            vars: HashMap::new(),
            cycle_id: None,
            cycle_end_at: None,
        }
    }
}

/// A single JSON-RPC request id: integer, string, or absent (notification).
/// `Raw` holds any JSON number that doesn't fit an `i64` (a float, or an
/// integer outside its range) so it still round-trips back to the caller
/// unchanged instead of collapsing to `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcId {
    Number(i64),
    Raw(serde_json::Number),
    String(String),
    Null,
}

impl RpcId {
    pub fn to_json(&self) -> Value {
        match self {
            RpcId::Number(n) => Value::from(*n),
            RpcId::Raw(n) => Value::Number(n.clone()),
            RpcId::String(s) => Value::String(s.clone()),
            RpcId::Null => Value::Null,
        }
    }
}

/// Result of parsing the request body as JSON-RPC (spec §3).
#[derive(Debug, Clone)]
pub struct ParsedRpc {
    pub is_batch: bool,
    pub methods: Vec<String>,
    pub ids: Vec<RpcId>,
}

impl ParsedRpc {
    pub fn count(&self) -> usize {
        self.methods.len()
    }

    /// `methods[0]` when not a batch, else the literal `"batch"` (spec §3).
    pub fn primary_method(&self) -> &str {
        if self.is_batch {
            "batch"
        } else {
            self.methods.first().map(String::as_str).unwrap_or("")
        }
    }

    pub fn first_id(&self) -> Option<Value> {
        self.ids.first().map(RpcId::to_json)
    }
}

/// Leftmost dot-separated label of a Host header, lowercased, with any port
/// stripped (spec §4.1).
pub fn network_from_host(host: &str) -> String {
    let without_port = host.split(':').next().unwrap_or(host);
    without_port
        .split('.')
        .next()
        .unwrap_or(without_port)
        .to_ascii_lowercase()
}

/// Well-known Context var keys (spec §9 "Ambient request state").
pub mod var_keys {
    pub const JSONRPC_METHOD: &str = "jsonrpc_method";
    pub const JSONRPC_METHODS: &str = "jsonrpc_methods";
    pub const JSONRPC_IS_BATCH: &str = "jsonrpc_is_batch";
    pub const JSONRPC_COUNT: &str = "jsonrpc_count";
    pub const CU: &str = "cu";
    pub const SECONDS_QUOTA: &str = "seconds_quota";
    pub const MONTHLY_QUOTA: &str = "monthly_quota";
    pub const MONTHLY_USED: &str = "monthly_used";
    pub const UNIFRA_NETWORK: &str = "unifra_network";
    pub const CONSUMER_NAME: &str = "consumer_name";
}

/// A string-typed scratch map any stage may read or write (spec §9 keeps
/// this as "the documented API" even though well-known keys are typed
/// elsewhere on `Context`).
#[derive(Debug, Clone, Default)]
pub struct Vars(HashMap<String, String>);

impl Vars {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

/// Per-request mutable record (spec §3). Owned by exactly one request
/// (spec §5 "Per-request isolation").
pub struct Context {
    pub body: Vec<u8>,
    pub http_method: String,
    pub upgrade_header: Option<String>,
    pub host_header: Option<String>,
    pub content_type: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub vars: Vars,
    pub parsed: Option<ParsedRpc>,
    pub network: Option<String>,
    pub consumer: Option<ConsumerIdentity>,
    pub route: RouteConfig,
}

impl Context {
    pub fn new(route: RouteConfig) -> Self {
        Self {
            body: Vec::new(),
            http_method: "POST".to_string(),
            upgrade_header: None,
            host_header: None,
            content_type: None,
            client_ip: None,
            vars: Vars::default(),
            parsed: None,
            network: None,
            consumer: None,
            route,
        }
    }

    pub fn consumer_name(&self) -> &str {
        self.consumer
            .as_ref()
            .map(|c| c.name.as_str())
            .unwrap_or("")
    }

    /// Identity key used by the rate limiter (spec §4.6): the consumer
    /// name, falling back to the client IP when there is no consumer.
    pub fn rate_limit_identity(&self) -> String {
        match &self.consumer {
            Some(c) if !c.name.is_empty() => c.name.clone(),
            _ => self
                .client_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_from_host_strips_port_and_lowercases() {
        assert_eq!(network_from_host("ETH-Mainnet.example:8080"), "eth-mainnet");
        assert_eq!(network_from_host("eth-mainnet.example"), "eth-mainnet");
    }

    #[test]
    fn network_from_bare_host_returns_whole_label() {
        // spec §9 open question: bare hostnames return the whole label.
        assert_eq!(network_from_host("localhost"), "localhost");
        assert_eq!(network_from_host("localhost:8080"), "localhost");
    }

    #[test]
    fn tier_is_paid_only_above_threshold() {
        assert_eq!(Tier::from_monthly_quota(1_000_000, 1_000_000), Tier::Free);
        assert_eq!(Tier::from_monthly_quota(1_000_001, 1_000_000), Tier::Paid);
    }
}
