// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Whitelist stage (spec §4.4): resolves each parsed method against a
//! per-network free/paid method set with wildcard patterns and tier
//! gating.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config_store::ConfigStore;
use crate::context::{Context, Tier};
use crate::error::{JsonRpcError, StageOutcome};
use crate::pipeline::Stage;

pub const PRIORITY: i32 = 1900;

/// A method pattern: an exact name, or a string ending in `*` denoting a
/// prefix match (spec §3 "Pattern"). No other glob syntax is recognized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(pub String);

impl Pattern {
    /// `match(m,p)`: exact equality if `p` does not end in `*`; else `m`
    /// starts with `p` minus its trailing `*` (spec §8 "Pattern matching").
    pub fn matches(&self, method: &str) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => method.starts_with(prefix),
            None => self.0 == method,
        }
    }

    fn is_wildcard(&self) -> bool {
        self.0.ends_with('*')
    }
}

/// A precomputed exact-match set plus a list of prefix-wildcard patterns
/// (spec §3 "WhitelistConfig").
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    exact: HashSet<String>,
    wildcards: Vec<Pattern>,
}

impl PatternSet {
    pub fn from_patterns(patterns: Vec<Pattern>) -> Self {
        let mut exact = HashSet::new();
        let mut wildcards = Vec::new();
        for p in patterns {
            if p.is_wildcard() {
                wildcards.push(p);
            } else {
                exact.insert(p.0);
            }
        }
        Self { exact, wildcards }
    }

    pub fn matches(&self, method: &str) -> bool {
        self.exact.contains(method) || self.wildcards.iter().any(|p| p.matches(method))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkMethodSets {
    #[serde(default)]
    pub free: Vec<Pattern>,
    #[serde(default)]
    pub paid: Vec<Pattern>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistDoc {
    pub networks: HashMap<String, NetworkMethodSets>,
}

impl Default for WhitelistDoc {
    fn default() -> Self {
        Self {
            networks: HashMap::new(),
        }
    }
}

/// Runtime-resolved whitelist: per-network free/paid `PatternSet`s (spec
/// §3).
#[derive(Debug, Clone, Default)]
pub struct WhitelistConfig {
    networks: HashMap<String, (PatternSet, PatternSet)>,
}

impl WhitelistConfig {
    pub fn from_doc(doc: WhitelistDoc) -> Self {
        let networks = doc
            .networks
            .into_iter()
            .map(|(network, sets)| {
                (
                    network,
                    (
                        PatternSet::from_patterns(sets.free),
                        PatternSet::from_patterns(sets.paid),
                    ),
                )
            })
            .collect();
        Self { networks }
    }

    pub fn has_network(&self, network: &str) -> bool {
        self.networks.contains_key(network)
    }

    /// Evaluates one method against `network`'s whitelist for `tier`
    /// (spec §4.4 steps 3-4). `Ok(())` means allowed.
    pub fn check(&self, network: &str, method: &str, tier: Tier) -> Result<(), JsonRpcError> {
        let (free, paid) = match self.networks.get(network) {
            Some(sets) => sets,
            None => return Err(JsonRpcError::method_not_found("unsupported network")),
        };
        if free.matches(method) {
            return Ok(());
        }
        if paid.matches(method) {
            return if tier == Tier::Paid {
                Ok(())
            } else {
                Err(JsonRpcError::forbidden(format!(
                    "method {method} requires paid tier"
                )))
            };
        }
        Err(JsonRpcError::method_not_found(format!(
            "unsupported method: {method}"
        )))
    }
}

pub struct WhitelistStage {
    pub store: Arc<ConfigStore>,
}

#[async_trait]
impl Stage for WhitelistStage {
    fn name(&self) -> &'static str {
        "Whitelist"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn run(&self, ctx: &mut Context) -> StageOutcome {
        let network = ctx.network.clone().unwrap_or_default();
        let cfg = &ctx.route.whitelist;

        // Bypass networks use substring match (spec §4.4 step 1).
        if cfg.bypass_networks.iter().any(|b| network.contains(b.as_str())) {
            return StageOutcome::Continue;
        }

        let tier = ctx
            .consumer
            .as_ref()
            .map(|c| c.tier)
            .unwrap_or(Tier::Free);

        let whitelist = self.store.whitelist(&ctx.route.id, &cfg.config_path, cfg.config_ttl);

        let methods: Vec<String> = ctx
            .parsed
            .as_ref()
            .map(|p| p.methods.clone())
            .unwrap_or_default();

        // First offender determines the error reported for the batch
        // (spec §4.4 step 5).
        for method in &methods {
            if let Err(err) = whitelist.check(&network, method, tier) {
                return StageOutcome::Reject(err);
            }
        }
        StageOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> WhitelistDoc {
        let mut networks = HashMap::new();
        networks.insert(
            "eth-mainnet".to_string(),
            NetworkMethodSets {
                free: vec![Pattern("eth_blockNumber".to_string()), Pattern("eth_*".to_string())],
                paid: vec![Pattern("debug_*".to_string())],
            },
        );
        WhitelistDoc { networks }
    }

    #[test]
    fn exact_and_wildcard_matching() {
        let p = Pattern("debug_*".to_string());
        assert!(p.matches("debug_traceTransaction"));
        assert!(!p.matches("eth_call"));
        let exact = Pattern("eth_blockNumber".to_string());
        assert!(exact.matches("eth_blockNumber"));
        assert!(!exact.matches("eth_blockNumberX"));
    }

    #[test]
    fn free_method_allowed_for_any_tier() {
        let wl = WhitelistConfig::from_doc(doc());
        assert!(wl.check("eth-mainnet", "eth_blockNumber", Tier::Free).is_ok());
        assert!(wl.check("eth-mainnet", "eth_call", Tier::Free).is_ok());
    }

    #[test]
    fn paid_method_rejected_for_free_tier() {
        let wl = WhitelistConfig::from_doc(doc());
        let err = wl
            .check("eth-mainnet", "debug_traceTransaction", Tier::Free)
            .unwrap_err();
        assert_eq!(err.code, -32603);
        assert_eq!(err.http_status, 403);
        assert_eq!(err.message, "method debug_traceTransaction requires paid tier");
    }

    #[test]
    fn paid_method_allowed_for_paid_tier() {
        let wl = WhitelistConfig::from_doc(doc());
        assert!(wl
            .check("eth-mainnet", "debug_traceTransaction", Tier::Paid)
            .is_ok());
    }

    #[test]
    fn unsupported_network_rejected() {
        let wl = WhitelistConfig::from_doc(doc());
        let err = wl.check("btc-mainnet", "eth_call", Tier::Free).unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "unsupported network");
    }

    #[test]
    fn unsupported_method_rejected() {
        let wl = WhitelistConfig::from_doc(doc());
        let err = wl.check("eth-mainnet", "foo_bar", Tier::Paid).unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "unsupported method: foo_bar");
    }
}
