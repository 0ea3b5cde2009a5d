// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! CUCalc stage (spec §4.5): sums per-method compute-unit cost using exact
//! and wildcard pricing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config_store::ConfigStore;
use crate::context::{var_keys, Context};
use crate::error::StageOutcome;
use crate::pipeline::whitelist::Pattern;
use crate::pipeline::Stage;

pub const PRIORITY: i32 = 1012;

/// Safe default cost per method when no pricing config is available (spec
/// §4.5 "Nil config -> cost = 1 per method").
const NIL_CONFIG_DEFAULT_COST: i64 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct PricingDoc {
    pub default: i64,
    #[serde(default)]
    pub methods: HashMap<Pattern, i64>,
}

/// Runtime-resolved pricing: an exact-match map plus longest-prefix
/// wildcard matching (spec §3 "PricingConfig").
#[derive(Debug, Clone)]
pub struct PricingConfig {
    default: i64,
    exact: HashMap<String, i64>,
    wildcards: Vec<(String, i64)>,
}

impl Default for PricingConfig {
    /// The "default-only pricing" safe fallback (spec §4.9) for when
    /// ConfigStore has nothing to serve: every method costs the §4.5 "Nil
    /// config" default of 1 CU.
    fn default() -> Self {
        Self {
            default: NIL_CONFIG_DEFAULT_COST,
            exact: HashMap::new(),
            wildcards: Vec::new(),
        }
    }
}

impl PricingConfig {
    pub fn from_doc(doc: PricingDoc) -> Self {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();
        for (pattern, cost) in doc.methods {
            match pattern.0.strip_suffix('*') {
                Some(prefix) => wildcards.push((prefix.to_string(), cost)),
                None => {
                    exact.insert(pattern.0, cost);
                }
            }
        }
        // Longest prefix wins, so sort descending by prefix length once.
        wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            default: doc.default,
            exact,
            wildcards,
        }
    }

    /// `cost(m)` per spec §4.5: exact key wins; else the longest matching
    /// wildcard prefix; else `default`.
    pub fn cost(&self, method: &str) -> i64 {
        if let Some(cost) = self.exact.get(method) {
            return *cost;
        }
        for (prefix, cost) in &self.wildcards {
            if method.starts_with(prefix.as_str()) {
                return *cost;
            }
        }
        self.default
    }

    /// Batch cost: sum over methods, duplicates included (spec §4.5, §8
    /// "Batch CU additivity").
    pub fn batch_cost(&self, methods: &[String]) -> i64 {
        methods.iter().map(|m| self.cost(m)).sum()
    }
}

pub struct CuCalcStage {
    pub store: Arc<ConfigStore>,
}

#[async_trait]
impl Stage for CuCalcStage {
    fn name(&self) -> &'static str {
        "CUCalc"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn run(&self, ctx: &mut Context) -> StageOutcome {
        let methods: Vec<String> = ctx
            .parsed
            .as_ref()
            .map(|p| p.methods.clone())
            .unwrap_or_default();

        let cu = if methods.is_empty() {
            0
        } else {
            let cfg = &ctx.route.cu_calc;
            let pricing = self.store.pricing(&ctx.route.id, &cfg.config_path, cfg.config_ttl);
            pricing.batch_cost(&methods)
        };

        ctx.vars.set(var_keys::CU, cu.to_string());
        StageOutcome::Continue
    }
}
