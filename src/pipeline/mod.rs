// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The ordered stage pipeline (spec §2, §9 "Chain of stages vs.
//! inheritance"). Each stage is a tagged value implementing `Stage`
//! rather than a node in a class hierarchy, so ordering is an explicit
//! property of the `Pipeline` rather than implicit in inheritance.

pub mod consumer_vars;
pub mod cu_calc;
pub mod guard;
pub mod monthly_limiter;
pub mod parser;
pub mod rate_limiter;
pub mod whitelist;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::StageOutcome;

/// A pipeline stage. `priority` fixes its position: higher runs first
/// (spec §2).
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    async fn run(&self, ctx: &mut Context) -> StageOutcome;
}

/// An ordered, immutable set of stages bound at route-bind time (spec §9).
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(mut stages: Vec<Box<dyn Stage>>) -> Self {
        stages.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { stages }
    }

    /// Runs stages strictly by priority, higher first (spec §5
    /// "Ordering"), short-circuiting on the first `Reject`.
    pub async fn run(&self, ctx: &mut Context) -> StageOutcome {
        for stage in &self.stages {
            let started = std::time::Instant::now();
            let outcome = stage.run(ctx).await;
            if let StageOutcome::Reject(err) = &outcome {
                tracing::warn!(
                    stage = stage.name(),
                    consumer = ctx.consumer_name(),
                    network = ctx.network.as_deref().unwrap_or(""),
                    method = ctx.vars.get(crate::context::var_keys::JSONRPC_METHOD).unwrap_or(""),
                    reason = %err.message,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "stage rejected request"
                );
                return StageOutcome::Reject(err.clone());
            }
        }
        StageOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagged(&'static str, i32, std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Stage for Tagged {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
        async fn run(&self, _ctx: &mut Context) -> StageOutcome {
            self.2.lock().unwrap().push(self.0);
            StageOutcome::Continue
        }
    }

    #[tokio::test]
    async fn stages_run_in_priority_order_highest_first() {
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Box::new(Tagged("low", 10, order.clone())),
            Box::new(Tagged("high", 1000, order.clone())),
            Box::new(Tagged("mid", 500, order.clone())),
        ]);
        let route = crate::config::tests_support::sample_route();
        let mut ctx = Context::new(route);
        pipeline.run(&mut ctx).await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }
}
