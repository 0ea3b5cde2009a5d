// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ConsumerVars stage (spec §4.3): copies a consumer's static string map
//! into `Context.vars`, filtering metadata keys. Idempotent, never fails.

use async_trait::async_trait;

use crate::context::{var_keys, Context};
use crate::error::StageOutcome;
use crate::pipeline::Stage;

pub const PRIORITY: i32 = 24000;

pub struct ConsumerVarsStage;

#[async_trait]
impl Stage for ConsumerVarsStage {
    fn name(&self) -> &'static str {
        "ConsumerVars"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn run(&self, ctx: &mut Context) -> StageOutcome {
        let Some(consumer) = ctx.consumer.clone() else {
            return StageOutcome::Continue;
        };

        ctx.vars.set(var_keys::CONSUMER_NAME, consumer.name.clone());
        ctx.vars.set(var_keys::SECONDS_QUOTA, consumer.seconds_quota.to_string());
        ctx.vars.set(var_keys::MONTHLY_QUOTA, consumer.monthly_quota.to_string());
        ctx.vars
            .set(var_keys::MONTHLY_USED, consumer.monthly_used_hint.to_string());

        for (key, value) in &consumer.vars {
            ctx.vars.set(key.clone(), value.clone());
        }

        StageOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::sample_route;
    use crate::context::ConsumerIdentity;

    #[tokio::test]
    async fn copies_quota_vars_and_is_idempotent() {
        let mut ctx = Context::new(sample_route());
        ctx.consumer = Some(ConsumerIdentity::new("acme", 100, 10000, 0, 1_000_000));

        ConsumerVarsStage.run(&mut ctx).await;
        ConsumerVarsStage.run(&mut ctx).await;

        assert_eq!(ctx.vars.get(var_keys::SECONDS_QUOTA), Some("100"));
        assert_eq!(ctx.vars.get(var_keys::MONTHLY_QUOTA), Some("10000"));
        assert_eq!(ctx.vars.get(var_keys::CONSUMER_NAME), Some("acme"));
    }

    #[tokio::test]
    async fn no_consumer_is_a_no_op() {
        let mut ctx = Context::new(sample_route());
        assert_eq!(ConsumerVarsStage.run(&mut ctx).await, StageOutcome::Continue);
        assert_eq!(ctx.vars.get(var_keys::CONSUMER_NAME), None);
    }
}
