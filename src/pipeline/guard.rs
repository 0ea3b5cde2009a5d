// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Guard stage (spec §4.2): blocks by consumer name, method pattern, or
//! client IP before the request reaches tier-aware stages.

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{JsonRpcError, StageOutcome};
use crate::pipeline::whitelist::Pattern;
use crate::pipeline::Stage;

pub const PRIORITY: i32 = 25000;

pub struct GuardStage;

#[async_trait]
impl Stage for GuardStage {
    fn name(&self) -> &'static str {
        "Guard"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn run(&self, ctx: &mut Context) -> StageOutcome {
        let cfg = &ctx.route.guard;

        let consumer = ctx.consumer_name();
        if !consumer.is_empty() && cfg.blocked_consumers.iter().any(|c| c == consumer) {
            return reject();
        }

        if let Some(ip) = ctx.client_ip {
            let ip_str = ip.to_string();
            if cfg.blocked_ips.iter().any(|b| b == &ip_str) {
                return reject();
            }
        }

        if let Some(parsed) = &ctx.parsed {
            let blocked: Vec<Pattern> = cfg
                .blocked_methods
                .iter()
                .map(|p| Pattern(p.clone()))
                .collect();
            if parsed
                .methods
                .iter()
                .any(|m| blocked.iter().any(|p| p.matches(m)))
            {
                return reject();
            }
        }

        StageOutcome::Continue
    }
}

fn reject() -> StageOutcome {
    StageOutcome::Reject(JsonRpcError::forbidden("blocked by guard"))
}
