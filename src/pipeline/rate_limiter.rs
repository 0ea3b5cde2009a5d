// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! RateLimiter stage (spec §4.6): a bucketed per-second sliding-window
//! rate limiter backed by an atomic KV increment.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::circuit_breaker::{Breaker, BreakerRegistry, CallError};
use crate::context::Context;
use crate::error::{JsonRpcError, StageOutcome};
use crate::kv::{GuardedKvStore, KvStore};
use crate::pipeline::Stage;

pub const PRIORITY: i32 = 1010;

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `window_start = floor(now/W)*W` (spec §4.6 step 1).
pub fn window_start(now: u64, window: u64) -> u64 {
    let window = window.max(1);
    (now / window) * window
}

pub fn rate_window_key(identity: &str, window_start: u64) -> String {
    format!("ratelimit:cu:{identity}:{window_start}")
}

pub struct RateLimiterStage {
    pub store: Arc<dyn KvStore>,
    pub breakers: Arc<BreakerRegistry>,
}

impl RateLimiterStage {
    fn breaker(&self, ctx: &Context) -> Arc<Breaker> {
        self.breakers
            .get(ctx.route.rate_limiter.redis.backend_key())
    }
}

#[async_trait]
impl Stage for RateLimiterStage {
    fn name(&self) -> &'static str {
        "RateLimiter"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn run(&self, ctx: &mut Context) -> StageOutcome {
        let cfg = ctx.route.rate_limiter.clone();

        let limit = ctx
            .consumer
            .as_ref()
            .map(|c| c.seconds_quota)
            .unwrap_or(0);
        // A non-positive or absent limit disables the limiter (spec §4.6).
        if limit <= 0 {
            return StageOutcome::Continue;
        }

        let cu: i64 = ctx
            .vars
            .get_i64(crate::context::var_keys::CU)
            .unwrap_or(0);
        if cu == 0 {
            return StageOutcome::Continue;
        }

        let identity = ctx.rate_limit_identity();
        let now = now_epoch();
        let window_start = window_start(now, cfg.time_window);
        let key = rate_window_key(&identity, window_start);
        let ttl = Duration::from_secs(cfg.time_window.max(1) + 1);

        let guarded = GuardedKvStore::new(self.store.clone(), self.breaker(ctx));
        match guarded.incrby_with_ttl(&key, cu, ttl).await {
            Ok(current) => {
                let reset = (window_start + cfg.time_window.max(1)).saturating_sub(now);
                ctx.vars.set("rate_limit_limit", limit.to_string());
                ctx.vars.set("rate_limit_reset", reset.to_string());
                if current <= limit {
                    ctx.vars
                        .set("rate_limit_remaining", (limit - current).max(0).to_string());
                    StageOutcome::Continue
                } else {
                    ctx.vars.set("rate_limit_remaining", "0".to_string());
                    StageOutcome::Reject(rate_limit_error(limit, current, cfg.time_window, window_start, now))
                }
            }
            Err(CallError::Open) | Err(CallError::Failed(_)) => {
                // spec §9 unifies the breaker-blocked path and the direct
                // connection-error path under allow_degradation.
                if cfg.allow_degradation {
                    tracing::warn!(identity, "rate limiter kv unavailable, allowing (fail open)");
                    StageOutcome::Continue
                } else {
                    StageOutcome::Reject(JsonRpcError::quota_exceeded("rate limit exceeded"))
                }
            }
        }
    }
}

fn rate_limit_error(limit: i64, current: i64, window: u64, window_start: u64, now: u64) -> JsonRpcError {
    let remaining = (limit - current).max(0);
    let reset = (window_start + window.max(1)).saturating_sub(now);
    let mut err = JsonRpcError::quota_exceeded("rate limit exceeded");
    // headers would be attached by the HTTP layer; encode them in the
    // message-adjacent fields callers can read off this error.
    err.message = format!(
        "rate limit exceeded (limit={limit}, remaining={remaining}, reset={reset}s)"
    );
    err
}
