// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! MonthlyLimiter stage (spec §4.7): atomically charges CU against a
//! monthly quota keyed by billing cycle. Fails closed: any backend
//! uncertainty is treated as a rejection, never an oversell (spec §8 "No
//! oversell").

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::circuit_breaker::{Breaker, BreakerRegistry, CallError};
use crate::context::Context;
use crate::error::{JsonRpcError, StageOutcome};
use crate::kv::{GuardedKvStore, KvStore};
use crate::pipeline::Stage;

pub const PRIORITY: i32 = 1011;

pub fn billing_cycle_key(consumer: &str, cycle_id: &str) -> String {
    format!("quota:monthly:{consumer}:{cycle_id}")
}

/// Derives `(cycle_id, cycle_end_at)` from the UTC calendar: `cycle_id` is
/// `YYYYMM`, `cycle_end_at` is the epoch second one before the first
/// instant of next UTC month (spec §4.7, §9 "Timezone of cycle
/// derivation", timezone-correct regardless of process local TZ since
/// this operates entirely in `Utc`).
pub fn derive_utc_cycle(now: DateTime<Utc>) -> (String, i64) {
    let cycle_id = format!("{:04}{:02}", now.year(), now.month());
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let next_month_start = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).unwrap();
    let cycle_end_at = next_month_start.timestamp() - 1;
    (cycle_id, cycle_end_at)
}

pub struct MonthlyLimiterStage {
    pub store: Arc<dyn KvStore>,
    pub breakers: Arc<BreakerRegistry>,
}

impl MonthlyLimiterStage {
    fn breaker(&self, ctx: &Context) -> Arc<Breaker> {
        self.breakers
            .get(ctx.route.monthly_limiter.redis.backend_key())
    }
}

#[async_trait]
impl Stage for MonthlyLimiterStage {
    fn name(&self) -> &'static str {
        "MonthlyLimiter"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn run(&self, ctx: &mut Context) -> StageOutcome {
        let cfg = ctx.route.monthly_limiter.clone();
        let Some(consumer) = ctx.consumer.clone() else {
            return StageOutcome::Continue;
        };
        if consumer.monthly_quota <= 0 {
            return StageOutcome::Continue;
        }

        let cu: i64 = ctx
            .vars
            .get_i64(crate::context::var_keys::CU)
            .unwrap_or(0);
        if cu == 0 {
            return StageOutcome::Continue;
        }

        let (cycle_id, cycle_end_at) = if cfg.control_plane_cycles {
            match (&consumer.cycle_id, consumer.cycle_end_at) {
                (Some(id), Some(end)) => (id.clone(), end),
                _ => {
                    return StageOutcome::Reject(JsonRpcError::quota_exceeded(
                        "monthly quota exceeded: missing control-plane billing cycle",
                    ));
                }
            }
        } else {
            derive_utc_cycle(Utc::now())
        };

        let key = billing_cycle_key(&consumer.name, &cycle_id);
        let guarded = GuardedKvStore::new(self.store.clone(), self.breaker(ctx));

        match guarded
            .charge_monthly(&key, cu, consumer.monthly_quota, cycle_end_at)
            .await
        {
            Ok(result) if result.allowed => {
                ctx.vars.set("monthly_used_after", result.used_after.to_string());
                ctx.vars.set("monthly_remaining", result.remaining.to_string());
                StageOutcome::Continue
            }
            Ok(_) => StageOutcome::Reject(JsonRpcError::new(
                -32005,
                cfg.rejected_msg.clone(),
                cfg.rejected_code,
            )),
            Err(CallError::Open) | Err(CallError::Failed(_)) => {
                // MonthlyLimiter always fails closed (spec §4.7).
                StageOutcome::Reject(JsonRpcError::new(
                    -32005,
                    cfg.rejected_msg.clone(),
                    cfg.rejected_code,
                ))
            }
        }
    }
}
