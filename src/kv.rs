// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The KV store interface consumed by RateLimiter and MonthlyLimiter (spec
//! §6 "Outbound to KV store"), wrapped per-backend by the circuit breaker
//! (spec §4.8).

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::circuit_breaker::{Breaker, CallError};
use crate::config::RedisConfig;

/// Result of the MonthlyLimiter's atomic check-and-charge script (spec
/// §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeResult {
    pub allowed: bool,
    pub used_after: i64,
    pub remaining: i64,
}

/// The minimal KV operations the pipeline needs: atomic increment with a
/// sliding window (RateLimiter) and an atomic scripted check-and-charge
/// (MonthlyLimiter), plus a read-only quota peek (spec §6 "a similar
/// read-only GET_QUOTA script").
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `INCRBY key by`, setting TTL to `ttl` only when the key was just
    /// created (i.e. the returned value equals `by`).
    async fn incrby_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> Result<i64>;

    /// The monthly-limiter script from spec §4.7.
    async fn charge_monthly(
        &self,
        key: &str,
        cu: i64,
        limit: i64,
        cycle_end_at: i64,
    ) -> Result<ChargeResult>;

    async fn get_quota(&self, key: &str) -> Result<i64>;

    async fn del(&self, key: &str) -> Result<()>;
}

/// Redis-backed implementation using a pooled multiplexed connection (spec
/// §5 "KV connections are pooled").
pub struct RedisKvStore {
    manager: redis::aio::ConnectionManager,
    timeout: Duration,
}

impl RedisKvStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.to_url())?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            timeout: config.connection_timeout(),
        })
    }
}

/// Lua script mirroring spec §4.7 verbatim: check-then-charge in one
/// server-side atomic round trip so two concurrent requests can never both
/// observe `current < limit` and both write (spec §9 "Atomicity of
/// charging").
static MONTHLY_CHARGE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1])) or 0
local cu = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local cycle_end_at = tonumber(ARGV[3])
if current + cu > limit then
  return {0, current, limit - current}
end
local new = redis.call('INCRBY', KEYS[1], cu)
if new == cu then
  redis.call('EXPIREAT', KEYS[1], cycle_end_at)
end
return {1, new, limit - new}
"#;

#[async_trait]
impl KvStore for RedisKvStore {
    async fn incrby_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.manager.clone();
        let fut = async move {
            let current: i64 = redis::cmd("INCRBY")
                .arg(key)
                .arg(by)
                .query_async(&mut conn)
                .await?;
            if current == by {
                redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl.as_secs() as i64)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            Ok::<_, redis::RedisError>(current)
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("redis incrby timed out"))?
            .map_err(|e| anyhow!("redis incrby failed: {e}"))
    }

    async fn charge_monthly(
        &self,
        key: &str,
        cu: i64,
        limit: i64,
        cycle_end_at: i64,
    ) -> Result<ChargeResult> {
        let mut conn = self.manager.clone();
        let script = redis::Script::new(MONTHLY_CHARGE_SCRIPT);
        let fut = async move {
            let (allowed, used_after, remaining): (i64, i64, i64) = script
                .key(key)
                .arg(cu)
                .arg(limit)
                .arg(cycle_end_at)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(ChargeResult {
                allowed: allowed == 1,
                used_after,
                remaining,
            })
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("redis monthly charge timed out"))?
            .map_err(|e| anyhow!("redis monthly charge failed: {e}"))
    }

    async fn get_quota(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        let fut = async move {
            let v: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(v.unwrap_or(0))
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("redis get timed out"))?
            .map_err(|e| anyhow!("redis get failed: {e}"))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let fut = async move {
            redis::cmd("DEL")
                .arg(key)
                .query_async::<()>(&mut conn)
                .await
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("redis del timed out"))?
            .map_err(|e| anyhow!("redis del failed: {e}"))
    }
}

/// Wraps any `KvStore` with the process-wide circuit breaker for its
/// `(host, port)` (spec §4.8). Every pipeline caller goes through this, not
/// the raw store, so breaker bookkeeping is never duplicated per call site.
/// Holds the inner store as a trait object so it can live behind a single
/// concrete field type inside pipeline stages regardless of backend.
pub struct GuardedKvStore {
    inner: std::sync::Arc<dyn KvStore>,
    breaker: std::sync::Arc<Breaker>,
}

impl GuardedKvStore {
    pub fn new(inner: std::sync::Arc<dyn KvStore>, breaker: std::sync::Arc<Breaker>) -> Self {
        Self { inner, breaker }
    }

    pub async fn incrby_with_ttl(
        &self,
        key: &str,
        by: i64,
        ttl: Duration,
    ) -> Result<i64, CallError<anyhow::Error>> {
        self.breaker.call(|| self.inner.incrby_with_ttl(key, by, ttl)).await
    }

    pub async fn charge_monthly(
        &self,
        key: &str,
        cu: i64,
        limit: i64,
        cycle_end_at: i64,
    ) -> Result<ChargeResult, CallError<anyhow::Error>> {
        self.breaker
            .call(|| self.inner.charge_monthly(key, cu, limit, cycle_end_at))
            .await
    }
}

#[cfg(any(test, feature = "test-kv"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory `KvStore` used by unit/integration tests so the suite
    /// never needs a live Redis (spec §5 testability; see SPEC_FULL.md
    /// "Test tooling").
    #[derive(Default)]
    pub struct FakeKvStore {
        values: Mutex<HashMap<String, i64>>,
        pub fail_next: std::sync::atomic::AtomicUsize,
    }

    impl FakeKvStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn preload(&self, key: &str, value: i64) {
            self.values.lock().unwrap().insert(key.to_string(), value);
        }

        pub fn get(&self, key: &str) -> i64 {
            *self.values.lock().unwrap().get(key).unwrap_or(&0)
        }

        fn maybe_fail(&self) -> Result<()> {
            let remaining = self.fail_next.load(std::sync::atomic::Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                return Err(anyhow!("simulated kv outage"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvStore for FakeKvStore {
        async fn incrby_with_ttl(&self, key: &str, by: i64, _ttl: Duration) -> Result<i64> {
            self.maybe_fail()?;
            let mut values = self.values.lock().unwrap();
            let entry = values.entry(key.to_string()).or_insert(0);
            *entry += by;
            Ok(*entry)
        }

        async fn charge_monthly(
            &self,
            key: &str,
            cu: i64,
            limit: i64,
            _cycle_end_at: i64,
        ) -> Result<ChargeResult> {
            self.maybe_fail()?;
            let mut values = self.values.lock().unwrap();
            let current = *values.get(key).unwrap_or(&0);
            if current + cu > limit {
                return Ok(ChargeResult {
                    allowed: false,
                    used_after: current,
                    remaining: limit - current,
                });
            }
            let new = current + cu;
            values.insert(key.to_string(), new);
            Ok(ChargeResult {
                allowed: true,
                used_after: new,
                remaining: limit - new,
            })
        }

        async fn get_quota(&self, key: &str) -> Result<i64> {
            self.maybe_fail()?;
            Ok(self.get(key))
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.maybe_fail()?;
            self.values.lock().unwrap().remove(key);
            Ok(())
        }
    }
}
