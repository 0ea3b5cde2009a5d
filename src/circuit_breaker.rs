// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide circuit breaker guarding calls to a KV backend, keyed by
//! `(host, port)` (spec §4.8).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: State::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }
}

/// A single backend's breaker. `failure_threshold` consecutive failures
/// trip CLOSED -> OPEN; OPEN persists for `open_timeout`; a HALF_OPEN probe
/// resets on success or re-opens on failure (spec §4.8, §8 "Breaker
/// hysteresis").
pub struct Breaker {
    failure_threshold: u32,
    open_timeout: Duration,
    state: RwLock<BreakerState>,
}

impl Breaker {
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            open_timeout,
            state: RwLock::new(BreakerState::default()),
        }
    }

    /// Returns `true` if a call is allowed through right now, transitioning
    /// OPEN -> HALF_OPEN when the timeout has elapsed.
    pub fn allow(&self) -> bool {
        let mut s = self.state.write().unwrap();
        match s.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_timeout {
                    s.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut s = self.state.write().unwrap();
        s.state = State::Closed;
        s.failure_count = 0;
        s.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut s = self.state.write().unwrap();
        match s.state {
            State::HalfOpen => {
                s.state = State::Open;
                s.opened_at = Some(Instant::now());
            }
            State::Closed => {
                s.failure_count += 1;
                if s.failure_count >= self.failure_threshold {
                    s.state = State::Open;
                    s.opened_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }

    pub fn state(&self) -> State {
        self.state.read().unwrap().state
    }

    /// Runs `f` through the breaker. `Err(BreakerOpen)` means the call was
    /// rejected without ever reaching the backend.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(CallError::Open);
        }
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(CallError::Failed(e))
            }
        }
    }
}

#[derive(Debug)]
pub enum CallError<E> {
    Open,
    Failed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Open => write!(f, "circuit open"),
            CallError::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Process-wide registry of breakers, one per `(host, port)` backend (spec
/// §4.8 "State is process-wide"). Safe for concurrent access: lookups take
/// a read lock; only first-touch inserts take a write lock.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<(String, u16), Arc<Breaker>>>,
    failure_threshold: u32,
    open_timeout: Duration,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            open_timeout,
        }
    }

    pub fn get(&self, backend: (String, u16)) -> Arc<Breaker> {
        if let Some(b) = self.breakers.read().unwrap().get(&backend) {
            return b.clone();
        }
        let mut w = self.breakers.write().unwrap();
        w.entry(backend)
            .or_insert_with(|| Arc::new(Breaker::new(self.failure_threshold, self.open_timeout)))
            .clone()
    }
}

/// Default registry shared by the whole process, parameterized with the
/// spec's default `failure_threshold=5`, `open_timeout=60s` (spec §4.8).
pub static DEFAULT_REGISTRY: Lazy<BreakerRegistry> =
    Lazy::new(|| BreakerRegistry::new(5, Duration::from_secs(60)));
