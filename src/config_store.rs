// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ConfigStore (spec §4.9): loads whitelist and pricing documents from
//! disk, caching per `(route_id, config_type, path)` so one route's TTL
//! can never flush another's cache (spec §9 "per_route_config_cache" bug
//! this avoids).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::pipeline::cu_calc::{PricingConfig, PricingDoc};
use crate::pipeline::whitelist::{WhitelistConfig, WhitelistDoc};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum ConfigKind {
    Whitelist,
    Pricing,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
struct CacheKey {
    route_id: String,
    kind: ConfigKind,
    path: PathBuf,
}

struct WhitelistEntry {
    value: Arc<WhitelistConfig>,
    loaded_at: Instant,
}

struct PricingEntry {
    value: Arc<PricingConfig>,
    loaded_at: Instant,
}

/// Process-wide, per-route-keyed config cache (spec §4.9, §9 "Module-level
/// mutable caches"). A writer lock guards refreshes; readers may observe
/// the last-good value while a refresh is in flight (spec §5).
#[derive(Default)]
pub struct ConfigStore {
    whitelists: RwLock<HashMap<CacheKey, WhitelistEntry>>,
    pricings: RwLock<HashMap<CacheKey, PricingEntry>>,
}

fn is_fresh(loaded_at: Instant, ttl: Duration) -> bool {
    ttl.is_zero() || loaded_at.elapsed() < ttl
}

/// JSON preferred when a `.json` sibling of `path` exists; otherwise YAML
/// (spec §6 "Configuration files").
fn load_doc<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let json_sibling = path.with_extension("json");
    if path.extension().and_then(|e| e.to_str()) == Some("json") || json_sibling.exists() {
        let raw = fs::read_to_string(if path.exists() { path } else { &json_sibling })?;
        Ok(serde_json::from_str(&raw)?)
    } else {
        let raw = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the whitelist for `route_id`/`path`, reloading when the
    /// cache entry is stale. On load failure, falls back to the last-good
    /// value, then to an empty whitelist (spec §4.9).
    pub fn whitelist(&self, route_id: &str, path: &Path, ttl_secs: u64) -> Arc<WhitelistConfig> {
        let key = CacheKey {
            route_id: route_id.to_string(),
            kind: ConfigKind::Whitelist,
            path: path.to_path_buf(),
        };
        let ttl = Duration::from_secs(ttl_secs);

        if let Some(entry) = self.whitelists.read().get(&key) {
            if is_fresh(entry.loaded_at, ttl) {
                return entry.value.clone();
            }
        }

        let mut cache = self.whitelists.write();
        if let Some(entry) = cache.get(&key) {
            if is_fresh(entry.loaded_at, ttl) {
                return entry.value.clone();
            }
        }

        match load_doc::<WhitelistDoc>(path) {
            Ok(doc) => {
                let value = Arc::new(WhitelistConfig::from_doc(doc));
                cache.insert(
                    key,
                    WhitelistEntry {
                        value: value.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                value
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load whitelist config");
                if let Some(entry) = cache.get(&key) {
                    entry.value.clone()
                } else {
                    Arc::new(WhitelistConfig::default())
                }
            }
        }
    }

    /// Returns the pricing config for `route_id`/`path`, same caching and
    /// degradation rules as `whitelist` (spec §4.9).
    pub fn pricing(&self, route_id: &str, path: &Path, ttl_secs: u64) -> Arc<PricingConfig> {
        let key = CacheKey {
            route_id: route_id.to_string(),
            kind: ConfigKind::Pricing,
            path: path.to_path_buf(),
        };
        let ttl = Duration::from_secs(ttl_secs);

        if let Some(entry) = self.pricings.read().get(&key) {
            if is_fresh(entry.loaded_at, ttl) {
                return entry.value.clone();
            }
        }

        let mut cache = self.pricings.write();
        if let Some(entry) = cache.get(&key) {
            if is_fresh(entry.loaded_at, ttl) {
                return entry.value.clone();
            }
        }

        match load_doc::<PricingDoc>(path) {
            Ok(doc) => {
                let value = Arc::new(PricingConfig::from_doc(doc));
                cache.insert(
                    key,
                    PricingEntry {
                        value: value.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                value
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load pricing config");
                if let Some(entry) = cache.get(&key) {
                    entry.value.clone()
                } else {
                    Arc::new(PricingConfig::default())
                }
            }
        }
    }

    /// Forces the next access to reload from disk, regardless of TTL
    /// (spec §4.9 "Exposes a forced-reload operation").
    pub fn force_reload(&self, route_id: &str, path: &Path) {
        let whitelist_key = CacheKey {
            route_id: route_id.to_string(),
            kind: ConfigKind::Whitelist,
            path: path.to_path_buf(),
        };
        let pricing_key = CacheKey {
            route_id: route_id.to_string(),
            kind: ConfigKind::Pricing,
            path: path.to_path_buf(),
        };
        self.whitelists.write().remove(&whitelist_key);
        self.pricings.write().remove(&pricing_key);
    }
}
