// Copyright (c) Unifra Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Consumer-scoped static configuration consumed by the ConsumerVars stage
//! (spec §4.3). Resolving a consumer's identity from an API key is the
//! authentication collaborator's job (spec §1 "out of scope"); this module
//! only defines the shape ConsumerVars copies into `Context.vars`.

use std::collections::HashMap;

/// Keys in a consumer's static profile that are metadata about the
/// consumer record itself (bookkeeping), not values a stage should ever
/// see injected into `Context.vars` (spec §4.3 "filtering out metadata
/// keys"). Convention: a leading underscore marks metadata, same as the
/// well-known metadata keys below.
const METADATA_KEYS: &[&str] = &["_id", "_created_at", "_updated_at", "_plan_id"];

fn is_metadata_key(key: &str) -> bool {
    key.starts_with('_') || METADATA_KEYS.contains(&key)
}

/// The static string map a consumer's configuration record carries, as
/// resolved upstream of the pipeline (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct ConsumerProfile {
    pub fields: HashMap<String, String>,
}

impl ConsumerProfile {
    /// Copies non-metadata fields into a fresh map for `Context.vars`
    /// (spec §4.3: "Idempotent. No failure conditions.").
    pub fn visible_vars(&self) -> HashMap<String, String> {
        self.fields
            .iter()
            .filter(|(k, _)| !is_metadata_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_keys_are_filtered_out() {
        let mut fields = HashMap::new();
        fields.insert("_id".to_string(), "abc123".to_string());
        fields.insert("tier_hint".to_string(), "gold".to_string());
        let profile = ConsumerProfile { fields };
        let visible = profile.visible_vars();
        assert_eq!(visible.get("tier_hint").map(String::as_str), Some("gold"));
        assert!(!visible.contains_key("_id"));
    }

    #[test]
    fn applying_vars_is_idempotent() {
        let mut fields = HashMap::new();
        fields.insert("region".to_string(), "eu".to_string());
        let profile = ConsumerProfile { fields };
        let first = profile.visible_vars();
        let second = profile.visible_vars();
        assert_eq!(first, second);
    }
}
