//! Per-owner cache of the active embedded policy.

use dashmap::DashMap;
use serde_json::Value;

/// An owner's active policy document and its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedConfig {
    pub config: Value,
    pub config_id: String,
}

/// Active configs keyed by owner id.
#[derive(Debug, Default)]
pub struct ConfigCache {
    entries: DashMap<String, CachedConfig>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner_id: &str) -> Option<CachedConfig> {
        self.entries.get(owner_id).map(|entry| entry.value().clone())
    }

    /// Replace the owner's active config.
    pub fn set(&self, owner_id: impl Into<String>, config: Value, config_id: impl Into<String>) {
        self.entries.insert(
            owner_id.into(),
            CachedConfig {
                config,
                config_id: config_id.into(),
            },
        );
    }

    pub fn remove(&self, owner_id: &str) -> Option<CachedConfig> {
        self.entries.remove(owner_id).map(|(_, cached)| cached)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_remove() {
        let cache = ConfigCache::new();
        assert!(cache.get("owner-1").is_none());

        cache.set("owner-1", json!({"version": 1}), "cfg-1");
        cache.set("owner-1", json!({"version": 1, "dependencies": {}}), "cfg-2");

        let cached = cache.get("owner-1").unwrap();
        assert_eq!(cached.config_id, "cfg-2");
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.remove("owner-1").map(|c| c.config_id), Some("cfg-2".into()));
        assert!(cache.is_empty());
    }
}
