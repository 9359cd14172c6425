//! Process-wide map of node tag to its limiter

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::hooks::{AliveMap, UserInfo};
use super::limiter::Limiter;
use crate::config::LimitConfig;

#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<Limiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register the limiter of a node, replacing any previous one
    pub fn add(
        &self,
        tag: &str,
        config: &LimitConfig,
        users: &[UserInfo],
        alive: AliveMap,
    ) -> Arc<Limiter> {
        let limiter = Arc::new(Limiter::new(tag, config, users, alive));
        self.limiters
            .write()
            .insert(tag.to_string(), Arc::clone(&limiter));
        limiter
    }

    /// `None` means the node is unmanaged
    pub fn get(&self, tag: &str) -> Option<Arc<Limiter>> {
        self.limiters.read().get(tag).cloned()
    }

    /// Stop handing out the limiter. Flows already holding it keep working
    /// until they finish.
    pub fn delete(&self, tag: &str) -> Option<Arc<Limiter>> {
        self.limiters.write().remove(tag)
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }

    pub fn tags(&self) -> Vec<String> {
        self.limiters.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::user_tag;

    #[test]
    fn test_add_get_delete() {
        let registry = LimiterRegistry::new();
        assert!(registry.get("node-1").is_none());

        let users = [UserInfo::new(1, "u1")];
        registry.add("node-1", &LimitConfig::default(), &users, AliveMap::new());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tags(), vec!["node-1".to_string()]);

        let limiter = registry.get("node-1").unwrap();
        assert_eq!(limiter.user_count(), 1);

        let removed = registry.delete("node-1").unwrap();
        assert!(Arc::ptr_eq(&limiter, &removed));
        assert!(registry.get("node-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_replaces_existing() {
        let registry = LimiterRegistry::new();
        let first = registry.add("node-1", &LimitConfig::default(), &[], AliveMap::new());
        let second = registry.add(
            "node-1",
            &LimitConfig::default(),
            &[UserInfo::new(1, "u1")],
            AliveMap::new(),
        );
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("node-1").unwrap().user_count(), 1);
    }

    #[test]
    fn test_deleted_limiter_still_usable_by_holders() {
        let registry = LimiterRegistry::new();
        let held = registry.add(
            "node-1",
            &LimitConfig::default(),
            &[UserInfo::new(1, "u1")],
            AliveMap::new(),
        );
        registry.delete("node-1");

        let (_, reject) = held.check_limit(&user_tag("node-1", "u1"), "10.0.0.1".parse().unwrap(), true);
        assert!(!reject);
    }

    #[test]
    fn test_concurrent_lookups_during_replace() {
        use std::thread;

        let registry = Arc::new(LimiterRegistry::new());
        registry.add("node-1", &LimitConfig::default(), &[], AliveMap::new());

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(r.get("node-1").is_some());
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            registry.add("node-1", &LimitConfig::default(), &[], AliveMap::new());
        }
        for h in readers {
            h.join().unwrap();
        }
    }
}
