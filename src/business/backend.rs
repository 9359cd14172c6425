//! In-process backend built on the connection hook
//!
//! Keeps the uuid -> uid mapping of every node so traffic counted by the hook
//! (keyed by uuid) can be reported against panel user ids.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::LimitConfig;
use crate::core::{ConnectionHook, NodeBackend, UserId, UserInfo, UserTraffic};
use crate::error::{LimiterError, Result};
use crate::logger::log;

#[derive(Debug, Default)]
struct NodeUsers {
    uids: HashMap<String, UserId>,
    report_min_traffic_bytes: u64,
}

pub struct HookBackend {
    hook: Arc<ConnectionHook>,
    nodes: DashMap<String, NodeUsers>,
}

impl HookBackend {
    pub fn new(hook: Arc<ConnectionHook>) -> Self {
        Self {
            hook,
            nodes: DashMap::new(),
        }
    }

    pub fn hook(&self) -> &Arc<ConnectionHook> {
        &self.hook
    }

    /// Number of users known for a node
    pub fn user_count(&self, tag: &str) -> usize {
        self.nodes.get(tag).map(|n| n.uids.len()).unwrap_or(0)
    }

    fn unknown_node(tag: &str) -> LimiterError {
        LimiterError::Backend(format!("node '{}' not found", tag))
    }
}

impl NodeBackend for HookBackend {
    fn add_node(&self, tag: &str, config: &LimitConfig) -> Result<()> {
        self.nodes.insert(
            tag.to_string(),
            NodeUsers {
                uids: HashMap::new(),
                report_min_traffic_bytes: config.report_min_traffic_bytes,
            },
        );
        log::debug!(node = tag, "Backend node added");
        Ok(())
    }

    fn del_node(&self, tag: &str) -> Result<()> {
        self.nodes
            .remove(tag)
            .ok_or_else(|| Self::unknown_node(tag))?;
        self.hook.remove_counter(tag);
        Ok(())
    }

    fn add_users(&self, tag: &str, users: &[UserInfo]) -> Result<usize> {
        let mut node = self
            .nodes
            .get_mut(tag)
            .ok_or_else(|| Self::unknown_node(tag))?;
        for user in users {
            node.uids.insert(user.uuid.clone(), user.id);
        }
        Ok(users.len())
    }

    fn del_users(&self, tag: &str, users: &[UserInfo]) -> Result<()> {
        let mut node = self
            .nodes
            .get_mut(tag)
            .ok_or_else(|| Self::unknown_node(tag))?;
        let counter = self.hook.counter(tag);
        for user in users {
            counter.delete(&user.uuid);
            node.uids.remove(&user.uuid);
        }
        Ok(())
    }

    fn get_user_traffic_slice(&self, tag: &str, reset: bool) -> Option<Vec<UserTraffic>> {
        let node = self.nodes.get(tag)?;
        let counter = self.hook.counter(tag);
        let mut slice = Vec::new();

        for (uuid, storage) in counter.entries() {
            let (up, down) = storage.load();
            if up.saturating_add(down) <= node.report_min_traffic_bytes {
                continue;
            }
            let uid = match node.uids.get(&uuid).copied() {
                Some(uid) if uid != 0 => uid,
                _ => {
                    // Counted for a user the roster no longer has
                    counter.delete(&uuid);
                    continue;
                }
            };
            let (upload, download) = if reset { counter.reset(&uuid) } else { (up, down) };
            slice.push(UserTraffic {
                uid,
                upload,
                download,
            });
        }

        if slice.is_empty() {
            None
        } else {
            Some(slice)
        }
    }
}
