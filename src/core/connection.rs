//! Flow tracking
//!
//! Every admitted flow is registered under its identity key so a roster sync
//! can abort the flows of users that were removed. Flows are grouped per user
//! in one map, so a user's flow set is always mutated under a single shard
//! lock.

use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Unique flow identifier
pub type FlowId = u64;

#[derive(Debug)]
struct ActiveFlow {
    source: SocketAddr,
    opened_at: Instant,
    cancel_token: CancellationToken,
}

/// Live flows grouped by identity key, with kick-off capability
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    next_flow_id: Arc<AtomicU64>,
    users: Arc<DashMap<String, HashMap<FlowId, ActiveFlow>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow that stays live until the returned guard is dropped
    pub fn track(&self, user_key: &str, source: SocketAddr) -> (FlowGuard, CancellationToken) {
        let id = self.next_flow_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel_token = CancellationToken::new();
        self.users.entry(user_key.to_string()).or_default().insert(
            id,
            ActiveFlow {
                source,
                opened_at: Instant::now(),
                cancel_token: cancel_token.clone(),
            },
        );

        let guard = FlowGuard {
            manager: self.clone(),
            user_key: user_key.to_string(),
            id,
        };
        (guard, cancel_token)
    }

    fn release(&self, user_key: &str, id: FlowId) {
        self.users.remove_if_mut(user_key, |_, flows| {
            flows.remove(&id);
            flows.is_empty()
        });
    }

    /// Cancel every flow of a user, returns how many were signalled
    pub fn kick_user(&self, user_key: &str) -> usize {
        let Some(flows) = self.users.get(user_key) else {
            return 0;
        };
        for (id, flow) in flows.iter() {
            flow.cancel_token.cancel();
            log::debug!(
                user = user_key,
                flow = id,
                source = %flow.source,
                age_secs = flow.opened_at.elapsed().as_secs(),
                "Flow kicked"
            );
        }
        flows.len()
    }

    pub fn flow_count(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of users with live flows
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// Keeps a flow registered for as long as it lives
#[derive(Debug)]
pub struct FlowGuard {
    manager: ConnectionManager,
    user_key: String,
    id: FlowId,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.manager.release(&self.user_key, self.id);
    }
}
