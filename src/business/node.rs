//! Node lifecycle: seed, roster sync, alive refresh, report, close

use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::panel::{online_report_body, NodeInfo, PanelClient};
use crate::config::LimitConfig;
use crate::core::{ConnectionHook, Limiter, NodeBackend, UserInfo};
use crate::logger::log;

/// Result of comparing the current roster with a freshly pulled one
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserDiff {
    /// New users plus the new version of changed users
    pub added: Vec<UserInfo>,
    /// Removed users plus the old version of changed users
    pub deleted: Vec<UserInfo>,
    /// Users whose uuid disappeared entirely
    pub removed: Vec<UserInfo>,
    pub changed: usize,
}

impl UserDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

/// Compare rosters by uuid. A user whose id, speed or device limit changed
/// shows up as delete + add.
pub fn diff_users(old: &HashMap<String, UserInfo>, new: &[UserInfo]) -> UserDiff {
    let mut diff = UserDiff::default();
    let mut seen = HashSet::with_capacity(new.len());

    for user in new {
        seen.insert(user.uuid.as_str());
        match old.get(&user.uuid) {
            None => diff.added.push(user.clone()),
            Some(prev) if prev != user => {
                diff.deleted.push(prev.clone());
                diff.added.push(user.clone());
                diff.changed += 1;
            }
            Some(_) => {}
        }
    }
    for (uuid, user) in old {
        if !seen.contains(uuid.as_str()) {
            diff.deleted.push(user.clone());
            diff.removed.push(user.clone());
        }
    }
    diff
}

/// Counts of one roster sync
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncResult {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub kicked: usize,
}

/// Totals of one report round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReportSummary {
    pub users: usize,
    pub upload: u64,
    pub download: u64,
    pub online: usize,
}

/// Owns the lifecycle of one managed node
pub struct NodeController {
    tag: String,
    config: LimitConfig,
    panel: Arc<dyn PanelClient>,
    backend: Arc<dyn NodeBackend>,
    hook: Arc<ConnectionHook>,
    /// uuid -> user, as last applied
    users: Mutex<HashMap<String, UserInfo>>,
    node_info: Mutex<Option<NodeInfo>>,
}

impl NodeController {
    pub fn new(
        tag: &str,
        config: LimitConfig,
        panel: Arc<dyn PanelClient>,
        backend: Arc<dyn NodeBackend>,
        hook: Arc<ConnectionHook>,
    ) -> Self {
        Self {
            tag: tag.to_string(),
            config,
            panel,
            backend,
            hook,
            users: Mutex::new(HashMap::new()),
            node_info: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn limiter(&self) -> Option<Arc<Limiter>> {
        self.hook.registry().get(&self.tag)
    }

    pub async fn node_info(&self) -> Option<NodeInfo> {
        self.node_info.lock().await.clone()
    }

    pub async fn user_count(&self) -> usize {
        self.users.lock().await.len()
    }

    /// Pull node info, roster and alive map, then start enforcing
    pub async fn start(&self) -> Result<()> {
        let node = self
            .panel
            .get_node_info()
            .await
            .context("Failed to get node info")?;
        let rules = node.rules()?;
        let users = self
            .panel
            .get_user_list()
            .await
            .context("Failed to get user list")?
            .unwrap_or_default();
        let alive = match self.panel.get_user_alive().await {
            Ok(alive) => alive,
            Err(e) => {
                log::warn!(node = %self.tag, error = %e, "Failed to get alive list, starting without it");
                Default::default()
            }
        };

        self.backend.add_node(&self.tag, &self.config)?;
        let added = self.backend.add_users(&self.tag, &users)?;
        let limiter = self
            .hook
            .registry()
            .add(&self.tag, &self.config, &users, alive);
        limiter.update_rules(rules);

        log::info!(
            node = %self.tag,
            node_id = node.id,
            node_type = %node.node_type,
            users = added,
            speed_limit = self.config.speed_limit,
            "Node started"
        );

        self.panel.user_list_applied(&users);
        *self.users.lock().await = users.into_iter().map(|u| (u.uuid.clone(), u)).collect();
        *self.node_info.lock().await = Some(node);
        Ok(())
    }

    /// Pull the roster and apply the difference
    pub async fn sync_users(&self) -> Result<SyncResult> {
        let new_users = match self.panel.get_user_list().await? {
            Some(users) => users,
            None => return Ok(SyncResult::default()),
        };
        let limiter = self
            .limiter()
            .ok_or_else(|| anyhow!("Node {} is not started", self.tag))?;

        let mut roster = self.users.lock().await;
        let diff = diff_users(&roster, &new_users);
        if diff.is_empty() {
            self.panel.user_list_applied(&new_users);
            return Ok(SyncResult::default());
        }

        // Changed users keep their counters; only vanished ones are dropped
        self.backend.del_users(&self.tag, &diff.removed)?;
        self.backend.add_users(&self.tag, &diff.added)?;
        limiter.update_user(&diff.added, &diff.deleted);

        let mut kicked = 0;
        for user in &diff.removed {
            let k = self.hook.kick_user(&self.tag, &user.uuid);
            if k > 0 {
                log::info!(node = %self.tag, uid = user.id, kicked = k, "User removed and kicked");
            }
            kicked += k;
        }

        for user in &diff.deleted {
            roster.remove(&user.uuid);
        }
        for user in &diff.added {
            roster.insert(user.uuid.clone(), user.clone());
        }
        self.panel.user_list_applied(&new_users);

        let result = SyncResult {
            added: diff.added.len() - diff.changed,
            removed: diff.removed.len(),
            changed: diff.changed,
            kicked,
        };
        log::info!(
            node = %self.tag,
            total = roster.len(),
            added = result.added,
            removed = result.removed,
            changed = result.changed,
            kicked = result.kicked,
            "Users synchronized"
        );
        Ok(result)
    }

    /// Replace the limiter's alive-device snapshot
    pub async fn refresh_alive(&self) -> Result<()> {
        let alive = self.panel.get_user_alive().await?;
        let limiter = self
            .limiter()
            .ok_or_else(|| anyhow!("Node {} is not started", self.tag))?;
        log::debug!(node = %self.tag, users = alive.len(), "Alive list refreshed");
        limiter.update_alive_list(alive);
        Ok(())
    }

    /// Re-read node info and apply route changes. Returns true if rules changed.
    pub async fn refresh_node(&self) -> Result<bool> {
        let node = self.panel.get_node_info().await?;
        let mut current = self.node_info.lock().await;
        if current.as_ref().is_some_and(|c| c.routes == node.routes) {
            *current = Some(node);
            return Ok(false);
        }

        let rules = node.rules()?;
        let limiter = self
            .limiter()
            .ok_or_else(|| anyhow!("Node {} is not started", self.tag))?;
        log::info!(
            node = %self.tag,
            domain_rules = rules.domain_rule_count(),
            protocol_rules = rules.protocol_rule_count(),
            "Rules updated"
        );
        limiter.update_rules(rules);
        *current = Some(node);
        Ok(true)
    }

    /// Drain traffic and the online census and push both to the panel
    pub async fn report(&self) -> Result<ReportSummary> {
        let mut summary = ReportSummary::default();

        if let Some(traffic) = self.backend.get_user_traffic_slice(&self.tag, true) {
            summary.users = traffic.len();
            summary.upload = traffic.iter().map(|t| t.upload).sum();
            summary.download = traffic.iter().map(|t| t.download).sum();
            self.panel
                .report_user_traffic(&traffic)
                .await
                .context("Failed to report traffic")?;
        }

        if let Some(limiter) = self.limiter() {
            let online = limiter.get_online_device();
            summary.online = online.len();
            self.panel
                .report_node_online_users(&online_report_body(&online))
                .await
                .context("Failed to report online users")?;
        }

        Ok(summary)
    }

    /// Stop enforcing and forget all node state
    pub async fn close(&self) -> Result<()> {
        self.hook.registry().delete(&self.tag);
        let mut roster = self.users.lock().await;
        for uuid in roster.keys() {
            self.hook.kick_user(&self.tag, uuid);
        }
        roster.clear();
        self.backend.del_node(&self.tag)?;
        log::info!(node = %self.tag, "Node closed");
        Ok(())
    }
}
