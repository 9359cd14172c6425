//! Panel data model and client interface

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::{AliveMap, OnlineUser, RuleSet, UserId, UserInfo, UserTraffic};

/// Match field of a route: a comma separated string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteMatch {
    Text(String),
    List(Vec<String>),
}

impl RouteMatch {
    pub fn items(&self) -> Vec<&str> {
        match self {
            RouteMatch::Text(s) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect(),
            RouteMatch::List(items) => items.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "match")]
    pub matches: RouteMatch,
    pub action: String,
    #[serde(default)]
    pub action_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Seconds, as a number or a numeric string
    #[serde(default)]
    pub push_interval: Option<Value>,
    #[serde(default)]
    pub pull_interval: Option<Value>,
}

/// Node definition as served by the panel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub base_config: Option<BaseConfig>,
}

/// Interpret a panel interval value (number or numeric string) as seconds
fn interval_secs(value: &Value) -> Option<Duration> {
    let secs = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

impl NodeInfo {
    /// Report interval requested by the panel
    pub fn push_interval(&self) -> Option<Duration> {
        self.base_config
            .as_ref()?
            .push_interval
            .as_ref()
            .and_then(interval_secs)
    }

    /// Roster pull interval requested by the panel
    pub fn pull_interval(&self) -> Option<Duration> {
        self.base_config
            .as_ref()?
            .pull_interval
            .as_ref()
            .and_then(interval_secs)
    }

    pub fn rules(&self) -> crate::error::Result<RuleSet> {
        RuleSet::from_routes(&self.routes)
    }
}

impl RuleSet {
    /// Build block rules from panel routes.
    ///
    /// Only `block` routes contribute. `protocol:` items become protocol
    /// rules, everything else is a domain regex (an optional `regexp:` prefix
    /// is stripped).
    pub fn from_routes(routes: &[Route]) -> crate::error::Result<Self> {
        let mut domains = Vec::new();
        let mut protocols = Vec::new();
        for route in routes.iter().filter(|r| r.action == "block") {
            for item in route.matches.items() {
                if let Some(protocol) = item.strip_prefix("protocol:") {
                    protocols.push(protocol.to_string());
                } else {
                    domains.push(item.strip_prefix("regexp:").unwrap_or(item).to_string());
                }
            }
        }
        RuleSet::new(domains, protocols)
    }
}

/// Traffic push body: uid -> [upload, download]
pub fn traffic_report_body(traffic: &[UserTraffic]) -> HashMap<UserId, [u64; 2]> {
    traffic
        .iter()
        .map(|t| (t.uid, [t.upload, t.download]))
        .collect()
}

/// Online report body: uid -> [ip, ...]
pub fn online_report_body(online: &[OnlineUser]) -> HashMap<UserId, Vec<String>> {
    let mut body: HashMap<UserId, Vec<String>> = HashMap::new();
    for user in online {
        body.entry(user.uid).or_default().push(user.ip.to_string());
    }
    body
}

/// Control plane of one node
#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn get_node_info(&self) -> Result<NodeInfo>;

    /// `None` means the roster did not change since the last applied one
    async fn get_user_list(&self) -> Result<Option<Vec<UserInfo>>>;

    /// The node finished applying a roster returned by `get_user_list`
    fn user_list_applied(&self, _users: &[UserInfo]) {}

    async fn get_user_alive(&self) -> Result<AliveMap>;

    /// Push traffic deltas; called only with a non-empty slice
    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()>;

    async fn report_node_online_users(&self, online: &HashMap<UserId, Vec<String>>) -> Result<()>;
}
