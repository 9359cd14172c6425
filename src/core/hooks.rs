//! Types and traits shared at the seams between the limiter core, the proxy
//! backends and the panel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::LimitConfig;
use crate::error::Result;

/// User ID type used throughout the system.
/// Using i64 for consistency with the panel API.
pub type UserId = i64;

/// Alive device count per user, as reported by the panel
pub type AliveMap = HashMap<UserId, u32>;

/// Build the identity key that indexes per-user state on a node
pub fn user_tag(tag: &str, uuid: &str) -> String {
    format!("{}|{}", tag, uuid)
}

/// A user as delivered by the panel roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    /// Identity secret; doubles as the proxy credential
    pub uuid: String,
    /// Static speed cap in Mbps, 0 = unlimited
    #[serde(default)]
    pub speed_limit: u64,
    /// Maximum concurrent devices, 0 = unlimited
    #[serde(default)]
    pub device_limit: u32,
}

impl UserInfo {
    pub fn new(id: UserId, uuid: impl Into<String>) -> Self {
        Self {
            id,
            uuid: uuid.into(),
            speed_limit: 0,
            device_limit: 0,
        }
    }

    pub fn with_speed_limit(mut self, mbps: u64) -> Self {
        self.speed_limit = mbps;
        self
    }

    pub fn with_device_limit(mut self, devices: u32) -> Self {
        self.device_limit = devices;
        self
    }
}

/// Traffic delta of one user since the last report claimed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub uid: UserId,
    pub upload: u64,
    pub download: u64,
}

/// A device observed online during the last census generation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnlineUser {
    pub uid: UserId,
    pub ip: IpAddr,
}

/// Capability every proxy backend exposes to the node controller.
///
/// The limiter core is backend agnostic; it only consumes the byte counts a
/// backend's connection wrapper accumulates.
pub trait NodeBackend: Send + Sync {
    /// Start serving a node
    fn add_node(&self, tag: &str, config: &LimitConfig) -> Result<()>;

    /// Stop serving a node, dropping its users and counters
    fn del_node(&self, tag: &str) -> Result<()>;

    /// Make users known to the backend for `tag`, returns how many were added
    fn add_users(&self, tag: &str, users: &[UserInfo]) -> Result<usize>;

    /// Forget users and their pending traffic
    fn del_users(&self, tag: &str, users: &[UserInfo]) -> Result<()>;

    /// Drain traffic above the node's report threshold.
    ///
    /// Returns `None` when nothing qualifies.
    fn get_user_traffic_slice(&self, tag: &str, reset: bool) -> Option<Vec<UserTraffic>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_tag_format() {
        assert_eq!(user_tag("node-1", "uuid-a"), "node-1|uuid-a");
    }

    #[test]
    fn test_user_info_builders() {
        let user = UserInfo::new(7, "uuid-7")
            .with_speed_limit(20)
            .with_device_limit(3);
        assert_eq!(user.id, 7);
        assert_eq!(user.speed_limit, 20);
        assert_eq!(user.device_limit, 3);
    }

    #[test]
    fn test_user_info_deserialize_defaults() {
        let user: UserInfo = serde_json::from_str(r#"{"id":1,"uuid":"u1"}"#).unwrap();
        assert_eq!(user.speed_limit, 0);
        assert_eq!(user.device_limit, 0);
    }

    #[test]
    fn test_online_user_serializes_ip_as_string() {
        let online = OnlineUser {
            uid: 3,
            ip: "10.0.0.1".parse().unwrap(),
        };
        let json = serde_json::to_string(&online).unwrap();
        assert_eq!(json, r#"{"uid":3,"ip":"10.0.0.1"}"#);
    }
}
