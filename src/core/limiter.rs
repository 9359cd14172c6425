//! Per-node admission control
//!
//! A `Limiter` owns everything needed to answer "may this flow proceed, and
//! at what rate" for one node:
//! - per-user policy (`UserLimitInfo`) with lazily expiring dynamic overrides
//! - a two-generation census of online source IPs for device caps
//! - the cache of per-user token buckets
//! - the panel's alive-device snapshot and the node's block rules
//!
//! All per-user state lives in concurrent maps so admission checks for
//! unrelated users never wait on roster refreshes.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::bucket::{mbps_to_bytes_per_sec, Bucket};
use super::hooks::{user_tag, AliveMap, OnlineUser, UserId, UserInfo};
use super::rules::RuleSet;
use crate::config::LimitConfig;
use crate::error::{LimiterError, Result};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn to_unix(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Strip the IPv4-mapped IPv6 form so one device has one address
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Combine the node cap and the user cap: the smallest non-zero wins,
/// 0 means unlimited.
pub fn effective_speed_limit(node_limit: u64, user_limit: u64) -> u64 {
    match (node_limit, user_limit) {
        (0, user) => user,
        (node, 0) => node,
        (node, user) => node.min(user),
    }
}

/// Policy of one user on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLimitInfo {
    pub uid: UserId,
    /// Static cap from the roster, Mbps
    pub speed_limit: u64,
    pub device_limit: u32,
    /// Temporary cap, Mbps; only meaningful while `expire_at != 0`
    pub dynamic_speed_limit: u64,
    /// Unix seconds, 0 = no override
    pub expire_at: i64,
    pub over_limit: bool,
}

impl UserLimitInfo {
    fn from_user(user: &UserInfo) -> Self {
        Self {
            uid: user.id,
            speed_limit: user.speed_limit,
            device_limit: user.device_limit,
            dynamic_speed_limit: 0,
            expire_at: 0,
            over_limit: false,
        }
    }

    /// Drop an expired override. Returns true only on the call that cleared it.
    fn clear_expired(&mut self, now: i64) -> bool {
        if self.expire_at != 0 && self.expire_at < now {
            self.dynamic_speed_limit = 0;
            self.expire_at = 0;
            return true;
        }
        false
    }

    /// The cap the user is currently subject to, before the node cap
    fn user_speed_limit(&self) -> u64 {
        if self.expire_at != 0 && self.dynamic_speed_limit > 0 {
            self.dynamic_speed_limit
        } else {
            self.speed_limit
        }
    }
}

#[derive(Debug)]
struct OnlineIps {
    uid: UserId,
    ips: HashSet<IpAddr>,
}

impl OnlineIps {
    fn new(uid: UserId) -> Self {
        Self {
            uid,
            ips: HashSet::new(),
        }
    }
}

type Generation = DashMap<String, OnlineIps>;

#[derive(Debug, Default)]
struct Census {
    current: Arc<Generation>,
    previous: Arc<Generation>,
}

/// Admission controller of one node
#[derive(Debug)]
pub struct Limiter {
    tag: String,
    /// Node-wide cap, Mbps
    speed_limit: u64,
    user_limits: DashMap<String, UserLimitInfo>,
    uuid_to_uid: DashMap<String, UserId>,
    census: RwLock<Census>,
    buckets: DashMap<String, Arc<Bucket>>,
    alive: RwLock<Arc<AliveMap>>,
    rules: RwLock<Arc<RuleSet>>,
}

impl Limiter {
    /// Create a limiter seeded with the panel roster and alive snapshot
    pub fn new(tag: &str, config: &LimitConfig, users: &[UserInfo], alive: AliveMap) -> Self {
        let limiter = Self {
            tag: tag.to_string(),
            speed_limit: config.speed_limit,
            user_limits: DashMap::with_capacity(users.len()),
            uuid_to_uid: DashMap::with_capacity(users.len()),
            census: RwLock::new(Census::default()),
            buckets: DashMap::new(),
            alive: RwLock::new(Arc::new(alive)),
            rules: RwLock::new(Arc::new(RuleSet::default())),
        };
        limiter.update_user(users, &[]);
        limiter
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Node-wide speed cap in Mbps
    pub fn speed_limit(&self) -> u64 {
        self.speed_limit
    }

    pub fn user_count(&self) -> usize {
        self.user_limits.len()
    }

    /// Resolve a user's numeric id from its uuid
    pub fn uid_of(&self, uuid: &str) -> Option<UserId> {
        self.uuid_to_uid.get(uuid).map(|uid| *uid)
    }

    /// Current policy of a user
    pub fn user_limit_info(&self, user_key: &str) -> Option<UserLimitInfo> {
        self.user_limits.get(user_key).map(|info| info.clone())
    }

    /// Decide whether a new flow may proceed.
    ///
    /// Returns the bucket the flow must drain (None = unlimited) and whether
    /// it is rejected. Unknown users and exceeded device caps both reject.
    pub fn check_limit(
        &self,
        user_key: &str,
        source: IpAddr,
        enforce_device_limit: bool,
    ) -> (Option<Arc<Bucket>>, bool) {
        let (uid, device_limit, user_limit) = match self.user_limits.get_mut(user_key) {
            Some(mut info) => {
                info.clear_expired(now_unix());
                (info.uid, info.device_limit, info.user_speed_limit())
            }
            None => return (None, true),
        };

        if enforce_device_limit && !self.admit_device(user_key, uid, device_limit, source) {
            if let Some(mut info) = self.user_limits.get_mut(user_key) {
                info.over_limit = true;
            }
            return (None, true);
        }

        let limit = effective_speed_limit(self.speed_limit, user_limit);
        if limit == 0 {
            return (None, false);
        }
        (Some(self.bucket_for(user_key, mbps_to_bytes_per_sec(limit))), false)
    }

    /// Record `source` for the user in the current census generation unless
    /// that would exceed the device cap.
    fn admit_device(&self, user_key: &str, uid: UserId, device_limit: u32, source: IpAddr) -> bool {
        let ip = normalize_ip(source);
        let (current, previous) = {
            let census = self.census.read();
            (Arc::clone(&census.current), Arc::clone(&census.previous))
        };
        let alive = self.alive.read().get(&uid).copied().unwrap_or(0) as usize;

        let admitted = {
            let mut online = current
                .entry(user_key.to_string())
                .or_insert_with(|| OnlineIps::new(uid));
            online.uid = uid;

            if online.ips.contains(&ip) {
                true
            } else if previous
                .get(user_key)
                .is_some_and(|prev| prev.uid == uid && prev.ips.contains(&ip))
            {
                // Survived the last sweep, already accounted for
                online.ips.insert(ip);
                true
            } else if device_limit > 0 && alive.max(online.ips.len()) >= device_limit as usize {
                false
            } else {
                online.ips.insert(ip);
                true
            }
        };

        if !admitted {
            current.remove_if(user_key, |_, online| online.ips.is_empty());
        } else if let Some(mut info) = self.user_limits.get_mut(user_key) {
            info.over_limit = false;
        }
        admitted
    }

    fn bucket_for(&self, user_key: &str, rate: u64) -> Arc<Bucket> {
        let bucket = match self.buckets.get(user_key) {
            Some(bucket) => Arc::clone(bucket.value()),
            None => self
                .buckets
                .entry(user_key.to_string())
                .or_insert_with(|| Arc::new(Bucket::new(rate)))
                .clone(),
        };
        if bucket.rate() != rate {
            bucket.set_rate(rate);
        }
        bucket
    }

    /// Promote the current census generation and report what it saw.
    ///
    /// The previous generation is discarded; the current one becomes the new
    /// previous and a fresh empty generation starts accumulating.
    pub fn get_online_device(&self) -> Vec<OnlineUser> {
        let promoted = {
            let mut census = self.census.write();
            let promoted = std::mem::take(&mut census.current);
            census.previous = Arc::clone(&promoted);
            promoted
        };

        promoted
            .iter()
            .flat_map(|entry| {
                let uid = entry.uid;
                entry
                    .ips
                    .iter()
                    .map(move |ip| OnlineUser { uid, ip: *ip })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Apply a roster diff. Deletions run first so a changed user can be
    /// passed in both lists.
    ///
    /// A user deleted and re-added under the same uuid and id keeps its
    /// census entries, alive count and bucket; only its limits are replaced.
    pub fn update_user(&self, added: &[UserInfo], deleted: &[UserInfo]) {
        let readded: HashMap<&str, UserId> = added
            .iter()
            .map(|user| (user.uuid.as_str(), user.id))
            .collect();
        let removed: Vec<&UserInfo> = deleted
            .iter()
            .filter(|user| readded.get(user.uuid.as_str()) != Some(&user.id))
            .collect();

        if !removed.is_empty() {
            let (current, previous) = {
                let census = self.census.read();
                (Arc::clone(&census.current), Arc::clone(&census.previous))
            };
            for user in &removed {
                let key = user_tag(&self.tag, &user.uuid);
                self.user_limits.remove(&key);
                current.remove(&key);
                previous.remove(&key);
                self.buckets.remove(&key);
                self.uuid_to_uid.remove(&user.uuid);
            }
            let mut alive = self.alive.write();
            let alive = Arc::make_mut(&mut alive);
            for user in &removed {
                alive.remove(&user.id);
            }
        }

        for user in added {
            self.user_limits.insert(
                user_tag(&self.tag, &user.uuid),
                UserLimitInfo::from_user(user),
            );
            self.uuid_to_uid.insert(user.uuid.clone(), user.id);
        }
    }

    /// Install a temporary cap that supersedes the static one until `expire_at`
    pub fn update_dynamic_speed_limit(
        &self,
        user_key: &str,
        limit: u64,
        expire_at: SystemTime,
    ) -> Result<()> {
        match self.user_limits.get_mut(user_key) {
            Some(mut info) => {
                info.dynamic_speed_limit = limit;
                info.expire_at = to_unix(expire_at);
                Ok(())
            }
            None => Err(LimiterError::UserNotFound(user_key.to_string())),
        }
    }

    /// Replace the panel's alive-device snapshot
    pub fn update_alive_list(&self, alive: AliveMap) {
        *self.alive.write() = Arc::new(alive);
    }

    pub fn alive_count(&self, uid: UserId) -> u32 {
        self.alive.read().get(&uid).copied().unwrap_or(0)
    }

    pub fn update_rules(&self, rules: RuleSet) {
        *self.rules.write() = Arc::new(rules);
    }

    /// Returns true if the destination is blocked by a domain rule
    pub fn check_domain_rule(&self, destination: &str) -> bool {
        self.rules.read().check_domain(destination)
    }

    /// Returns true if the protocol is blocked
    pub fn check_protocol_rule(&self, protocol: &str) -> bool {
        self.rules.read().check_protocol(protocol)
    }

    /// Number of users with at least one IP in the current generation
    pub fn online_user_count(&self) -> usize {
        self.census.read().current.len()
    }
}
