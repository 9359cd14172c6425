//! Interception point called by proxy backends
//!
//! A backend calls the hook once per accepted connection or new datagram
//! association. The hook consults the node's limiter, applies the node's
//! block rules, and hands back the flow wrapped with its traffic counter and
//! bucket. A `None` result means the backend must close the flow.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::bucket::Bucket;
use super::connection::{ConnectionManager, FlowGuard};
use super::counter::{TrafficCounter, TrafficStorage};
use super::hooks::user_tag;
use super::limiter::Limiter;
use super::registry::LimiterRegistry;
use super::stream::HookedStream;
use crate::logger::log;

/// What a backend knows about a flow when it asks for admission
#[derive(Debug, Clone)]
pub struct FlowContext {
    /// Node tag the flow arrived on
    pub tag: String,
    /// Authenticated user identity
    pub uuid: String,
    pub source: SocketAddr,
    /// Destination host or address, if already known
    pub destination: Option<String>,
    /// Sniffed application protocol, if any
    pub protocol: Option<String>,
}

impl FlowContext {
    pub fn new(tag: impl Into<String>, uuid: impl Into<String>, source: SocketAddr) -> Self {
        Self {
            tag: tag.into(),
            uuid: uuid.into(),
            source,
            destination: None,
            protocol: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// An admitted datagram association
#[derive(Debug)]
pub struct PacketFlow {
    storage: Arc<TrafficStorage>,
    bucket: Option<Arc<Bucket>>,
    cancel: CancellationToken,
    _flow: FlowGuard,
}

impl PacketFlow {
    /// Account a datagram received from the client
    pub fn record_upload(&self, bytes: usize) {
        self.storage.add_up(bytes as u64);
    }

    /// Account a datagram sent back to the client
    pub fn record_download(&self, bytes: usize) {
        self.storage.add_down(bytes as u64);
    }

    /// Wait until `bytes` may be forwarded
    pub async fn throttle(&self, bytes: usize) {
        if let Some(bucket) = &self.bucket {
            bucket.wait(bytes as u64).await;
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the flow has been kicked
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

pub struct ConnectionHook {
    registry: Arc<LimiterRegistry>,
    /// node tag -> per-user counters
    counters: DashMap<String, Arc<TrafficCounter>>,
    connections: ConnectionManager,
}

impl ConnectionHook {
    pub fn new(registry: Arc<LimiterRegistry>) -> Self {
        Self {
            registry,
            counters: DashMap::new(),
            connections: ConnectionManager::new(),
        }
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Traffic counter of a node, created on first use
    pub fn counter(&self, tag: &str) -> Arc<TrafficCounter> {
        if let Some(counter) = self.counters.get(tag) {
            return Arc::clone(counter.value());
        }
        self.counters
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(TrafficCounter::new()))
            .clone()
    }

    pub fn remove_counter(&self, tag: &str) -> Option<Arc<TrafficCounter>> {
        self.counters.remove(tag).map(|(_, counter)| counter)
    }

    /// Abort every live flow of a user, returns how many were signalled
    pub fn kick_user(&self, tag: &str, uuid: &str) -> usize {
        self.connections.kick_user(&user_tag(tag, uuid))
    }

    /// Number of live flows across all nodes
    pub fn flow_count(&self) -> usize {
        self.connections.flow_count()
    }

    /// Admit a stream flow. `None` means close it.
    pub fn routed_connection<S>(&self, ctx: &FlowContext, stream: S) -> Option<HookedStream<S>> {
        let bucket = self.admit(ctx, true)?;
        let (guard, token) = self
            .connections
            .track(&user_tag(&ctx.tag, &ctx.uuid), ctx.source);
        let storage = self.counter(&ctx.tag).get_counter(&ctx.uuid);
        log::debug!(
            node = %ctx.tag,
            uuid = %ctx.uuid,
            source = %ctx.source,
            limited = bucket.is_some(),
            "Connection admitted"
        );
        Some(HookedStream::new(stream, storage, bucket, token, Some(guard)))
    }

    /// Admit a datagram association. The device cap is not enforced here.
    pub fn routed_packet(&self, ctx: &FlowContext) -> Option<PacketFlow> {
        let bucket = self.admit(ctx, false)?;
        let (guard, cancel) = self
            .connections
            .track(&user_tag(&ctx.tag, &ctx.uuid), ctx.source);
        Some(PacketFlow {
            storage: self.counter(&ctx.tag).get_counter(&ctx.uuid),
            bucket,
            cancel,
            _flow: guard,
        })
    }

    /// Returns `None` on reject, `Some(bucket)` on admit
    fn admit(&self, ctx: &FlowContext, enforce_device_limit: bool) -> Option<Option<Arc<Bucket>>> {
        let limiter = match self.registry.get(&ctx.tag) {
            Some(limiter) => limiter,
            None => {
                log::warn!(node = %ctx.tag, "No limiter for node, traffic is only counted");
                return Some(None);
            }
        };

        let key = user_tag(&ctx.tag, &ctx.uuid);
        let (bucket, reject) =
            limiter.check_limit(&key, ctx.source.ip(), enforce_device_limit);
        if reject {
            let reason = if limiter.user_limit_info(&key).is_some() {
                "device limit reached"
            } else {
                "unknown user"
            };
            log::admission(&ctx.tag, &ctx.uuid, &ctx.source.to_string(), reason);
            return None;
        }

        if self.blocked_by_rule(&limiter, ctx) {
            return None;
        }
        Some(bucket)
    }

    fn blocked_by_rule(&self, limiter: &Limiter, ctx: &FlowContext) -> bool {
        if let Some(destination) = ctx.destination.as_deref() {
            if limiter.check_domain_rule(destination) {
                log::rule_reject(&ctx.tag, &ctx.uuid, destination, "domain");
                return true;
            }
        }
        if let Some(protocol) = ctx.protocol.as_deref() {
            if limiter.check_protocol_rule(protocol) {
                log::rule_reject(&ctx.tag, &ctx.uuid, protocol, "protocol");
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitConfig;
    use crate::core::hooks::{AliveMap, UserInfo};
    use crate::core::rules::RuleSet;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn hook_with(users: &[UserInfo]) -> ConnectionHook {
        let registry = Arc::new(LimiterRegistry::new());
        registry.add("node-1", &LimitConfig::default(), users, AliveMap::new());
        ConnectionHook::new(registry)
    }

    fn ctx(uuid: &str, ip: [u8; 4]) -> FlowContext {
        FlowContext::new("node-1", uuid, SocketAddr::from((ip, 40000)))
    }

    #[tokio::test]
    async fn test_admitted_connection_is_counted() {
        let hook = hook_with(&[UserInfo::new(1, "u1")]);
        let (client, mut peer) = duplex(1024);
        let mut stream = hook.routed_connection(&ctx("u1", [10, 0, 0, 1]), client).unwrap();
        assert!(!stream.is_limited());
        assert_eq!(hook.flow_count(), 1);

        peer.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"reply").await.unwrap();

        let counter = hook.counter("node-1");
        assert_eq!(counter.up_count("u1"), 7);
        assert_eq!(counter.down_count("u1"), 5);

        drop(stream);
        assert_eq!(hook.flow_count(), 0);
    }

    #[test]
    fn test_unknown_user_is_rejected() {
        let hook = hook_with(&[]);
        let (client, _peer) = duplex(16);
        assert!(hook.routed_connection(&ctx("ghost", [10, 0, 0, 1]), client).is_none());
        assert!(hook.routed_packet(&ctx("ghost", [10, 0, 0, 1])).is_none());
    }

    #[test]
    fn test_unmanaged_node_passes_through() {
        let hook = ConnectionHook::new(Arc::new(LimiterRegistry::new()));
        let flow = hook.routed_packet(&ctx("anyone", [10, 0, 0, 1])).unwrap();
        assert!(!flow.is_limited());
        flow.record_upload(10);
        assert_eq!(hook.counter("node-1").up_count("anyone"), 10);
    }

    #[test]
    fn test_device_limit_only_for_streams() {
        let hook = hook_with(&[UserInfo::new(1, "u1").with_device_limit(1)]);
        let (a, _pa) = duplex(16);
        let (b, _pb) = duplex(16);
        let first = hook.routed_connection(&ctx("u1", [10, 0, 0, 1]), a);
        assert!(first.is_some());
        assert!(hook.routed_connection(&ctx("u1", [10, 0, 0, 2]), b).is_none());
        assert!(hook.routed_packet(&ctx("u1", [10, 0, 0, 2])).is_some());
    }

    #[test]
    fn test_rules_block_flows() {
        let hook = hook_with(&[UserInfo::new(1, "u1")]);
        let limiter = hook.registry().get("node-1").unwrap();
        limiter.update_rules(RuleSet::new(["\\.blocked$"], ["bittorrent"]).unwrap());

        let blocked = ctx("u1", [10, 0, 0, 1]).with_destination("site.blocked");
        assert!(hook.routed_packet(&blocked).is_none());

        let p2p = ctx("u1", [10, 0, 0, 1]).with_protocol("bittorrent");
        assert!(hook.routed_packet(&p2p).is_none());

        let fine = ctx("u1", [10, 0, 0, 1])
            .with_destination("example.com")
            .with_protocol("tls");
        assert!(hook.routed_packet(&fine).is_some());
    }

    #[test]
    fn test_limited_user_gets_bucket() {
        let hook = hook_with(&[UserInfo::new(1, "u1").with_speed_limit(8)]);
        let flow = hook.routed_packet(&ctx("u1", [10, 0, 0, 1])).unwrap();
        assert!(flow.is_limited());
    }

    #[tokio::test]
    async fn test_kick_user_cancels_flows() {
        let hook = hook_with(&[UserInfo::new(1, "u1"), UserInfo::new(2, "u2")]);
        let flow = hook.routed_packet(&ctx("u1", [10, 0, 0, 1])).unwrap();
        let other = hook.routed_packet(&ctx("u2", [10, 0, 0, 2])).unwrap();

        assert_eq!(hook.kick_user("node-1", "u1"), 1);
        flow.cancelled().await;
        assert!(flow.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_remove_counter() {
        let hook = hook_with(&[]);
        hook.counter("node-1").get_counter("u1").add_up(1);
        let removed = hook.remove_counter("node-1").unwrap();
        assert_eq!(removed.up_count("u1"), 1);
        assert_eq!(hook.counter("node-1").up_count("u1"), 0);
    }
}
