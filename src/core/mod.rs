//! Admission control core
//!
//! This module contains everything that runs on the data path:
//! - Per-node limiters (device census, speed caps, block rules)
//! - Token buckets and traffic counters
//! - Flow tracking with kick-off
//! - The hook proxy backends call, and the stream wrappers it returns

pub mod bucket;
mod connection;
pub mod counter;
mod hook;
pub mod hooks;
pub mod limiter;
mod registry;
pub mod rules;
mod stream;

pub use bucket::{mbps_to_bytes_per_sec, Bucket};
pub use connection::{ConnectionManager, FlowGuard};
pub use counter::{TrafficCounter, TrafficStorage};
pub use hook::{ConnectionHook, FlowContext, PacketFlow};
pub use hooks::{user_tag, AliveMap, NodeBackend, OnlineUser, UserId, UserInfo, UserTraffic};
pub use limiter::{effective_speed_limit, Limiter, UserLimitInfo};
pub use registry::LimiterRegistry;
pub use rules::RuleSet;
pub use stream::{CountedStream, HookedStream, LimitedStream};
