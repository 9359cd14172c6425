//! Node-side admission control, rate limiting and traffic accounting
//!
//! Architecture:
//! - `core/`: limiter engine, token buckets, counters, the connection hook
//!   proxy backends call, and the stream wrappers it returns
//! - `business/`: panel model and client trait, node lifecycle, periodic
//!   synchronization tasks
//! - `config`, `error`, `logger`: ambient plumbing

pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;

pub use error::{LimiterError, Result};
