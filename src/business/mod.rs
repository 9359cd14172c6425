//! Business logic implementations
//!
//! This module contains the panel-facing side of a node:
//! - Panel data model and client trait, plus a file-backed panel
//! - The in-process backend over the connection hook
//! - Node lifecycle and periodic synchronization tasks

mod backend;
mod file_panel;
pub mod node;
pub mod panel;
mod tasks;

pub use backend::HookBackend;
pub use file_panel::FilePanel;
pub use node::{diff_users, NodeController, ReportSummary, SyncResult, UserDiff};
pub use panel::{NodeInfo, PanelClient, Route, RouteMatch};
pub use tasks::{BackgroundTasks, BackgroundTasksHandle, TaskConfig};
