//! Background tasks for periodic panel synchronization

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::node::NodeController;
use super::panel::NodeInfo;
use crate::config::CliArgs;
use crate::logger::log;

/// Format bytes into human-readable string (KB, MB, GB)
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Background task configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    /// Interval for pulling users, alive devices and node info
    pub fetch_users_interval: Duration,
    /// Interval for reporting traffic and online devices
    pub report_traffic_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            fetch_users_interval: Duration::from_secs(60),
            report_traffic_interval: Duration::from_secs(60),
        }
    }
}

impl TaskConfig {
    pub fn new(fetch_users: Duration, report_traffic: Duration) -> Self {
        Self {
            fetch_users_interval: fetch_users,
            report_traffic_interval: report_traffic,
        }
    }

    /// Intervals from the command line, overridden by the panel when it sets them
    pub fn resolve(cli: &CliArgs, node: Option<&NodeInfo>) -> Self {
        Self {
            fetch_users_interval: node
                .and_then(NodeInfo::pull_interval)
                .unwrap_or(cli.fetch_users_interval),
            report_traffic_interval: node
                .and_then(NodeInfo::push_interval)
                .unwrap_or(cli.report_traffics_interval),
        }
    }
}

/// Background tasks manager
pub struct BackgroundTasks {
    config: TaskConfig,
    controller: Arc<NodeController>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle for spawned background tasks
pub struct BackgroundTasksHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasksHandle {
    /// Stop all background tasks and wait for them to complete
    pub async fn shutdown(self) {
        log::info!("Stopping background tasks...");
        let _ = self.shutdown_tx.send(true);

        for (i, handle) in self.handles.into_iter().enumerate() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {
                    log::debug!(task = i, "Background task stopped");
                }
                Ok(Err(e)) => {
                    log::warn!(task = i, error = %e, "Background task panicked");
                }
                Err(_) => {
                    log::warn!(task = i, "Background task shutdown timeout");
                }
            }
        }
        log::info!("Background tasks stopped");
    }
}

impl BackgroundTasks {
    pub fn new(config: TaskConfig, controller: Arc<NodeController>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            controller,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Start all background tasks and return a handle for shutdown
    pub fn start(self) -> BackgroundTasksHandle {
        let handles = vec![self.start_fetch_users_task(), self.start_report_task()];

        log::info!(
            fetch_users_interval = ?self.config.fetch_users_interval,
            report_interval = ?self.config.report_traffic_interval,
            "Background tasks started"
        );

        BackgroundTasksHandle {
            shutdown_tx: self.shutdown_tx,
            handles,
        }
    }

    fn start_fetch_users_task(&self) -> JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let interval_duration = self.config.fetch_users_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = interval(interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The node was seeded at start, skip the immediate tick
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        fetch_once(&controller).await;
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("Fetch users task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn start_report_task(&self) -> JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let interval_duration = self.config.report_traffic_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = interval(interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = report_once(&controller).await {
                            log::warn!(error = %e, "Failed to report");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("Report task shutting down");
                        // Final report before shutdown
                        if let Err(e) = report_once(&controller).await {
                            log::warn!(error = %e, "Failed to send final report");
                        }
                        break;
                    }
                }
            }
        })
    }
}

/// Pull roster, alive devices and node info. Each step fails independently.
async fn fetch_once(controller: &NodeController) {
    if let Err(e) = controller.sync_users().await {
        log::warn!(node = %controller.tag(), error = %e, "Failed to sync users");
    }
    if let Err(e) = controller.refresh_alive().await {
        log::warn!(node = %controller.tag(), error = %e, "Failed to refresh alive list");
    }
    if let Err(e) = controller.refresh_node().await {
        log::warn!(node = %controller.tag(), error = %e, "Failed to refresh node info");
    }
}

async fn report_once(controller: &NodeController) -> anyhow::Result<()> {
    let summary = controller.report().await?;
    if summary.users > 0 {
        log::info!(
            node = %controller.tag(),
            users = summary.users,
            upload = %format_bytes(summary.upload),
            download = %format_bytes(summary.download),
            online = summary.online,
            "Traffic reported"
        );
    } else {
        log::debug!(node = %controller.tag(), online = summary.online, "Nothing to report");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::backend::HookBackend;
    use crate::business::node::tests::MockPanel;
    use crate::business::panel::BaseConfig;
    use crate::config::LimitConfig;
    use crate::core::{ConnectionHook, LimiterRegistry, UserInfo, UserTraffic};
    use std::path::PathBuf;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00GB");
    }

    #[test]
    fn test_task_config_default() {
        let config = TaskConfig::default();
        assert_eq!(config.fetch_users_interval, Duration::from_secs(60));
        assert_eq!(config.report_traffic_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_task_config_resolve_prefers_panel() {
        let cli = CliArgs {
            panel_file: PathBuf::from("/tmp/panel.json"),
            node_tag: "node".to_string(),
            speed_limit: 0,
            report_min_traffic: 0,
            fetch_users_interval: Duration::from_secs(30),
            report_traffics_interval: Duration::from_secs(45),
            log_mode: "info".to_string(),
            data_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(
            TaskConfig::resolve(&cli, None),
            TaskConfig::new(Duration::from_secs(30), Duration::from_secs(45))
        );

        let node = NodeInfo {
            base_config: Some(BaseConfig {
                push_interval: Some(serde_json::json!(90)),
                pull_interval: None,
            }),
            ..NodeInfo::default()
        };
        assert_eq!(
            TaskConfig::resolve(&cli, Some(&node)),
            TaskConfig::new(Duration::from_secs(30), Duration::from_secs(90))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_report_periodically_and_on_shutdown() {
        let panel = Arc::new(MockPanel::default());
        *panel.users.lock().await = Some(vec![UserInfo::new(1, "u1")]);
        let hook = Arc::new(ConnectionHook::new(Arc::new(LimiterRegistry::new())));
        let backend = Arc::new(HookBackend::new(Arc::clone(&hook)));
        let controller = Arc::new(NodeController::new(
            "node-1",
            LimitConfig::default(),
            panel.clone(),
            backend,
            Arc::clone(&hook),
        ));
        controller.start().await.unwrap();

        let config = TaskConfig::new(Duration::from_secs(60), Duration::from_secs(10));
        let handle = BackgroundTasks::new(config, Arc::clone(&controller)).start();

        let storage = hook.counter("node-1").get_counter("u1");
        storage.add_up(100);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(
            *panel.traffic.lock().await,
            vec![UserTraffic {
                uid: 1,
                upload: 100,
                download: 0
            }]
        );

        storage.add_down(7);
        handle.shutdown().await;
        assert_eq!(panel.traffic.lock().await.len(), 2);
        assert_eq!(panel.traffic.lock().await[1].download, 7);
    }
}
