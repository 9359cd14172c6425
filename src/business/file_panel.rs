//! Panel backed by a local JSON file
//!
//! The file holds the node definition, the user roster and the alive map.
//! It is re-read on every pull, so editing it acts like a panel change.
//! Reports are written under the data directory: traffic is appended to
//! `traffic.jsonl`, the latest online snapshot replaces `online.json`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

use super::panel::{traffic_report_body, NodeInfo, PanelClient};
use crate::core::{AliveMap, UserId, UserInfo, UserTraffic};
use crate::logger::log;

const TRAFFIC_FILE: &str = "traffic.jsonl";
const ONLINE_FILE: &str = "online.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PanelFile {
    #[serde(default)]
    node: NodeInfo,
    #[serde(default)]
    users: Vec<UserInfo>,
    #[serde(default)]
    alive: AliveMap,
}

#[derive(Debug, Serialize)]
struct TrafficRecord<'a> {
    timestamp: u64,
    traffic: &'a HashMap<UserId, [u64; 2]>,
}

pub struct FilePanel {
    path: PathBuf,
    data_dir: PathBuf,
    /// Roster the node last applied, for change detection
    applied_users: Mutex<Option<Vec<UserInfo>>>,
}

impl FilePanel {
    pub fn new(path: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
        Ok(Self {
            path: path.into(),
            data_dir,
            applied_users: Mutex::new(None),
        })
    }

    pub fn traffic_path(&self) -> PathBuf {
        self.data_dir.join(TRAFFIC_FILE)
    }

    pub fn online_path(&self) -> PathBuf {
        self.data_dir.join(ONLINE_FILE)
    }

    async fn read_panel(&self) -> crate::Result<PanelFile> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn load(&self) -> Result<PanelFile> {
        self.read_panel()
            .await
            .with_context(|| format!("Failed to load panel file {}", self.path.display()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(format!("{}\n", line).as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[async_trait]
impl PanelClient for FilePanel {
    async fn get_node_info(&self) -> Result<NodeInfo> {
        Ok(self.load().await?.node)
    }

    async fn get_user_list(&self) -> Result<Option<Vec<UserInfo>>> {
        let users = self.load().await?.users;
        if self.applied_users.lock().as_ref() == Some(&users) {
            return Ok(None);
        }
        log::debug!(count = users.len(), "Users loaded from panel file");
        Ok(Some(users))
    }

    fn user_list_applied(&self, users: &[UserInfo]) {
        *self.applied_users.lock() = Some(users.to_vec());
    }

    async fn get_user_alive(&self) -> Result<AliveMap> {
        Ok(self.load().await?.alive)
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        let body = traffic_report_body(traffic);
        let record = serde_json::to_string(&TrafficRecord {
            timestamp: unix_now(),
            traffic: &body,
        })?;
        append_line(&self.traffic_path(), &record).await
    }

    async fn report_node_online_users(&self, online: &HashMap<UserId, Vec<String>>) -> Result<()> {
        let path = self.online_path();
        let content = serde_json::to_string_pretty(online)?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
