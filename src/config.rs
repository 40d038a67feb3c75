use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::queue::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_IPC_PATH: &str = "/tmp/cross_gpu_ipc";
pub const ENV_IPC_PATH: &str = "IPC_PATH";
pub const ENV_SPLIT: &str = "SPLIT";

pub const DEFAULT_SHADOW_SUFFIX: &str = "FullscreenShadowPass";
pub const DEFAULT_REPLICATE_SUFFIX: &str = "PassB_0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Authority,
    Follower,
}

impl Role {
    pub fn is_authority(self) -> bool {
        self == Self::Authority
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Authority => "authority",
            Self::Follower => "follower",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistConfig {
    /// Unset until the binary or `set_active_pipeline` picks one.
    pub role: Option<Role>,
    pub ipc_path: PathBuf,
    pub split_cnt: u16,
    pub shadow_suffix: String,
    pub replicate_suffix: String,
    pub queue_capacity: usize,
    pub reconnect_backoff_ms: u64,
    /// Hex dumps of sent/received messages are appended here when set.
    pub dump_dir: Option<PathBuf>,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            role: None,
            ipc_path: PathBuf::from(DEFAULT_IPC_PATH),
            split_cnt: 2,
            shadow_suffix: DEFAULT_SHADOW_SUFFIX.to_string(),
            replicate_suffix: DEFAULT_REPLICATE_SUFFIX.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_backoff_ms: 1000,
            dump_dir: None,
        }
    }
}

impl DistConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Defaults, then the optional JSON file, then `SPLIT` / `IPC_PATH`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_json_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_from(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_SPLIT) {
            match raw.trim().parse::<u16>() {
                Ok(n) => self.split_cnt = n,
                Err(e) => log::warn!("[config] ignoring {ENV_SPLIT}={raw:?}: {e}"),
            }
        }
        if let Some(path) = lookup(ENV_IPC_PATH).filter(|p| !p.is_empty()) {
            self.ipc_path = PathBuf::from(path);
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// The authority always counts itself, so fewer than one shard is treated as one.
    pub fn effective_split_cnt(&self) -> u16 {
        self.split_cnt.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_file_values() {
        let mut cfg: DistConfig =
            serde_json::from_str(r#"{ "split_cnt": 4, "role": "follower" }"#).unwrap();
        assert_eq!(cfg.role, Some(Role::Follower));
        assert_eq!(cfg.ipc_path, PathBuf::from(DEFAULT_IPC_PATH));

        cfg.apply_env_from(|key| match key {
            ENV_SPLIT => Some("3".to_string()),
            ENV_IPC_PATH => Some("/tmp/other".to_string()),
            _ => None,
        });
        assert_eq!(cfg.split_cnt, 3);
        assert_eq!(cfg.ipc_path, PathBuf::from("/tmp/other"));
    }

    #[test]
    fn bad_split_is_ignored() {
        let mut cfg = DistConfig::default();
        cfg.apply_env_from(|key| (key == ENV_SPLIT).then(|| "many".to_string()));
        assert_eq!(cfg.split_cnt, 2);
        assert_eq!(DistConfig { split_cnt: 0, ..cfg }.effective_split_cnt(), 1);
    }
}
