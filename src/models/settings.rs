// 运行配置

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{defaults, groups, icons};

/// 管理器配置（显式传入所有组件）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// 管理目录，包含 config/ keys/ templates/ backups/
    pub root_dir: PathBuf,
    /// 用户主配置，通常为 ~/.ssh/config
    pub ssh_config_path: PathBuf,
    /// 首次运行创建的分组
    pub default_groups: Vec<String>,
    pub default_icon: String,
    pub default_group_icon: String,
    /// 系统 ssh 客户端
    pub ssh_binary: String,
    /// 探测超时（秒）
    pub probe_timeout_secs: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root_dir: home.join("ssh_manager"),
            ssh_config_path: home.join(".ssh").join("config"),
            default_groups: groups::DEFAULTS.iter().map(|g| g.to_string()).collect(),
            default_icon: icons::DEFAULT_CONNECTION.to_string(),
            default_group_icon: icons::DEFAULT_GROUP.to_string(),
            ssh_binary: defaults::SSH_BINARY.to_string(),
            probe_timeout_secs: defaults::PROBE_TIMEOUT_SECS,
        }
    }
}

impl ManagerSettings {
    /// 基于用户主目录的默认配置
    pub fn from_home() -> Self {
        Self::default()
    }

    /// 指定根目录，主配置位于 `<root>/ssh_config`（测试或多实例使用）
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            root_dir: root.join("ssh_manager"),
            ssh_config_path: root.join("ssh_config"),
            ..Self::default()
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root_dir.join(crate::constants::layout::CONFIG_DIR)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root_dir.join(crate::constants::layout::KEYS_DIR)
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root_dir.join(crate::constants::layout::TEMPLATES_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root_dir.join(crate::constants::layout::BACKUPS_DIR)
    }

    pub fn config_backups_dir(&self) -> PathBuf {
        self.backups_dir()
            .join(crate::constants::layout::CONFIG_BACKUPS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_root_layout() {
        let settings = ManagerSettings::with_root("/tmp/x");
        assert_eq!(settings.root_dir, PathBuf::from("/tmp/x/ssh_manager"));
        assert_eq!(settings.ssh_config_path, PathBuf::from("/tmp/x/ssh_config"));
        assert_eq!(
            settings.config_backups_dir(),
            PathBuf::from("/tmp/x/ssh_manager/backups/config-backups")
        );
        assert_eq!(settings.default_groups, vec!["work", "personal", "projects"]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: ManagerSettings =
            serde_json::from_str(r#"{"probe_timeout_secs": 2}"#).unwrap();
        assert_eq!(settings.probe_timeout_secs, 2);
        assert_eq!(settings.ssh_binary, "ssh");
    }
}
