// 备份清单

use serde::{Deserialize, Serialize};

/// 清单中的连接条目
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestConnection {
    pub name: String,
    pub group: String,
}

/// 归档内的 manifest.json
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: String,
    pub created: String,
    pub platform: String,
    pub connections: Vec<ManifestConnection>,
    pub groups: Vec<String>,
}

/// 备份结果
#[derive(Clone, Debug, Serialize)]
pub struct BackupSummary {
    pub path: String,
    pub connections: usize,
    pub groups: usize,
    /// 是否包含主配置副本
    pub includes_main_config: bool,
}
