// 连接数据结构

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 本地端口转发 `LocalForward <local_port> <remote_host>:<remote_port>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// 远程端口转发 `RemoteForward <remote_port> <local_host>:<local_port>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteForward {
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
}

/// 心跳、超时、多路复用等高级设置
///
/// 未设置的字段使用模板引擎的默认值。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSettings {
    pub server_alive_interval: Option<u32>,
    pub server_alive_count_max: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub compression: Option<bool>,
    pub strict_host_key_checking: Option<String>,
    pub control_master: Option<String>,
    pub control_path: Option<String>,
    pub control_persist: Option<String>,
    pub forward_x11: Option<bool>,
    pub forward_agent: Option<bool>,
}

/// 一个 SSH Host 条目
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    /// 分组路径，未托管连接为 `existing`
    pub group: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_file: String,
    pub jump_host: Option<String>,
    pub local_forwards: Vec<PortForward>,
    pub remote_forwards: Vec<RemoteForward>,
    /// SOCKS 端口
    pub dynamic_forward: Option<u16>,
    pub advanced: AdvancedSettings,
    pub icon: String,
    /// 推测的模板（仅用于编辑表单预选）
    pub template: String,
    /// 是否来自托管片段
    pub managed: bool,
    pub editable: bool,
}

/// 新建连接参数
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub name: String,
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub group: Option<String>,
    pub template: Option<String>,
    pub icon: Option<String>,
    pub key_file: Option<String>,
    pub jump_host: Option<String>,
    pub local_forwards: Vec<PortForward>,
    pub remote_forwards: Vec<RemoteForward>,
    pub dynamic_forward: Option<u16>,
    pub advanced: AdvancedSettings,
    /// 自定义模板使用的额外变量
    pub variables: BTreeMap<String, String>,
}

/// 更新连接参数，None 表示保持原值
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionUpdate {
    /// 重命名
    pub name: Option<String>,
    /// 移动到其他分组
    pub group: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub template: Option<String>,
    pub icon: Option<String>,
    pub key_file: Option<String>,
    /// Some("") 清除跳板机
    pub jump_host: Option<String>,
    pub local_forwards: Option<Vec<PortForward>>,
    pub remote_forwards: Option<Vec<RemoteForward>>,
    /// Some(None) 清除 SOCKS 端口
    pub dynamic_forward: Option<Option<u16>>,
    pub advanced: Option<AdvancedSettings>,
    pub variables: BTreeMap<String, String>,
}

/// 写入片段后的结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SavedConnection {
    pub name: String,
    pub group: String,
    /// 渲染后仍未替换的占位符
    pub unresolved: Vec<String>,
}

/// 列表中无法解析的片段
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListingProblem {
    pub group: String,
    pub name: String,
    pub message: String,
}

/// 连接列表
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectionListing {
    pub connections: Vec<Connection>,
    pub problems: Vec<ListingProblem>,
}

impl ConnectionListing {
    pub fn find(&self, group: &str, name: &str) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| c.group == group && c.name == name)
    }
}
