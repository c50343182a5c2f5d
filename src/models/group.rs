// 分组数据结构

use serde::Serialize;

/// 分组（列表用）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub path: String,
    pub name: String,
    pub depth: usize,
    pub parent: Option<String>,
    pub icon: String,
    /// 直接位于该分组下的连接数
    pub connection_count: usize,
}

/// 分组树节点
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupNode {
    pub name: String,
    pub path: String,
    pub icon: String,
    pub connections: Vec<String>,
    pub children: Vec<GroupNode>,
}
