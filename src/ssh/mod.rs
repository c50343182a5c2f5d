// SSH 配置模块
//
// 模块结构:
// - config: 配置分词与片段解析
// - error: 错误类型 (ManagerError)
// - main_config: 主配置 Include 行、已有 Host 发现与注释
// - migration: 迁移日志与分阶段执行
// - probe: 系统 ssh 客户端探测
// - manager: 对外操作入口 (SshManager)

pub mod config;
pub mod error;
pub mod main_config;
pub mod manager;
pub mod migration;
pub mod probe;

pub use error::{ManagerError, Result};
pub use manager::SshManager;
