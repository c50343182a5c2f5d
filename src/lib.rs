// SSH Manager - SSH 配置分组管理
//
// 把每个连接保存为分组目录下的独立片段，通过主配置中的一条 Include 行接入 ssh。

pub mod constants;
pub mod models;
pub mod services;
pub mod ssh;

pub use models::ManagerSettings;
pub use ssh::error::{ErrorKind, ErrorReport, ManagerError, Result};
pub use ssh::manager::{InitReport, IntegrityIssue, IntegrityReport, IssueSeverity, SshManager};
pub use ssh::probe::ProbeOutcome;
