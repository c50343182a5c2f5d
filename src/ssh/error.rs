// 错误类型定义

use serde::Serialize;
use thiserror::Error;

/// 管理器错误类型
#[derive(Debug, Error)]
pub enum ManagerError {
    /// 名称、主机、端口等格式错误（写入任何文件之前拒绝）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 分组路径非法
    #[error("Invalid group path: {0}")]
    InvalidPath(String),

    /// 分组、连接或模板不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 名称或分组重复
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 分组非空，不能删除
    #[error("Group '{group}' still contains {count} connection(s)")]
    NonEmpty { group: String, count: usize },

    /// SSH 配置无法分词
    #[error("Parse error in {source_ref} (line {line}): {message}")]
    Parse {
        source_ref: String,
        line: usize,
        message: String,
    },

    /// 模板不存在
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// 目标分组不可用（例如 existing）
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// 备份归档错误
    #[error("Backup error: {0}")]
    Backup(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 元数据错误
    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// 错误分类（用于传输层渲染）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    NonEmpty,
    Parse,
    InvalidTarget,
    Internal,
}

/// 序列化后的失败原因
#[derive(Clone, Debug, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    /// NonEmpty 时为阻塞删除的连接数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl ManagerError {
    pub(crate) fn parse(source_ref: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        ManagerError::Parse {
            source_ref: source_ref.into(),
            line,
            message: message.into(),
        }
    }

    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidPath(_) => ErrorKind::Validation,
            Self::NotFound(_) | Self::TemplateNotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NonEmpty { .. } => ErrorKind::NonEmpty,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::InvalidTarget(_) => ErrorKind::InvalidTarget,
            Self::Backup(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// 转换为可序列化的失败原因
    pub fn report(&self) -> ErrorReport {
        let count = match self {
            Self::NonEmpty { count, .. } => Some(*count),
            _ => None,
        };
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            count,
        }
    }
}
