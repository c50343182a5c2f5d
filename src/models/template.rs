// 模板相关数据结构

use serde::Serialize;

/// 模板描述
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    /// 内置模板
    pub is_default: bool,
}

/// 渲染结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RenderResult {
    pub content: String,
    /// 未解析的占位符名称（已排序、去重）
    pub unresolved: Vec<String>,
}

/// 语法校验报告
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}
