// 分组路径校验与规范化
// 例如 work/clients/acme

use serde::Serialize;

use crate::constants::groups::{MAX_DEPTH, MAX_SEGMENT_LEN, MIN_SEGMENT_LEN};
use crate::ssh::error::{ManagerError, Result};

/// 解析后的分组路径
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupPath {
    pub segments: Vec<String>,
    pub depth: usize,
    /// 最后一段
    pub name: String,
    /// 父路径，顶层分组为 None
    pub parent: Option<String>,
}

impl GroupPath {
    /// 规范化后的路径字符串
    pub fn as_path(&self) -> String {
        self.segments.join("/")
    }
}

/// 解析分组路径
///
/// 去掉首尾和重复的分隔符；去掉分隔符后为空则返回 InvalidPath。
/// 这里只做结构解析，不检查字符集（见 `is_valid_path`）。
pub fn parse(path: &str) -> Result<GroupPath> {
    let segments: Vec<String> = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let Some(name) = segments.last().cloned() else {
        return Err(ManagerError::InvalidPath(format!(
            "'{}' is empty after normalization",
            path
        )));
    };

    let depth = segments.len();
    let parent = (depth > 1).then(|| segments[..depth - 1].join("/"));

    Ok(GroupPath {
        segments,
        depth,
        name,
        parent,
    })
}

/// 规范化路径字符串
pub fn normalize(path: &str) -> Result<String> {
    parse(path).map(|p| p.as_path())
}

/// 单个路径段是否合法
pub fn is_valid_segment(segment: &str) -> bool {
    let len = segment.chars().count();
    if !(MIN_SEGMENT_LEN..=MAX_SEGMENT_LEN).contains(&len) {
        return false;
    }
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 路径是否合法，从不返回错误
pub fn is_valid_path(path: &str) -> bool {
    match parse(path) {
        Ok(parsed) => {
            parsed.depth <= MAX_DEPTH && parsed.segments.iter().all(|s| is_valid_segment(s))
        }
        Err(_) => false,
    }
}

/// 所有严格前缀路径，从根到叶
///
/// `a1/b1/c1` -> `["a1", "a1/b1"]`
pub fn get_parent_paths(path: &str) -> Result<Vec<String>> {
    let parsed = parse(path)?;
    Ok((1..parsed.depth)
        .map(|i| parsed.segments[..i].join("/"))
        .collect())
}

/// `child` 是否位于 `ancestor` 之下（不含自身）
pub fn is_descendant(child: &str, ancestor: &str) -> bool {
    child.len() > ancestor.len()
        && child.starts_with(ancestor)
        && child.as_bytes()[ancestor.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_separators() {
        let parsed = parse("/work//clients/acme/").unwrap();
        assert_eq!(parsed.segments, vec!["work", "clients", "acme"]);
        assert_eq!(parsed.depth, 3);
        assert_eq!(parsed.name, "acme");
        assert_eq!(parsed.parent.as_deref(), Some("work/clients"));
        assert_eq!(parsed.as_path(), "work/clients/acme");
    }

    #[test]
    fn test_parse_top_level_has_no_parent() {
        let parsed = parse("work").unwrap();
        assert_eq!(parsed.depth, 1);
        assert_eq!(parsed.parent, None);
    }

    #[test]
    fn test_parse_empty_fails() {
        assert!(matches!(parse(""), Err(ManagerError::InvalidPath(_))));
        assert!(matches!(parse("///"), Err(ManagerError::InvalidPath(_))));
    }

    #[test]
    fn test_is_valid_path() {
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("a"));
        assert!(!is_valid_path("A/b!"));
        assert!(!is_valid_path("-work"));
        assert!(!is_valid_path(&"x".repeat(51)));
        let eleven = vec!["ab"; 11].join("/");
        assert!(!is_valid_path(&eleven));
        let ten = vec!["ab"; 10].join("/");
        assert!(is_valid_path(&ten));

        assert!(is_valid_path("work"));
        assert!(is_valid_path("work/clients/acme-1"));
        assert!(is_valid_path("Work_2/Clients"));
    }

    #[test]
    fn test_get_parent_paths() {
        assert_eq!(
            get_parent_paths("work/clients/acme").unwrap(),
            vec!["work".to_string(), "work/clients".to_string()]
        );
        assert!(get_parent_paths("work").unwrap().is_empty());
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("work/clients", "work"));
        assert!(!is_descendant("work", "work"));
        assert!(!is_descendant("workshop", "work"));
    }
}
