// 主配置协调器
//
// 负责 ~/.ssh/config 中唯一的受管 Include 行、已有 Host 的发现与迁移注释。
// 每次操作都从磁盘重新读取，所有读写都在同一把互斥锁内完成。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{groups, markers};
use crate::models::{Connection, ListingProblem, ManagerSettings};
use crate::services::storage::write_atomic;
use crate::ssh::config::{self, tokenize_line, HostBlock, ParsedFragment};
use crate::ssh::error::{ManagerError, Result};

const BACKUP_PREFIX: &str = "ssh-config-";
const BACKUP_EXT: &str = ".bak";

/// 主配置中发现的非受管条目（每个别名一条）
#[derive(Clone, Debug)]
pub struct ExistingEntry {
    pub alias: String,
    /// 同一 Host 行上的全部模式
    pub patterns: Vec<String>,
    pub fragment: ParsedFragment,
}

impl ExistingEntry {
    pub fn to_connection(&self) -> Connection {
        let f = &self.fragment;
        Connection {
            name: self.alias.clone(),
            group: groups::EXISTING.to_string(),
            host: f.host.clone(),
            user: f.user.clone(),
            port: f.port,
            key_file: f.key_file.clone(),
            jump_host: f.jump_host.clone(),
            local_forwards: f.local_forwards.clone(),
            remote_forwards: f.remote_forwards.clone(),
            dynamic_forward: f.dynamic_forward,
            advanced: f.advanced.clone(),
            icon: f.icon.clone(),
            template: config::detect_template(f).to_string(),
            managed: false,
            editable: false,
        }
    }
}

/// 主配置扫描结果
#[derive(Clone, Debug, Default)]
pub struct ExistingScan {
    pub entries: Vec<ExistingEntry>,
    /// 字段无法还原而被跳过的 Host 块
    pub problems: Vec<ListingProblem>,
}

/// discover_existing() 的结果
#[derive(Clone, Debug, Default)]
pub struct DiscoveredConnections {
    pub connections: Vec<Connection>,
    pub problems: Vec<ListingProblem>,
}

/// 集成状态
#[derive(Clone, Debug, Serialize)]
pub struct IntegrationState {
    pub integrated: bool,
    pub main_config_exists: bool,
    pub include_line: Option<String>,
    pub backup_count: usize,
    pub pending_migrations: usize,
}

/// 主配置备份文件
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MainConfigBackup {
    pub file_name: String,
    pub path: PathBuf,
}

// ======================== 纯文本变换 ========================

/// 行尾（保留原文件的换行风格）
fn line_ending(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

/// 行中是否出现管理目录本身（其后只能是分隔符、引号、空白或行尾）
fn mentions_root(line: &str, root_marker: &str) -> bool {
    let line = line.replace('\\', "/");
    let marker = root_marker.replace('\\', "/");
    let marker = marker.trim_end_matches('/');
    if marker.is_empty() {
        return false;
    }
    line.match_indices(marker).any(|(idx, m)| {
        line[idx + m.len()..]
            .chars()
            .next()
            .map_or(true, |c| c == '/' || c == '"' || c.is_whitespace())
    })
}

/// 是否为指向管理目录的 Include 行
fn is_managed_include(line: &str, root_marker: &str) -> bool {
    matches!(
        tokenize_line(line),
        Ok(Some((keyword, _))) if keyword.eq_ignore_ascii_case("Include")
    ) && mentions_root(line, root_marker)
}

/// 写入或替换受管 Include 行
///
/// 找到第一条指向管理目录的 Include 行时整行替换；否则在文件开头插入规范行和一个空行。
pub fn apply_include(content: &str, canonical: &str, root_marker: &str) -> String {
    let mut lines: Vec<&str> = content.split_inclusive('\n').collect();
    if let Some(idx) = lines
        .iter()
        .position(|l| is_managed_include(l, root_marker))
    {
        let replaced = format!("{}{}", canonical, line_ending(lines[idx]));
        let mut out = String::with_capacity(content.len() + canonical.len());
        for (i, line) in lines.drain(..).enumerate() {
            if i == idx {
                out.push_str(&replaced);
            } else {
                out.push_str(line);
            }
        }
        return out;
    }

    if content.is_empty() {
        format!("{}\n", canonical)
    } else {
        format!("{}\n\n{}", canonical, content)
    }
}

/// 去掉受管 Include 行以及紧随其后的空行；没有受管行时返回 None
pub fn strip_include(content: &str, root_marker: &str) -> Option<String> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let idx = lines
        .iter()
        .position(|l| is_managed_include(l, root_marker))?;
    let skip_blank = lines
        .get(idx + 1)
        .is_some_and(|next| next.trim().is_empty());

    let out = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx && !(skip_blank && *i == idx + 1))
        .map(|(_, l)| *l)
        .collect();
    Some(out)
}

/// 把主配置中的 Host 块拆成别名条目（跳过通配和否定模式）
///
/// 只有分词失败时返回错误；单个块的字段无法还原时跳过该块并记入 problems。
pub fn scan_existing(content: &str, source_ref: &str) -> Result<ExistingScan> {
    let parsed = config::parse_config(content, source_ref)?;
    let lines: Vec<&str> = content.lines().collect();
    let mut scan = ExistingScan::default();

    for block in &parsed.hosts {
        let aliases: Vec<&String> = block
            .patterns
            .iter()
            .filter(|p| !HostBlock::is_wildcard(p))
            .collect();
        if aliases.is_empty() {
            continue;
        }

        let block_text = lines[block.start_line..block.end_line.min(lines.len())].join("\n");
        let fragment = match config::parse_fragment(&block_text, source_ref) {
            Ok(fragment) => fragment,
            Err(e) => {
                let e = match e {
                    ManagerError::Parse {
                        source_ref,
                        line,
                        message,
                    } => ManagerError::Parse {
                        source_ref,
                        line: line + block.start_line,
                        message,
                    },
                    other => other,
                };
                warn!("[MainConfig] Skipping Host {}: {}", block.patterns.join(" "), e);
                scan.problems.push(ListingProblem {
                    group: groups::EXISTING.to_string(),
                    name: aliases
                        .iter()
                        .map(|a| a.as_str())
                        .collect::<Vec<_>>()
                        .join(" "),
                    message: e.to_string(),
                });
                continue;
            }
        };

        for pattern in aliases {
            // 同名 Host 以第一次出现为准（与 ssh 的首个匹配生效一致）
            if scan.entries.iter().any(|e| e.alias == *pattern) {
                continue;
            }
            let mut fragment = fragment.clone();
            fragment.name = pattern.clone();
            if fragment.host == crate::constants::defaults::HOST {
                fragment.host = pattern.clone();
            }
            scan.entries.push(ExistingEntry {
                alias: pattern.clone(),
                patterns: block.patterns.clone(),
                fragment,
            });
        }
    }
    Ok(scan)
}

/// 注释掉单别名 Host 块的所有非空行；块不存在时返回 None
pub fn comment_out_block(content: &str, name: &str, source_ref: &str) -> Result<Option<String>> {
    let parsed = config::parse_config(content, source_ref)?;
    let Some(block) = parsed
        .hosts
        .iter()
        .find(|h| h.patterns.iter().any(|p| p == name))
    else {
        return Ok(None);
    };
    if block.patterns.len() > 1 {
        return Err(ManagerError::Validation(format!(
            "Host line for '{}' also declares {}; split it before migrating",
            name,
            block
                .patterns
                .iter()
                .filter(|p| *p != name)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let mut out = String::with_capacity(content.len() + 64);
    for (i, line) in content.split_inclusive('\n').enumerate() {
        let ending = line_ending(line);
        let body = &line[..line.len() - ending.len()];
        if (block.start_line..block.end_line).contains(&i) && !body.trim().is_empty() {
            out.push_str(&format!("# {} {}{}", body, markers::MIGRATED, ending));
        } else {
            out.push_str(line);
        }
    }
    Ok(Some(out))
}

// ======================== 协调器 ========================

/// 主配置协调器
#[derive(Clone, Debug)]
pub struct MainConfigReconciler {
    settings: ManagerSettings,
    lock: Arc<Mutex<()>>,
}

impl MainConfigReconciler {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.settings.ssh_config_path
    }

    fn source_ref(&self) -> String {
        self.settings.ssh_config_path.display().to_string()
    }

    /// Include 行用来识别受管行的标记（与规范行一样统一为 `/` 分隔）
    fn root_marker(&self) -> String {
        self.settings.root_dir.to_string_lossy().replace('\\', "/")
    }

    /// 规范 Include 行：每个分组深度一个 glob
    pub fn canonical_include_line(&self, depth: usize) -> String {
        let config_dir = self.settings.config_dir().to_string_lossy().replace('\\', "/");
        let globs: Vec<String> = (1..=depth.max(1))
            .map(|d| {
                config::quote_value(&format!("{}/{}*.conf", config_dir, "*/".repeat(d)))
            })
            .collect();
        format!("Include {}", globs.join(" "))
    }

    async fn read_unlocked(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path()).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 读取主配置（不存在时返回 None）
    pub async fn read(&self) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    async fn backup_unlocked(&self, content: &str) -> Result<PathBuf> {
        let dir = self.settings.config_backups_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S-%6f").to_string();
        let mut path = dir.join(format!("{}{}{}", BACKUP_PREFIX, stamp, BACKUP_EXT));
        let mut n = 1;
        while tokio::fs::try_exists(&path).await? {
            path = dir.join(format!("{}{}_{}{}", BACKUP_PREFIX, stamp, n, BACKUP_EXT));
            n += 1;
        }
        tokio::fs::write(&path, content).await?;
        debug!("[MainConfig] Backed up to {}", path.display());
        Ok(path)
    }

    /// 写入前先备份旧内容
    async fn write_unlocked(&self, previous: Option<&str>, content: &str) -> Result<()> {
        if let Some(previous) = previous {
            self.backup_unlocked(previous).await?;
        }
        write_atomic(self.path(), content).await?;

        #[cfg(unix)]
        if previous.is_none() {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(self.path(), std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        Ok(())
    }

    /// 确保受管 Include 行存在且为规范形式；返回文件是否改动
    pub async fn ensure_include(&self, depth: usize) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let canonical = self.canonical_include_line(depth);
        let current = self.read_unlocked().await?;
        let next = apply_include(current.as_deref().unwrap_or(""), &canonical, &self.root_marker());
        if current.as_deref() == Some(next.as_str()) {
            return Ok(false);
        }
        self.write_unlocked(current.as_deref(), &next).await?;
        info!("[MainConfig] Include line updated: {}", canonical);
        Ok(true)
    }

    /// 移除受管 Include 行；返回是否改动
    pub async fn remove_include(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let Some(current) = self.read_unlocked().await? else {
            return Ok(false);
        };
        let Some(next) = strip_include(&current, &self.root_marker()) else {
            return Ok(false);
        };
        self.write_unlocked(Some(&current), &next).await?;
        info!("[MainConfig] Include line removed");
        Ok(true)
    }

    /// 当前的受管 Include 行
    pub async fn include_line(&self) -> Result<Option<String>> {
        let marker = self.root_marker();
        Ok(self.read().await?.and_then(|content| {
            content
                .lines()
                .find(|l| is_managed_include(l, &marker))
                .map(|l| l.trim().to_string())
        }))
    }

    /// 发现主配置中的非受管 Host（排除任意分组中已存在的名称）
    pub async fn discover_existing(
        &self,
        managed_names: &HashSet<String>,
    ) -> Result<DiscoveredConnections> {
        let Some(content) = self.read().await? else {
            return Ok(DiscoveredConnections::default());
        };
        let scan = scan_existing(&content, &self.source_ref())?;
        Ok(DiscoveredConnections {
            connections: scan
                .entries
                .iter()
                .filter(|e| !managed_names.contains(&e.alias))
                .map(ExistingEntry::to_connection)
                .collect(),
            problems: scan
                .problems
                .into_iter()
                .filter(|p| !p.name.split(' ').all(|alias| managed_names.contains(alias)))
                .collect(),
        })
    }

    /// 按别名查找非受管条目
    pub async fn find_existing(&self, name: &str) -> Result<Option<ExistingEntry>> {
        let Some(content) = self.read().await? else {
            return Ok(None);
        };
        Ok(scan_existing(&content, &self.source_ref())?
            .entries
            .into_iter()
            .find(|e| e.alias == name))
    }

    /// 注释掉已迁移的 Host 块；块已不存在时返回 false
    pub async fn comment_out_host(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let Some(current) = self.read_unlocked().await? else {
            return Ok(false);
        };
        let Some(next) = comment_out_block(&current, name, &self.source_ref())? else {
            return Ok(false);
        };
        self.write_unlocked(Some(&current), &next).await?;
        info!("[MainConfig] Commented out Host {}", name);
        Ok(true)
    }

    /// 主配置备份列表（新的在前）
    pub async fn list_backups(&self) -> Result<Vec<MainConfigBackup>> {
        let dir = self.settings.config_backups_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(BACKUP_PREFIX) && file_name.ends_with(BACKUP_EXT) {
                backups.push(MainConfigBackup {
                    file_name,
                    path: entry.path(),
                });
            }
        }
        backups.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(backups)
    }

    /// 用备份覆盖主配置（当前内容先备份）
    pub async fn restore_backup(&self, file_name: &str) -> Result<()> {
        if !file_name.starts_with(BACKUP_PREFIX)
            || !file_name.ends_with(BACKUP_EXT)
            || file_name.contains(|c: char| c == '/' || c == '\\')
        {
            return Err(ManagerError::Validation(format!(
                "'{}' is not a main config backup",
                file_name
            )));
        }
        let path = self.settings.config_backups_dir().join(file_name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManagerError::NotFound(format!("backup {}", file_name)))
            }
            Err(e) => return Err(e.into()),
        };

        let _guard = self.lock.lock().await;
        let current = self.read_unlocked().await?;
        self.write_unlocked(current.as_deref(), &content).await?;
        warn!("[MainConfig] Restored main config from {}", file_name);
        Ok(())
    }

    pub async fn integration_state(&self, pending_migrations: usize) -> Result<IntegrationState> {
        let content = self.read().await?;
        let marker = self.root_marker();
        let include_line = content.as_deref().and_then(|c| {
            c.lines()
                .find(|l| is_managed_include(l, &marker))
                .map(|l| l.trim().to_string())
        });
        Ok(IntegrationState {
            integrated: include_line.is_some(),
            main_config_exists: content.is_some(),
            include_line,
            backup_count: self.list_backups().await?.len(),
            pending_migrations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MARKER: &str = "/home/u/ssh_manager";
    const CANONICAL: &str = "Include /home/u/ssh_manager/config/*/*.conf";

    fn create_test_reconciler() -> (MainConfigReconciler, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let settings = ManagerSettings::with_root(temp_dir.path());
        (MainConfigReconciler::new(settings), temp_dir)
    }

    #[test]
    fn test_apply_include_prepends_and_preserves() {
        let content = "Host a\n    HostName 1.1.1.1\n";
        let out = apply_include(content, CANONICAL, MARKER);
        assert_eq!(out, format!("{}\n\n{}", CANONICAL, content));
        assert_eq!(apply_include(&out, CANONICAL, MARKER), out);
    }

    #[test]
    fn test_apply_include_replaces_hand_edited_line() {
        let content = "# mine\ninclude /home/u/ssh_manager/config/*.conf\r\nHost a\n";
        let out = apply_include(content, CANONICAL, MARKER);
        assert_eq!(out, format!("# mine\n{}\r\nHost a\n", CANONICAL));
    }

    #[test]
    fn test_foreign_include_untouched() {
        let content = "Include ~/.ssh/other/*\n";
        let out = apply_include(content, CANONICAL, MARKER);
        assert!(out.ends_with("\n\nInclude ~/.ssh/other/*\n"));
    }

    #[test]
    fn test_include_with_longer_root_is_foreign() {
        let content = "Include /home/u/ssh_manager_old/*\n";
        let out = apply_include(content, CANONICAL, MARKER);
        assert_eq!(out, format!("{}\n\n{}", CANONICAL, content));
        assert!(strip_include(content, MARKER).is_none());

        let quoted = "Include \"/home/u/ssh_manager\"\n";
        assert_eq!(apply_include(quoted, CANONICAL, MARKER), format!("{}\n", CANONICAL));
    }

    #[test]
    fn test_apply_include_backslash_root() {
        let marker = "C:\\Users\\u\\ssh_manager";
        let canonical = "Include C:/Users/u/ssh_manager/config/*/*.conf";
        let once = apply_include("Host a\n", canonical, marker);
        assert_eq!(apply_include(&once, canonical, marker), once);

        let hand_written = "Include C:\\Users\\u\\ssh_manager\\config\\*\\*.conf\nHost a\n";
        assert_eq!(
            apply_include(hand_written, canonical, marker),
            format!("{}\nHost a\n", canonical)
        );
    }

    #[test]
    fn test_strip_include_reverts_prepend() {
        let content = "Host a\n    User x\n";
        let applied = apply_include(content, CANONICAL, MARKER);
        assert_eq!(strip_include(&applied, MARKER).unwrap(), content);
        assert!(strip_include(content, MARKER).is_none());
    }

    #[test]
    fn test_scan_existing() {
        let content = "Host *\n    ServerAliveInterval 30\n\nHost legacy-box old\n    HostName 1.2.3.4\n    User root\n\nHost bare\n    Port 2222\n\nMatch host x\n    User nobody\n";
        let entries = scan_existing(content, "config").unwrap().entries;
        let names: Vec<&str> = entries.iter().map(|e| e.alias.as_str()).collect();
        assert_eq!(names, vec!["legacy-box", "old", "bare"]);
        assert_eq!(entries[0].fragment.host, "1.2.3.4");
        assert_eq!(entries[0].fragment.user, "root");
        assert_eq!(entries[2].fragment.host, "bare");
        assert_eq!(entries[2].fragment.port, 2222);
    }

    #[test]
    fn test_scan_existing_skips_block_with_bad_port() {
        let content = "# top\nHost other\n    Port ssh\nHost good\n    HostName 1.1.1.1\nHost *\n    Port nope\n";
        let scan = scan_existing(content, "config").unwrap();
        let names: Vec<&str> = scan.entries.iter().map(|e| e.alias.as_str()).collect();
        assert_eq!(names, vec!["good"]);
        assert_eq!(scan.entries[0].fragment.host, "1.1.1.1");

        // 通配块不产生条目，也不报告
        assert_eq!(scan.problems.len(), 1);
        assert_eq!(scan.problems[0].group, "existing");
        assert_eq!(scan.problems[0].name, "other");
        assert!(scan.problems[0].message.contains("line 3"));
        assert!(scan.problems[0].message.contains("invalid port 'ssh'"));

        // 分词失败仍然是整体错误
        assert!(matches!(
            scan_existing("Host a\n    User \"open\n", "config"),
            Err(ManagerError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_comment_out_block() {
        let content = "Host keep\n    User a\n\nHost legacy-box\n    HostName 1.2.3.4\n\n    User root\n# trailing\n";
        let out = comment_out_block(content, "legacy-box", "config")
            .unwrap()
            .unwrap();
        assert_eq!(
            out,
            "Host keep\n    User a\n\n# Host legacy-box # Migrated to SSH Manager\n#     HostName 1.2.3.4 # Migrated to SSH Manager\n\n#     User root # Migrated to SSH Manager\n# trailing\n"
        );
        assert!(comment_out_block(&out, "legacy-box", "config")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_comment_out_refuses_shared_host_line() {
        let err = comment_out_block("Host a b\n    User x\n", "a", "config").unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));
    }

    #[test]
    fn test_canonical_include_depths() {
        let (reconciler, temp) = create_test_reconciler();
        let root = temp.path().join("ssh_manager").join("config");
        let root = root.to_string_lossy();
        assert_eq!(
            reconciler.canonical_include_line(0),
            format!("Include {}/*/*.conf", root)
        );
        assert_eq!(
            reconciler.canonical_include_line(2),
            format!("Include {}/*/*.conf {}/*/*/*.conf", root, root)
        );
    }

    #[tokio::test]
    async fn test_ensure_include_idempotent_with_backup() {
        let (reconciler, _temp) = create_test_reconciler();
        tokio::fs::write(reconciler.path(), "Host a\n    HostName 1.1.1.1\n")
            .await
            .unwrap();

        assert!(reconciler.ensure_include(1).await.unwrap());
        let first = reconciler.read().await.unwrap().unwrap();
        assert!(!reconciler.ensure_include(1).await.unwrap());
        let second = reconciler.read().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with("\n\nHost a\n    HostName 1.1.1.1\n"));

        let backups = reconciler.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);

        let state = reconciler.integration_state(0).await.unwrap();
        assert!(state.integrated);
        assert_eq!(state.backup_count, 1);
    }

    #[tokio::test]
    async fn test_ensure_include_idempotent_for_backslash_root() {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = ManagerSettings::with_root(temp_dir.path());
        settings.root_dir = PathBuf::from("C:\\Users\\u\\ssh_manager");
        let reconciler = MainConfigReconciler::new(settings);

        assert!(reconciler.ensure_include(1).await.unwrap());
        assert!(!reconciler.ensure_include(1).await.unwrap());
        let content = reconciler.read().await.unwrap().unwrap();
        assert_eq!(content, "Include C:/Users/u/ssh_manager/config/*/*.conf\n");
        assert!(reconciler.integration_state(0).await.unwrap().integrated);
    }

    #[tokio::test]
    async fn test_ensure_include_creates_missing_config() {
        let (reconciler, _temp) = create_test_reconciler();
        assert!(reconciler.ensure_include(1).await.unwrap());
        let content = reconciler.read().await.unwrap().unwrap();
        assert_eq!(content, format!("{}\n", reconciler.canonical_include_line(1)));
        assert!(reconciler.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_restore() {
        let (reconciler, _temp) = create_test_reconciler();
        let original = "Host a\n    User x\n";
        tokio::fs::write(reconciler.path(), original).await.unwrap();

        reconciler.ensure_include(1).await.unwrap();
        assert!(reconciler.remove_include().await.unwrap());
        assert_eq!(reconciler.read().await.unwrap().unwrap(), original);
        assert!(!reconciler.remove_include().await.unwrap());

        // 最新的备份是移除 Include 之前的内容
        let backups = reconciler.list_backups().await.unwrap();
        assert_eq!(backups.len(), 2);
        reconciler
            .restore_backup(&backups[0].file_name)
            .await
            .unwrap();
        assert!(reconciler
            .read()
            .await
            .unwrap()
            .unwrap()
            .starts_with("Include "));

        assert!(matches!(
            reconciler.restore_backup("../etc.bak").await,
            Err(ManagerError::Validation(_))
        ));
        assert!(matches!(
            reconciler.restore_backup("ssh-config-none.bak").await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_excludes_managed_names() {
        let (reconciler, _temp) = create_test_reconciler();
        tokio::fs::write(
            reconciler.path(),
            "Host legacy-box\n    HostName 1.2.3.4\n    User root\nHost db1\n    HostName 9.9.9.9\n",
        )
        .await
        .unwrap();

        let managed: HashSet<String> = ["db1".to_string()].into_iter().collect();
        let existing = reconciler
            .discover_existing(&managed)
            .await
            .unwrap()
            .connections;
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].name, "legacy-box");
        assert_eq!(existing[0].group, "existing");
        assert_eq!(existing[0].host, "1.2.3.4");
        assert!(!existing[0].managed);
        assert!(!existing[0].editable);
    }
}
