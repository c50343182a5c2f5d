// 本地数据持久化服务
// 连接片段、分组目录、分组图标与自定义模板

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::constants::layout::{
    FRAGMENT_EXT, GROUP_ICONS_FILE, STAGED_SUFFIX, TEMPLATES_DIR,
};
use crate::models::ManagerSettings;
use crate::services::group_path;
use crate::ssh::error::{ManagerError, Result};

// ======================== 应用设置 ========================

/// 获取应用设置目录
/// Linux: ~/.config/ssh-manager
pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Cannot resolve system config directory")?
        .join("ssh-manager");
    Ok(config_dir)
}

/// 获取设置文件路径
pub fn get_settings_file() -> anyhow::Result<PathBuf> {
    Ok(get_config_dir()?.join("settings.json"))
}

/// 加载设置，文件不存在时使用默认值
pub fn load_settings() -> anyhow::Result<ManagerSettings> {
    let path = get_settings_file()?;
    if !path.exists() {
        return Ok(ManagerSettings::from_home());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let settings: ManagerSettings =
        serde_json::from_str(&content).context("Failed to parse settings file")?;
    Ok(settings)
}

// ======================== 文件写入 ========================

/// 原子写入：先写同目录临时文件再重命名，保留原文件权限
pub async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ManagerError::Validation(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp, content).await?;
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if let Err(e) = tokio::fs::set_permissions(&tmp, meta.permissions()).await {
            warn!("[Store] Failed to copy permissions to {}: {}", tmp.display(), e);
        }
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn exists(path: &Path) -> Result<bool> {
    Ok(tokio::fs::try_exists(path).await?)
}

/// 在阻塞线程池中执行目录遍历
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ManagerError::Io(std::io::Error::other(e)))?
}

// ======================== ConfigStore ========================

/// 片段文件条目
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentEntry {
    pub group: String,
    pub name: String,
    pub path: PathBuf,
}

/// 片段与分组目录仓库，不涉及 SSH 语义
#[derive(Clone, Debug)]
pub struct ConfigStore {
    settings: ManagerSettings,
}

impl ConfigStore {
    pub fn new(settings: ManagerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// 分组目录的相对路径（拒绝 `.` 和 `..`）
    fn relative_group(group: &str) -> Result<PathBuf> {
        let parsed = group_path::parse(group)?;
        if parsed.segments.iter().any(|s| s == "." || s == "..") {
            return Err(ManagerError::InvalidPath(format!(
                "'{}' contains a relative segment",
                group
            )));
        }
        Ok(parsed.segments.iter().collect())
    }

    /// `config/<group>`
    pub fn group_dir(&self, group: &str) -> Result<PathBuf> {
        Ok(self.settings.config_dir().join(Self::relative_group(group)?))
    }

    /// `keys/<group>`
    pub fn keys_dir(&self, group: &str) -> Result<PathBuf> {
        Ok(self.settings.keys_dir().join(Self::relative_group(group)?))
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name.starts_with('.') || name.contains(|c: char| c == '/' || c == '\\') {
            return Err(ManagerError::Validation(format!(
                "'{}' is not a usable fragment name",
                name
            )));
        }
        Ok(())
    }

    /// `config/<group>/<name>.conf`
    pub fn fragment_path(&self, group: &str, name: &str) -> Result<PathBuf> {
        Self::check_name(name)?;
        Ok(self
            .group_dir(group)?
            .join(format!("{}.{}", name, FRAGMENT_EXT)))
    }

    /// `config/<group>/.<name>.conf.staged`
    pub fn staged_path(&self, group: &str, name: &str) -> Result<PathBuf> {
        Self::check_name(name)?;
        Ok(self
            .group_dir(group)?
            .join(format!(".{}.{}", name, STAGED_SUFFIX)))
    }

    /// 创建目录结构和默认分组，可重复调用
    ///
    /// 返回根目录此前是否不存在。
    pub async fn ensure_layout(&self) -> Result<bool> {
        let created = !exists(&self.settings.root_dir).await?;
        for dir in [
            self.settings.config_dir(),
            self.settings.keys_dir(),
            self.settings.templates_dir(),
            self.settings.config_backups_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        if created {
            for group in &self.settings.default_groups {
                self.create_group(group).await?;
            }
            info!(
                "[Store] Initialized layout at {}",
                self.settings.root_dir.display()
            );
        }
        if let Some(ssh_dir) = self.settings.ssh_config_path.parent() {
            tokio::fs::create_dir_all(ssh_dir).await?;
        }
        Ok(created)
    }

    /// 写入片段（覆盖），自动创建父目录
    pub async fn write_fragment(&self, group: &str, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.fragment_path(group, name)?;
        write_atomic(&path, text).await?;
        debug!("[Store] Wrote fragment {}", path.display());
        Ok(path)
    }

    /// 读取片段，不存在返回 None
    pub async fn read_fragment(&self, group: &str, name: &str) -> Result<Option<String>> {
        let path = self.fragment_path(group, name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 删除片段，不存在返回 false
    pub async fn remove_fragment(&self, group: &str, name: &str) -> Result<bool> {
        let path = self.fragment_path(group, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("[Store] Removed fragment {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 移动片段，内容按字节保留；目标已存在返回 Conflict
    pub async fn move_fragment(
        &self,
        from_group: &str,
        name: &str,
        to_group: &str,
        new_name: &str,
    ) -> Result<PathBuf> {
        let from = self.fragment_path(from_group, name)?;
        let to = self.fragment_path(to_group, new_name)?;
        if !exists(&from).await? {
            return Err(ManagerError::NotFound(format!(
                "connection '{}' in group '{}'",
                name, from_group
            )));
        }
        if exists(&to).await? {
            return Err(ManagerError::Conflict(format!(
                "connection '{}' already exists in group '{}'",
                new_name, to_group
            )));
        }
        self.create_group(to_group).await?;
        tokio::fs::rename(&from, &to).await?;
        Ok(to)
    }

    /// 递归列出所有分组目录（一次遍历），按字典序
    pub async fn list_groups(&self) -> Result<Vec<String>> {
        let root = self.settings.config_dir();
        blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut groups = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| ManagerError::Io(std::io::Error::other(e)))?;
                if entry.file_type().is_dir() {
                    groups.push(relative_slash_path(&root, entry.path()));
                }
            }
            groups.sort();
            Ok(groups)
        })
        .await
    }

    /// 列出片段；指定分组时包含其所有子分组
    pub async fn list_fragments(&self, group_filter: Option<&str>) -> Result<Vec<FragmentEntry>> {
        let filter = group_filter.map(group_path::normalize).transpose()?;
        let root = self.settings.config_dir();
        blocking(move || {
            let walk_root = match &filter {
                Some(g) => root.join(g),
                None => root.clone(),
            };
            if !walk_root.exists() {
                return Ok(Vec::new());
            }
            let mut fragments = Vec::new();
            for entry in WalkDir::new(&walk_root).min_depth(1) {
                let entry = entry.map_err(|e| ManagerError::Io(std::io::Error::other(e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let Some(name) = fragment_stem(path) else {
                    continue;
                };
                let Some(parent) = path.parent() else {
                    continue;
                };
                if parent == root {
                    continue;
                }
                fragments.push(FragmentEntry {
                    group: relative_slash_path(&root, parent),
                    name,
                    path: path.to_path_buf(),
                });
            }
            fragments.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
            Ok(fragments)
        })
        .await
    }

    pub async fn group_exists(&self, group: &str) -> Result<bool> {
        let dir = self.group_dir(group)?;
        Ok(tokio::fs::metadata(&dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    /// 创建分组（config 与 keys 两棵目录），已存在时静默成功
    pub async fn create_group(&self, path: &str) -> Result<()> {
        if !group_path::is_valid_path(path) {
            return Err(ManagerError::InvalidPath(path.to_string()));
        }
        let config_dir = self.group_dir(path)?;
        let keys_dir = self.keys_dir(path)?;
        tokio::fs::create_dir_all(&config_dir).await?;
        tokio::fs::create_dir_all(&keys_dir).await?;
        restrict_permissions(&keys_dir).await;
        debug!("[Store] Ensured group {}", path);
        Ok(())
    }

    /// 重命名分组，同时移动 keys 目录
    pub async fn rename_group(&self, old: &str, new: &str) -> Result<()> {
        let old_norm = group_path::normalize(old)?;
        let new_norm = group_path::normalize(new)?;
        if !group_path::is_valid_path(&new_norm) {
            return Err(ManagerError::InvalidPath(new.to_string()));
        }
        if group_path::is_descendant(&new_norm, &old_norm) {
            return Err(ManagerError::Validation(format!(
                "cannot move group '{}' into its own subgroup '{}'",
                old_norm, new_norm
            )));
        }

        let old_config = self.group_dir(&old_norm)?;
        let new_config = self.group_dir(&new_norm)?;
        let old_keys = self.keys_dir(&old_norm)?;
        let new_keys = self.keys_dir(&new_norm)?;

        if !self.group_exists(&old_norm).await? {
            return Err(ManagerError::NotFound(format!("group '{}'", old_norm)));
        }
        if exists(&new_config).await? {
            return Err(ManagerError::Conflict(format!(
                "group '{}' already exists",
                new_norm
            )));
        }
        let old_keys_exist = exists(&old_keys).await?;
        if exists(&new_keys).await? {
            if old_keys_exist && dir_has_files(new_keys.clone()).await? {
                return Err(ManagerError::Conflict(format!(
                    "keys directory for '{}' already exists",
                    new_norm
                )));
            }
            if old_keys_exist {
                tokio::fs::remove_dir_all(&new_keys).await?;
            }
        }

        if let Some(parent) = new_config.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old_config, &new_config).await?;

        if old_keys_exist {
            if let Some(parent) = new_keys.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&old_keys, &new_keys).await?;
        } else {
            tokio::fs::create_dir_all(&new_keys).await?;
            restrict_permissions(&new_keys).await;
        }

        info!("[Store] Renamed group {} -> {}", old_norm, new_norm);
        Ok(())
    }

    /// 删除分组；仍有 .conf 文件时返回 NonEmpty
    pub async fn delete_group(&self, path: &str) -> Result<()> {
        let norm = group_path::normalize(path)?;
        if !self.group_exists(&norm).await? {
            return Err(ManagerError::NotFound(format!("group '{}'", norm)));
        }
        let count = self.list_fragments(Some(&norm)).await?.len();
        if count > 0 {
            return Err(ManagerError::NonEmpty { group: norm, count });
        }

        tokio::fs::remove_dir_all(self.group_dir(&norm)?).await?;

        let keys = self.keys_dir(&norm)?;
        if exists(&keys).await? {
            if dir_has_files(keys.clone()).await? {
                warn!(
                    "[Store] Keeping non-empty keys directory {}",
                    keys.display()
                );
            } else {
                tokio::fs::remove_dir_all(&keys).await?;
            }
        }
        info!("[Store] Deleted group {}", norm);
        Ok(())
    }

    // ======================== 分组图标 ========================

    fn group_icons_file(&self) -> PathBuf {
        self.settings.root_dir.join(GROUP_ICONS_FILE)
    }

    pub async fn load_group_icons(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(self.group_icons_file()).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_group_icons(&self, icons: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_string_pretty(icons)?;
        write_atomic(&self.group_icons_file(), &content).await
    }

    // ======================== 自定义模板 ========================

    fn template_path(&self, id: &str) -> Result<PathBuf> {
        Self::check_name(id)?;
        Ok(self
            .settings
            .root_dir
            .join(TEMPLATES_DIR)
            .join(format!("{}.{}", id, FRAGMENT_EXT)))
    }

    pub async fn read_custom_template(&self, id: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.template_path(id)?).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 所有自定义模板 (id, 内容)，按 id 排序
    pub async fn list_custom_templates(&self) -> Result<Vec<(String, String)>> {
        let dir = self.settings.templates_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut templates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(id) = fragment_stem(&path) {
                let content = tokio::fs::read_to_string(&path).await?;
                templates.push((id, content));
            }
        }
        templates.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(templates)
    }

    pub async fn write_custom_template(&self, id: &str, content: &str) -> Result<()> {
        write_atomic(&self.template_path(id)?, content).await
    }

    pub async fn remove_custom_template(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.template_path(id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// `<name>.conf` 的 name；隐藏文件与暂存文件返回 None
fn fragment_stem(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') {
        return None;
    }
    let stem = file_name.strip_suffix(&format!(".{}", FRAGMENT_EXT))?;
    (!stem.is_empty()).then(|| stem.to_string())
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

async fn dir_has_files(dir: PathBuf) -> Result<bool> {
    blocking(move || {
        Ok(WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.file_type().is_file()))
    })
    .await
}

#[cfg(unix)]
async fn restrict_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await {
        warn!("[Store] Failed to restrict {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_dir: &Path) {}
