// SSH 配置管理器
// 对外操作入口：连接、分组、模板、迁移、校验与备份

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{defaults, groups};
use crate::models::{
    AdvancedSettings, BackupSummary, Connection, ConnectionListing, ConnectionOptions,
    ConnectionUpdate, GroupInfo, GroupNode, ListingProblem, ManagerSettings, PortForward,
    RemoteForward, RenderResult, SavedConnection, TemplateInfo,
};
use crate::services::backup;
use crate::services::group_path;
use crate::services::storage::{ConfigStore, FragmentEntry};
use crate::services::templates::{self, TemplateEngine};
use crate::ssh::config::{self, ParsedFragment};
use crate::ssh::error::{ManagerError, Result};
use crate::ssh::main_config::{IntegrationState, MainConfigBackup, MainConfigReconciler};
use crate::ssh::migration::Migrator;
use crate::ssh::probe::{ConfigCheck, ProbeOutcome, SshProbe};

static CONNECTION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("connection name regex"));

/// `ssh -G` 校验时使用的主机名
const INTEGRITY_PROBE_HOST: &str = "ssh-manager-integrity-check";

/// initialize() 的结果
#[derive(Clone, Debug, Serialize)]
pub struct InitReport {
    pub layout_created: bool,
    pub include_changed: bool,
    pub existing_connections: usize,
    pub resumed_migrations: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub severity: IssueSeverity,
    /// 片段 `group/name` 或主配置路径
    pub source: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    fn push(
        &mut self,
        severity: IssueSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.issues.push(IntegrityIssue {
            severity,
            source: source.into(),
            message: message.into(),
        });
    }
}

/// 渲染片段所需的全部字段
struct FragmentDraft {
    name: String,
    host: String,
    user: String,
    port: Option<u16>,
    key_file: Option<String>,
    jump_host: Option<String>,
    local_forwards: Vec<PortForward>,
    remote_forwards: Vec<RemoteForward>,
    dynamic_forward: Option<u16>,
    advanced: AdvancedSettings,
    icon: String,
    template: String,
    variables: BTreeMap<String, String>,
}

fn yes_no(value: bool) -> String {
    let word = if value { "yes" } else { "no" };
    word.to_string()
}

fn has_whitespace(value: &str) -> bool {
    value.chars().any(char::is_whitespace)
}

fn has_control(value: &str) -> bool {
    value.chars().any(char::is_control)
}

impl FragmentDraft {
    fn from_parsed(fragment: &ParsedFragment) -> Self {
        Self {
            name: fragment.name.clone(),
            host: fragment.host.clone(),
            user: fragment.user.clone(),
            port: Some(fragment.port),
            key_file: Some(fragment.key_file.clone()),
            jump_host: fragment.jump_host.clone(),
            local_forwards: fragment.local_forwards.clone(),
            remote_forwards: fragment.remote_forwards.clone(),
            dynamic_forward: fragment.dynamic_forward,
            advanced: fragment.advanced.clone(),
            icon: fragment.icon.clone(),
            template: fragment
                .template
                .clone()
                .unwrap_or_else(|| defaults::TEMPLATE.to_string()),
            variables: BTreeMap::new(),
        }
    }

    /// 写入前的字段校验
    fn validate(&self) -> Result<()> {
        if !CONNECTION_NAME.is_match(&self.name) {
            return Err(ManagerError::Validation(format!(
                "connection name '{}' must match [A-Za-z0-9][A-Za-z0-9._-]*",
                self.name
            )));
        }
        if self.host.trim().is_empty() || has_whitespace(&self.host) {
            return Err(ManagerError::Validation(format!(
                "host '{}' must be non-empty and contain no whitespace",
                self.host
            )));
        }
        if has_whitespace(&self.user) {
            return Err(ManagerError::Validation(format!(
                "user '{}' contains whitespace",
                self.user
            )));
        }
        if self.port == Some(0) {
            return Err(ManagerError::Validation("port must be 1-65535".to_string()));
        }
        if let Some(jump) = self.jump_host.as_deref() {
            if has_whitespace(jump) {
                return Err(ManagerError::Validation(format!(
                    "jump host '{}' contains whitespace",
                    jump
                )));
            }
        }
        let bad_host = |h: &str| h.is_empty() || has_whitespace(h);
        let bad_local = self
            .local_forwards
            .iter()
            .any(|f| f.local_port == 0 || f.remote_port == 0 || bad_host(&f.remote_host));
        let bad_remote = self
            .remote_forwards
            .iter()
            .any(|f| f.local_port == 0 || f.remote_port == 0 || bad_host(&f.local_host));
        if bad_local || bad_remote || self.dynamic_forward == Some(0) {
            return Err(ManagerError::Validation(
                "forward ports must be 1-65535 with a non-empty host".to_string(),
            ));
        }

        // 写进片段的其余自由文本不能换行
        let a = &self.advanced;
        let mut spliced: Vec<(&str, &str)> = vec![
            ("icon", self.icon.as_str()),
            ("template", self.template.as_str()),
        ];
        if let Some(key_file) = self.key_file.as_deref() {
            spliced.push(("key_file", key_file));
        }
        for (field, value) in [
            ("strict_host_key_checking", &a.strict_host_key_checking),
            ("control_master", &a.control_master),
            ("control_path", &a.control_path),
            ("control_persist", &a.control_persist),
        ] {
            if let Some(value) = value.as_deref() {
                spliced.push((field, value));
            }
        }
        for (key, value) in &self.variables {
            spliced.push((key.as_str(), value.as_str()));
        }
        if let Some((field, _)) = spliced.iter().find(|(_, value)| has_control(value)) {
            return Err(ManagerError::Validation(format!(
                "{} must not contain line breaks or control characters",
                field
            )));
        }
        Ok(())
    }

    fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.variables.clone();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set("name", self.name.clone());
        set("host", self.host.clone());
        set("user", self.user.clone());
        set(
            "user_line",
            if self.user.is_empty() {
                String::new()
            } else {
                format!("    User {}", self.user)
            },
        );
        if let Some(port) = self.port {
            set("port", port.to_string());
        }
        if let Some(key_file) = self.key_file.as_deref().filter(|k| !k.is_empty()) {
            set("key_file", config::quote_value(key_file));
        }
        if let Some(jump) = self.jump_host.as_deref().filter(|j| !j.is_empty()) {
            set("jump_host", jump.to_string());
        }
        set("local_forwards", templates::format_local_forwards(&self.local_forwards));
        set("remote_forwards", templates::format_remote_forwards(&self.remote_forwards));
        set("dynamic_forward", templates::format_dynamic_forward(self.dynamic_forward));

        let a = &self.advanced;
        if let Some(v) = a.server_alive_interval {
            set("server_alive_interval", v.to_string());
        }
        if let Some(v) = a.server_alive_count_max {
            set("server_alive_count_max", v.to_string());
        }
        if let Some(v) = a.connect_timeout {
            set("connect_timeout", v.to_string());
        }
        if let Some(v) = a.compression {
            set("compression", yes_no(v));
        }
        if let Some(v) = &a.strict_host_key_checking {
            set("strict_host_key_checking", v.clone());
        }
        if let Some(v) = &a.control_master {
            set("control_master", v.clone());
        }
        if let Some(v) = &a.control_path {
            set("control_path", config::quote_value(v));
        }
        if let Some(v) = &a.control_persist {
            set("control_persist", v.clone());
        }
        if let Some(v) = a.forward_x11 {
            set("forward_x11", yes_no(v));
        }
        if let Some(v) = a.forward_agent {
            set("forward_agent", yes_no(v));
        }
        vars
    }
}

fn managed_connection(group: &str, name: &str, fragment: ParsedFragment) -> Connection {
    let template = fragment
        .template
        .clone()
        .unwrap_or_else(|| config::detect_template(&fragment).to_string());
    Connection {
        name: name.to_string(),
        group: group.to_string(),
        host: fragment.host,
        user: fragment.user,
        port: fragment.port,
        key_file: fragment.key_file,
        jump_host: fragment.jump_host,
        local_forwards: fragment.local_forwards,
        remote_forwards: fragment.remote_forwards,
        dynamic_forward: fragment.dynamic_forward,
        advanced: fragment.advanced,
        icon: fragment.icon,
        template,
        managed: true,
        editable: true,
    }
}

/// 规范化分组并拒绝虚拟分组 existing
fn target_group(group: &str) -> Result<String> {
    let norm = group_path::normalize(group)?;
    if norm == groups::EXISTING || norm.starts_with(&format!("{}/", groups::EXISTING)) {
        return Err(ManagerError::InvalidTarget(format!(
            "'{}' is reserved for unmanaged connections",
            groups::EXISTING
        )));
    }
    if !group_path::is_valid_path(&norm) {
        return Err(ManagerError::InvalidPath(group.to_string()));
    }
    Ok(norm)
}

/// SSH 配置管理器
#[derive(Clone, Debug)]
pub struct SshManager {
    settings: ManagerSettings,
    store: ConfigStore,
    templates: TemplateEngine,
    main_config: MainConfigReconciler,
    migrator: Migrator,
    probe: SshProbe,
}

impl SshManager {
    pub fn new(settings: ManagerSettings) -> Self {
        let store = ConfigStore::new(settings.clone());
        let main_config = MainConfigReconciler::new(settings.clone());
        Self {
            templates: TemplateEngine::new(store.clone()),
            migrator: Migrator::new(store.clone(), main_config.clone()),
            probe: SshProbe::from_settings(&settings),
            settings,
            store,
            main_config,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn main_config(&self) -> &MainConfigReconciler {
        &self.main_config
    }

    /// 首次运行与每次启动：目录结构、未完成迁移、Include 行
    pub async fn initialize(&self) -> Result<InitReport> {
        let layout_created = self.store.ensure_layout().await?;
        let resumed_migrations = self.migrator.resume_all().await?;
        let include_changed = self.sync_include().await?;
        let existing_connections = self
            .main_config
            .discover_existing(&self.managed_names().await?)
            .await
            .map(|d| d.connections.len())
            .unwrap_or_else(|e| {
                warn!("[Manager] Could not scan main config: {}", e);
                0
            });

        info!(
            "[Manager] Initialized (layout_created={}, include_changed={}, existing={})",
            layout_created, include_changed, existing_connections
        );
        Ok(InitReport {
            layout_created,
            include_changed,
            existing_connections,
            resumed_migrations,
        })
    }

    /// 按当前最大分组深度更新 Include 行
    async fn sync_include(&self) -> Result<bool> {
        let depth = self
            .store
            .list_groups()
            .await?
            .iter()
            .map(|g| g.split('/').count())
            .max()
            .unwrap_or(1);
        self.main_config.ensure_include(depth).await
    }

    /// 所有受管连接名称（跨分组）
    async fn managed_names(&self) -> Result<HashSet<String>> {
        Ok(self
            .store
            .list_fragments(None)
            .await?
            .into_iter()
            .map(|f| f.name)
            .collect())
    }

    async fn find_managed(&self, name: &str) -> Result<Option<FragmentEntry>> {
        Ok(self
            .store
            .list_fragments(None)
            .await?
            .into_iter()
            .find(|f| f.name == name))
    }

    /// 渲染并校验片段文本（不写入）
    async fn render_fragment(&self, draft: &FragmentDraft) -> Result<RenderResult> {
        draft.validate()?;
        let rendered = self.templates.render(&draft.template, &draft.variables()).await?;
        let content = config::with_metadata(&draft.icon, &draft.template, &rendered.content);
        let report = templates::validate(&content);
        if !report.is_valid {
            return Err(ManagerError::Validation(report.errors.join("; ")));
        }
        Ok(RenderResult {
            content,
            unresolved: rendered.unresolved,
        })
    }

    // ======================== 连接 ========================

    pub async fn add_connection(&self, options: ConnectionOptions) -> Result<SavedConnection> {
        let group = target_group(options.group.as_deref().unwrap_or(groups::FALLBACK))?;
        let draft = FragmentDraft {
            name: options.name.trim().to_string(),
            host: options.host.trim().to_string(),
            user: options.user.unwrap_or_default().trim().to_string(),
            port: options.port,
            key_file: options.key_file,
            jump_host: options.jump_host.filter(|j| !j.is_empty()),
            local_forwards: options.local_forwards,
            remote_forwards: options.remote_forwards,
            dynamic_forward: options.dynamic_forward,
            advanced: options.advanced,
            icon: options
                .icon
                .unwrap_or_else(|| self.settings.default_icon.clone()),
            template: options
                .template
                .unwrap_or_else(|| defaults::TEMPLATE.to_string()),
            variables: options.variables,
        };
        let rendered = self.render_fragment(&draft).await?;

        if let Some(existing) = self.find_managed(&draft.name).await? {
            return Err(ManagerError::Conflict(format!(
                "connection '{}' already exists in group '{}'",
                draft.name, existing.group
            )));
        }

        for parent in group_path::get_parent_paths(&group)? {
            self.store.create_group(&parent).await?;
        }
        self.store.create_group(&group).await?;
        self.store
            .write_fragment(&group, &draft.name, &rendered.content)
            .await?;
        self.sync_include().await?;

        info!("[Manager] Added connection {} to {}", draft.name, group);
        Ok(SavedConnection {
            name: draft.name,
            group,
            unresolved: rendered.unresolved,
        })
    }

    pub async fn remove_connection(&self, name: &str, group: &str) -> Result<()> {
        let group = target_group(group)?;
        if !self.store.remove_fragment(&group, name).await? {
            return Err(ManagerError::NotFound(format!(
                "connection '{}' in group '{}'",
                name, group
            )));
        }
        info!("[Manager] Removed connection {} from {}", name, group);
        Ok(())
    }

    /// 读取单个受管连接
    pub async fn get_connection(&self, name: &str, group: &str) -> Result<Connection> {
        let group = target_group(group)?;
        let text = self.store.read_fragment(&group, name).await?.ok_or_else(|| {
            ManagerError::NotFound(format!("connection '{}' in group '{}'", name, group))
        })?;
        let fragment = config::parse_fragment(&text, &format!("{}/{}", group, name))?;
        Ok(managed_connection(&group, name, fragment))
    }

    /// 更新连接；重命名或换组时先写新片段再删除旧片段
    pub async fn update_connection(
        &self,
        name: &str,
        group: &str,
        updates: ConnectionUpdate,
    ) -> Result<SavedConnection> {
        let group = target_group(group)?;
        let text = self.store.read_fragment(&group, name).await?.ok_or_else(|| {
            ManagerError::NotFound(format!("connection '{}' in group '{}'", name, group))
        })?;
        let current = config::parse_fragment(&text, &format!("{}/{}", group, name))?;

        let mut draft = FragmentDraft::from_parsed(&current);
        draft.name = name.to_string();
        let new_group = match updates.group.as_deref() {
            Some(g) => target_group(g)?,
            None => group.clone(),
        };
        if let Some(v) = updates.name {
            draft.name = v.trim().to_string();
        }
        if let Some(v) = updates.host {
            draft.host = v.trim().to_string();
        }
        if let Some(v) = updates.user {
            draft.user = v.trim().to_string();
        }
        if let Some(v) = updates.port {
            draft.port = Some(v);
        }
        if let Some(v) = updates.template {
            draft.template = v;
        }
        if let Some(v) = updates.icon {
            draft.icon = v;
        }
        if let Some(v) = updates.key_file {
            draft.key_file = Some(v);
        }
        if let Some(v) = updates.jump_host {
            draft.jump_host = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = updates.local_forwards {
            draft.local_forwards = v;
        }
        if let Some(v) = updates.remote_forwards {
            draft.remote_forwards = v;
        }
        if let Some(v) = updates.dynamic_forward {
            draft.dynamic_forward = v;
        }
        if let Some(v) = updates.advanced {
            draft.advanced = v;
        }
        draft.variables = updates.variables;

        let rendered = self.render_fragment(&draft).await?;

        let relocated = draft.name != name || new_group != group;
        if relocated {
            if let Some(existing) = self
                .find_managed(&draft.name)
                .await?
                .filter(|e| !(e.name == name && e.group == group))
            {
                return Err(ManagerError::Conflict(format!(
                    "connection '{}' already exists in group '{}'",
                    draft.name, existing.group
                )));
            }
            self.store.create_group(&new_group).await?;
        }

        self.store
            .write_fragment(&new_group, &draft.name, &rendered.content)
            .await?;
        if relocated {
            self.store.remove_fragment(&group, name).await?;
            self.sync_include().await?;
        }

        info!("[Manager] Updated connection {}/{}", new_group, draft.name);
        Ok(SavedConnection {
            name: draft.name,
            group: new_group,
            unresolved: rendered.unresolved,
        })
    }

    /// 移动连接，片段内容按字节保留
    pub async fn move_connection(&self, name: &str, from: &str, to: &str) -> Result<SavedConnection> {
        let from = target_group(from)?;
        let to = target_group(to)?;
        if from == to {
            return Ok(SavedConnection {
                name: name.to_string(),
                group: to,
                unresolved: Vec::new(),
            });
        }
        self.store.move_fragment(&from, name, &to, name).await?;
        self.sync_include().await?;
        info!("[Manager] Moved connection {} from {} to {}", name, from, to);
        Ok(SavedConnection {
            name: name.to_string(),
            group: to,
            unresolved: Vec::new(),
        })
    }

    /// 列出连接
    ///
    /// 不指定分组时返回所有受管连接加上主配置中的非受管连接；
    /// 指定分组时包含其子分组；`existing` 只返回非受管连接。
    /// 无法解析的片段放入 problems，不会被丢弃。
    pub async fn list_connections(&self, group_filter: Option<&str>) -> Result<ConnectionListing> {
        let filter = match group_filter {
            Some(g) => Some(group_path::normalize(g)?),
            None => None,
        };
        let mut listing = ConnectionListing::default();
        let all_fragments = self.store.list_fragments(None).await?;

        let wants_existing = matches!(filter.as_deref(), None | Some(groups::EXISTING));
        if filter.as_deref() != Some(groups::EXISTING) {
            for entry in &all_fragments {
                if let Some(f) = filter.as_deref() {
                    if entry.group != f && !group_path::is_descendant(&entry.group, f) {
                        continue;
                    }
                }
                let source_ref = format!("{}/{}", entry.group, entry.name);
                let parsed = match tokio::fs::read_to_string(&entry.path).await {
                    Ok(text) => config::parse_fragment(&text, &source_ref),
                    Err(e) => Err(e.into()),
                };
                match parsed {
                    Ok(fragment) => listing.connections.push(managed_connection(
                        &entry.group,
                        &entry.name,
                        fragment,
                    )),
                    Err(e) => {
                        warn!("[Manager] Skipping unreadable fragment {}: {}", source_ref, e);
                        listing.problems.push(ListingProblem {
                            group: entry.group.clone(),
                            name: entry.name.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        if wants_existing {
            let managed: HashSet<String> = all_fragments.into_iter().map(|f| f.name).collect();
            match self.main_config.discover_existing(&managed).await {
                Ok(discovered) => {
                    listing.connections.extend(discovered.connections);
                    listing.problems.extend(discovered.problems);
                }
                Err(e) => {
                    warn!("[Manager] Could not scan main config: {}", e);
                    listing.problems.push(ListingProblem {
                        group: groups::EXISTING.to_string(),
                        name: String::new(),
                        message: e.to_string(),
                    });
                }
            }
        }

        debug!(
            "[Manager] Listed {} connections ({} problems)",
            listing.connections.len(),
            listing.problems.len()
        );
        Ok(listing)
    }

    /// 用系统 ssh 客户端测试连接（有超时，失败会被分类）
    pub async fn test_connection(&self, name: &str, group: &str) -> Result<ProbeOutcome> {
        let group = target_group(group)?;
        let path = self.store.fragment_path(&group, name)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(ManagerError::NotFound(format!(
                "connection '{}' in group '{}'",
                name, group
            )));
        }
        let outcome = self.probe.test_fragment(&path, name).await;
        info!("[Manager] Test {}/{}: {:?}", group, name, outcome);
        Ok(outcome)
    }

    // ======================== 模板 ========================

    pub async fn get_templates(&self) -> Result<Vec<TemplateInfo>> {
        self.templates.list_templates().await
    }

    pub async fn render_template(
        &self,
        template_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<RenderResult> {
        self.templates.render(template_id, variables).await
    }

    pub async fn save_template(&self, id: &str, content: &str) -> Result<()> {
        self.templates.save_template(id, content).await
    }

    pub async fn delete_template(&self, id: &str) -> Result<()> {
        self.templates.delete_template(id).await
    }

    // ======================== 分组 ========================

    /// 创建分组；父分组会一并创建
    pub async fn create_group(&self, path: &str, icon: Option<&str>) -> Result<()> {
        let norm = target_group(path)?;
        if self.store.group_exists(&norm).await? {
            return Err(ManagerError::Conflict(format!("group '{}' already exists", norm)));
        }
        for parent in group_path::get_parent_paths(&norm)? {
            self.store.create_group(&parent).await?;
        }
        self.store.create_group(&norm).await?;

        if let Some(icon) = icon.filter(|i| !i.is_empty()) {
            let mut icons = self.store.load_group_icons().await?;
            icons.insert(norm.clone(), icon.to_string());
            self.store.save_group_icons(&icons).await?;
        }
        self.sync_include().await?;
        info!("[Manager] Created group {}", norm);
        Ok(())
    }

    /// 重命名分组；图标随子分组一起迁移
    pub async fn rename_group(&self, old: &str, new: &str, icon: Option<&str>) -> Result<()> {
        let old_norm = target_group(old)?;
        let new_norm = target_group(new)?;
        self.store.rename_group(&old_norm, &new_norm).await?;

        let icons = self.store.load_group_icons().await?;
        let mut rekeyed = BTreeMap::new();
        for (path, glyph) in icons {
            let key = if path == old_norm {
                new_norm.clone()
            } else if group_path::is_descendant(&path, &old_norm) {
                format!("{}{}", new_norm, &path[old_norm.len()..])
            } else {
                path
            };
            rekeyed.insert(key, glyph);
        }
        if let Some(icon) = icon.filter(|i| !i.is_empty()) {
            rekeyed.insert(new_norm.clone(), icon.to_string());
        }
        self.store.save_group_icons(&rekeyed).await?;

        self.sync_include().await?;
        info!("[Manager] Renamed group {} -> {}", old_norm, new_norm);
        Ok(())
    }

    /// 删除空分组
    pub async fn delete_group(&self, path: &str) -> Result<()> {
        let norm = target_group(path)?;
        self.store.delete_group(&norm).await?;

        let mut icons = self.store.load_group_icons().await?;
        let before = icons.len();
        icons.retain(|p, _| p != &norm && !group_path::is_descendant(p, &norm));
        if icons.len() != before {
            self.store.save_group_icons(&icons).await?;
        }
        info!("[Manager] Deleted group {}", norm);
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        let paths = self.store.list_groups().await?;
        let fragments = self.store.list_fragments(None).await?;
        let icons = self.store.load_group_icons().await?;

        let mut infos = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = group_path::parse(&path)?;
            infos.push(GroupInfo {
                icon: icons
                    .get(&path)
                    .cloned()
                    .unwrap_or_else(|| self.settings.default_group_icon.clone()),
                connection_count: fragments.iter().filter(|f| f.group == path).count(),
                name: parsed.name,
                depth: parsed.depth,
                parent: parsed.parent,
                path,
            });
        }
        Ok(infos)
    }

    /// 分组树（每个节点带直接包含的连接名）
    pub async fn groups_tree(&self) -> Result<Vec<GroupNode>> {
        let infos = self.list_groups().await?;
        let fragments = self.store.list_fragments(None).await?;

        fn build(
            parent: Option<&str>,
            infos: &[GroupInfo],
            fragments: &[FragmentEntry],
        ) -> Vec<GroupNode> {
            infos
                .iter()
                .filter(|g| g.parent.as_deref() == parent)
                .map(|g| GroupNode {
                    name: g.name.clone(),
                    path: g.path.clone(),
                    icon: g.icon.clone(),
                    connections: fragments
                        .iter()
                        .filter(|f| f.group == g.path)
                        .map(|f| f.name.clone())
                        .collect(),
                    children: build(Some(&g.path), infos, fragments),
                })
                .collect()
        }

        Ok(build(None, &infos, &fragments))
    }

    // ======================== 迁移 ========================

    /// 把主配置中的非受管连接迁入分组
    pub async fn migrate_existing_connection(
        &self,
        name: &str,
        to_group: &str,
    ) -> Result<SavedConnection> {
        let group = target_group(to_group)?;

        if let Some(pending) = self
            .migrator
            .pending()
            .await?
            .into_iter()
            .find(|p| p.name == name)
        {
            if pending.to_group != group {
                return Err(ManagerError::Conflict(format!(
                    "'{}' is already being migrated to '{}'",
                    name, pending.to_group
                )));
            }
            info!("[Manager] Resuming migration of {} into {}", name, group);
            self.migrator.resume(name).await?;
            self.sync_include().await?;
            return Ok(SavedConnection {
                name: name.to_string(),
                group,
                unresolved: Vec::new(),
            });
        }

        if let Some(existing) = self.find_managed(name).await? {
            return Err(ManagerError::Conflict(format!(
                "connection '{}' already exists in group '{}'",
                name, existing.group
            )));
        }
        let entry = self
            .main_config
            .find_existing(name)
            .await?
            .ok_or_else(|| ManagerError::NotFound(format!("existing connection '{}'", name)))?;
        if entry.patterns.len() > 1 {
            return Err(ManagerError::Validation(format!(
                "Host line for '{}' declares several aliases ({}); split it before migrating",
                name,
                entry.patterns.join(" ")
            )));
        }

        let mut draft = FragmentDraft::from_parsed(&entry.fragment);
        draft.icon = self.settings.default_icon.clone();
        draft.template = defaults::TEMPLATE.to_string();
        let rendered = self.render_fragment(&draft).await?;

        self.migrator.migrate(name, &group, &rendered.content).await?;
        self.sync_include().await?;
        info!("[Manager] Migrated {} into {}", name, group);
        Ok(SavedConnection {
            name: name.to_string(),
            group,
            unresolved: rendered.unresolved,
        })
    }

    // ======================== 校验与备份 ========================

    /// 校验主配置与所有受管片段，从不返回错误
    pub async fn verify_integrity(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        let main_ref = self.main_config.path().display().to_string();

        match self.main_config.integration_state(0).await {
            Ok(state) if !state.main_config_exists => {
                report.push(IssueSeverity::Warning, &main_ref, "main config does not exist");
            }
            Ok(state) => {
                if !state.integrated {
                    report.push(
                        IssueSeverity::Warning,
                        &main_ref,
                        "managed Include line is missing",
                    );
                }
                match self
                    .probe
                    .check_config(self.main_config.path(), INTEGRITY_PROBE_HOST)
                    .await
                {
                    ConfigCheck::Valid => {}
                    ConfigCheck::Invalid { message } => {
                        report.push(IssueSeverity::Error, &main_ref, message)
                    }
                    ConfigCheck::ClientUnavailable => report.push(
                        IssueSeverity::Warning,
                        &main_ref,
                        "ssh client unavailable, merged config not checked",
                    ),
                    ConfigCheck::TimedOut => report.push(
                        IssueSeverity::Warning,
                        &main_ref,
                        "ssh client did not answer in time",
                    ),
                }
            }
            Err(e) => report.push(IssueSeverity::Error, &main_ref, e.to_string()),
        }

        match self.store.list_fragments(None).await {
            Ok(fragments) => {
                for entry in fragments {
                    let source = format!("{}/{}", entry.group, entry.name);
                    match tokio::fs::read_to_string(&entry.path).await {
                        Ok(text) => {
                            let check = templates::validate(&text);
                            for error in check.errors {
                                report.push(IssueSeverity::Error, &source, error);
                            }
                            for warning in check.warnings {
                                report.push(IssueSeverity::Warning, &source, warning);
                            }
                            if let Ok(fragment) = config::parse_fragment(&text, &source) {
                                for mismatch in config::cross_check(&text, &fragment) {
                                    report.push(IssueSeverity::Warning, &source, mismatch);
                                }
                            }
                        }
                        Err(e) => report.push(IssueSeverity::Error, &source, e.to_string()),
                    }
                }
            }
            Err(e) => report.push(IssueSeverity::Error, "config", e.to_string()),
        }

        match self.migrator.pending().await {
            Ok(pending) => {
                for p in pending {
                    report.push(
                        IssueSeverity::Warning,
                        format!("{}/{}", p.to_group, p.name),
                        format!("migration interrupted at phase {:?}", p.phase),
                    );
                }
            }
            Err(e) => report.push(IssueSeverity::Warning, "migrations", e.to_string()),
        }

        report.valid = !report
            .issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error);
        if !report.valid {
            warn!("[Manager] Integrity check found {} issue(s)", report.issues.len());
        }
        report
    }

    /// 备份片段树与主配置（不含私钥）
    pub async fn create_backup(&self, destination: &Path) -> Result<BackupSummary> {
        let fragments = self.store.list_fragments(None).await?;
        let groups = self.store.list_groups().await?;
        backup::create_archive(
            destination.to_path_buf(),
            fragments,
            groups,
            Some(self.settings.ssh_config_path.clone()),
        )
        .await
    }

    pub async fn integration_state(&self) -> Result<IntegrationState> {
        let pending = self.migrator.pending().await?.len();
        self.main_config.integration_state(pending).await
    }

    /// 移除 Include 行（撤销集成）
    pub async fn remove_include(&self) -> Result<bool> {
        self.main_config.remove_include().await
    }

    pub async fn list_main_config_backups(&self) -> Result<Vec<MainConfigBackup>> {
        self.main_config.list_backups().await
    }

    pub async fn restore_main_config(&self, file_name: &str) -> Result<()> {
        self.main_config.restore_backup(file_name).await
    }
}
