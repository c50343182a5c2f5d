// SSH 配置模板
//
// 模板使用 `{{变量}}` 占位符。渲染是 (模板, 变量表) 的纯函数：
// 未提供的变量原样保留，并在 RenderResult.unresolved 中列出。

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::models::{PortForward, RemoteForward, RenderResult, TemplateInfo, ValidationReport};
use crate::services::storage::ConfigStore;
use crate::ssh::config::{self, tokenize_line};
use crate::ssh::error::{ManagerError, Result};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("placeholder regex"));

static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.\-]*[A-Za-z0-9])?$").expect("hostname regex")
});

static TEMPLATE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("template id regex"));

/// 可选段落变量：非空且模板未显式引用时插入到锚点之后
const CONDITIONAL_KEYS: [&str; 3] = ["local_forwards", "remote_forwards", "dynamic_forward"];

/// 锚点指令，取文本中最后出现的一条
const ANCHORS: [&str; 5] = ["HostName", "User", "Port", "IdentityFile", "ProxyJump"];

/// 内置模板
pub struct BuiltinTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub content: &'static str,
}

pub static BUILTIN_TEMPLATES: &[BuiltinTemplate] = &[
    BuiltinTemplate {
        id: "basic-server",
        name: "Basic Server",
        description: "Simple SSH connection with username and host",
        content: "# Basic SSH Connection
Host {{name}}
    HostName {{host}}
{{user_line}}
    Port {{port}}
    IdentityFile {{key_file}}

    # Essential Connection Settings
    ServerAliveInterval {{server_alive_interval}}
    ServerAliveCountMax {{server_alive_count_max}}
    ConnectTimeout {{connect_timeout}}
    Compression {{compression}}
    StrictHostKeyChecking {{strict_host_key_checking}}

    # Connection Multiplexing
    ControlMaster {{control_master}}
    ControlPath {{control_path}}
    ControlPersist {{control_persist}}
    ForwardX11 {{forward_x11}}
    ForwardAgent {{forward_agent}}
",
    },
    BuiltinTemplate {
        id: "jump-host",
        name: "Jump Host (Bastion)",
        description: "Connection through a jump host or bastion server",
        content: "# Jump Host Configuration
Host {{name}}
    HostName {{host}}
{{user_line}}
    Port {{port}}
    IdentityFile {{key_file}}
    ProxyJump {{jump_host}}

    # Jump Host Settings
    ServerAliveInterval {{server_alive_interval}}
    ServerAliveCountMax {{server_alive_count_max}}
    ConnectTimeout {{connect_timeout}}
    Compression {{compression}}
    StrictHostKeyChecking {{strict_host_key_checking}}

    # Connection Management
    ControlMaster {{control_master}}
    ControlPath {{control_path}}
    ControlPersist {{control_persist}}
",
    },
    BuiltinTemplate {
        id: "port-forward",
        name: "Port Forwarding",
        description: "Local and remote port forwarding to services behind the host",
        content: "# Port Forwarding
Host {{name}}
    HostName {{host}}
{{user_line}}
    Port {{port}}
    IdentityFile {{key_file}}

    # Forwarded Ports
{{local_forwards}}
{{remote_forwards}}
    ExitOnForwardFailure yes

    # Connection Settings
    ServerAliveInterval {{server_alive_interval}}
    ServerAliveCountMax {{server_alive_count_max}}
    ConnectTimeout {{connect_timeout}}
",
    },
    BuiltinTemplate {
        id: "tunnel",
        name: "SOCKS Tunnel",
        description: "Dynamic SOCKS proxy tunnel through the host",
        content: "# SOCKS Tunnel
Host {{name}}
    HostName {{host}}
{{user_line}}
    Port {{port}}
    IdentityFile {{key_file}}

    # Tunnel
{{dynamic_forward}}
    ExitOnForwardFailure yes
    Compression yes

    # Keep the tunnel alive
    ServerAliveInterval {{server_alive_interval}}
    ServerAliveCountMax {{server_alive_count_max}}
    ConnectTimeout {{connect_timeout}}
",
    },
    BuiltinTemplate {
        id: "aws-ec2",
        name: "AWS EC2 Instance",
        description: "AWS EC2 instance with key-based authentication",
        content: "# AWS EC2 Instance
Host {{name}}
    HostName {{host}}
{{user_line}}
    Port {{port}}
    IdentityFile {{key_file}}

    # AWS EC2 Optimized Settings
    ServerAliveInterval 60
    ServerAliveCountMax 3
    ConnectTimeout 30
    Compression yes
    StrictHostKeyChecking no
    UserKnownHostsFile /dev/null

    # Connection Multiplexing for Speed
    ControlMaster auto
    ControlPath ~/.ssh/control-%h-%p-%r
    ControlPersist 10m
",
    },
    BuiltinTemplate {
        id: "development",
        name: "Development Server",
        description: "Disposable development or staging machine with relaxed host key checks",
        content: "# Development Server
Host {{name}}
    HostName {{host}}
{{user_line}}
    Port {{port}}
    IdentityFile {{key_file}}

    # Relaxed checks for short-lived machines
    StrictHostKeyChecking no
    UserKnownHostsFile /dev/null
    LogLevel ERROR
    ForwardAgent yes

    # Connection Settings
    ServerAliveInterval {{server_alive_interval}}
    ServerAliveCountMax {{server_alive_count_max}}
    ConnectTimeout {{connect_timeout}}
",
    },
    BuiltinTemplate {
        id: "developer",
        name: "Developer Workstation",
        description: "Development server with X11 forwarding and port tunneling",
        content: "# Developer Workstation
Host {{name}}
    HostName {{host}}
{{user_line}}
    Port {{port}}
    IdentityFile {{key_file}}

    # Developer Features
    ForwardX11 yes
    ForwardX11Trusted yes
    ForwardAgent yes

    # Port Forwarding
{{local_forwards}}
{{remote_forwards}}
{{dynamic_forward}}

    # Connection Settings
    ServerAliveInterval {{server_alive_interval}}
    ServerAliveCountMax {{server_alive_count_max}}
    ConnectTimeout {{connect_timeout}}
    Compression {{compression}}
    StrictHostKeyChecking {{strict_host_key_checking}}

    # Connection Multiplexing
    ControlMaster {{control_master}}
    ControlPath {{control_path}}
    ControlPersist {{control_persist}}
",
    },
];

/// 查找内置模板
pub fn builtin(id: &str) -> Option<&'static BuiltinTemplate> {
    BUILTIN_TEMPLATES.iter().find(|t| t.id == id)
}

/// 引擎默认变量，调用方提供的值优先
pub fn default_variables() -> BTreeMap<String, String> {
    [
        ("port", "22"),
        ("key_file", "~/.ssh/id_rsa"),
        ("user_line", ""),
        ("server_alive_interval", "60"),
        ("server_alive_count_max", "3"),
        ("connect_timeout", "10"),
        ("compression", "yes"),
        ("strict_host_key_checking", "ask"),
        ("control_master", "auto"),
        ("control_path", "~/.ssh/control-%h-%p-%r"),
        ("control_persist", "10m"),
        ("forward_x11", "no"),
        ("forward_agent", "no"),
        ("local_forwards", ""),
        ("remote_forwards", ""),
        ("dynamic_forward", ""),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn format_local_forwards(forwards: &[PortForward]) -> String {
    forwards
        .iter()
        .map(|f| {
            format!(
                "    LocalForward {} {}:{}",
                f.local_port, f.remote_host, f.remote_port
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_remote_forwards(forwards: &[RemoteForward]) -> String {
    forwards
        .iter()
        .map(|f| {
            format!(
                "    RemoteForward {} {}:{}",
                f.remote_port, f.local_host, f.local_port
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_dynamic_forward(port: Option<u16>) -> String {
    port.map(|p| format!("    DynamicForward {}", p))
        .unwrap_or_default()
}

/// 合并默认变量与调用方变量；提供了 user 但没有 user_line 时自动生成
fn merge_variables(variables: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = default_variables();
    merged.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    if !variables.contains_key("user_line") {
        if let Some(user) = variables.get("user").filter(|u| !u.is_empty()) {
            merged.insert("user_line".to_string(), format!("    User {}", user));
        }
    }
    merged
}

fn is_anchor(line: &str) -> bool {
    matches!(
        tokenize_line(line),
        Ok(Some((keyword, _))) if ANCHORS.iter().any(|a| a.eq_ignore_ascii_case(&keyword))
    )
}

/// 渲染模板文本（纯函数）
pub fn render_text(content: &str, variables: &BTreeMap<String, String>) -> RenderResult {
    let merged = merge_variables(variables);
    let mut unresolved = BTreeSet::new();

    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        // 整行只有一个占位符且值为空时去掉该行
        if let Some(caps) = PLACEHOLDER.captures(line.trim()) {
            let whole = caps.get(0).map(|m| m.as_str().len()) == Some(line.trim().len());
            if whole && merged.get(&caps[1]).is_some_and(|v| v.is_empty()) {
                continue;
            }
        }
        let rendered = PLACEHOLDER.replace_all(line, |caps: &regex::Captures| {
            match merged.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    unresolved.insert(caps[1].to_string());
                    caps[0].to_string()
                }
            }
        });
        lines.push(rendered.into_owned());
    }

    // 模板未引用的可选段落插入到最后一个锚点之后
    let inserts: Vec<String> = CONDITIONAL_KEYS
        .iter()
        .filter(|key| !content.contains(&format!("{{{{{}}}}}", key)))
        .filter_map(|key| merged.get(*key).filter(|v| !v.is_empty()))
        .flat_map(|v| v.lines().map(str::to_string).collect::<Vec<_>>())
        .collect();
    if !inserts.is_empty() {
        let at = lines
            .iter()
            .rposition(|l| is_anchor(l))
            .map(|i| i + 1)
            .unwrap_or(lines.len());
        lines.splice(at..at, inserts);
    }

    let mut rendered = lines.join("\n");
    if content.ends_with('\n') {
        rendered.push('\n');
    }
    RenderResult {
        content: rendered,
        unresolved: unresolved.into_iter().collect(),
    }
}

/// 校验 SSH 配置文本，从不返回错误
pub fn validate(text: &str) -> ValidationReport {
    let mut report = ValidationReport::default();

    match config::parse_config(text, "config") {
        Err(e) => report.errors.push(e.to_string()),
        Ok(parsed) => {
            if parsed.hosts.is_empty() {
                report.errors.push("No Host directive found".to_string());
            }
            let directives = parsed
                .global
                .iter()
                .chain(parsed.hosts.iter().flat_map(|h| h.directives.iter()));
            for directive in directives {
                let value = directive.value();
                if directive.is("Port") {
                    match value.parse::<u16>() {
                        Ok(p) if p > 0 => {}
                        _ => report.errors.push(format!(
                            "Line {}: invalid port '{}' (must be 1-65535)",
                            directive.line + 1,
                            value
                        )),
                    }
                } else if directive.is("HostName")
                    && !value.contains(':')
                    && !value.contains('%')
                    && !HOSTNAME.is_match(&value)
                {
                    report.warnings.push(format!(
                        "Line {}: hostname '{}' looks unusual",
                        directive.line + 1,
                        value
                    ));
                }
            }
        }
    }

    let placeholders: BTreeSet<&str> = PLACEHOLDER
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    for name in placeholders {
        report
            .warnings
            .push(format!("Unresolved placeholder '{{{{{}}}}}'", name));
    }

    report.is_valid = report.errors.is_empty();
    report
}

/// 自定义模板名称：首行 `# 名称`
fn custom_template_name(id: &str, content: &str) -> String {
    content
        .lines()
        .next()
        .and_then(|l| l.strip_prefix('#'))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(id)
        .to_string()
}

/// 模板引擎
#[derive(Clone, Debug)]
pub struct TemplateEngine {
    store: ConfigStore,
}

impl TemplateEngine {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    /// 模板内容：内置优先，其次自定义
    pub async fn template_content(&self, id: &str) -> Result<String> {
        if let Some(template) = builtin(id) {
            return Ok(template.content.to_string());
        }
        if !TEMPLATE_ID.is_match(id) {
            return Err(ManagerError::TemplateNotFound(id.to_string()));
        }
        self.store
            .read_custom_template(id)
            .await?
            .ok_or_else(|| ManagerError::TemplateNotFound(id.to_string()))
    }

    pub async fn render(
        &self,
        template_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<RenderResult> {
        let content = self.template_content(template_id).await?;
        let result = render_text(&content, variables);
        if !result.unresolved.is_empty() {
            debug!(
                "[Template] {} left placeholders unresolved: {:?}",
                template_id, result.unresolved
            );
        }
        Ok(result)
    }

    /// 内置模板 + 不与内置重名的自定义模板
    pub async fn list_templates(&self) -> Result<Vec<TemplateInfo>> {
        let mut templates: Vec<TemplateInfo> = BUILTIN_TEMPLATES
            .iter()
            .map(|t| TemplateInfo {
                id: t.id.to_string(),
                name: t.name.to_string(),
                description: t.description.to_string(),
                is_default: true,
            })
            .collect();

        for (id, content) in self.store.list_custom_templates().await? {
            if builtin(&id).is_some() {
                continue;
            }
            templates.push(TemplateInfo {
                name: custom_template_name(&id, &content),
                id,
                description: "Custom template".to_string(),
                is_default: false,
            });
        }
        Ok(templates)
    }

    /// 保存自定义模板
    pub async fn save_template(&self, id: &str, content: &str) -> Result<()> {
        if !TEMPLATE_ID.is_match(id) {
            return Err(ManagerError::Validation(format!(
                "template id '{}' must match [A-Za-z0-9][A-Za-z0-9_-]*",
                id
            )));
        }
        if builtin(id).is_some() {
            return Err(ManagerError::Conflict(format!(
                "'{}' is a built-in template",
                id
            )));
        }
        let report = validate(content);
        if !report.is_valid {
            return Err(ManagerError::Validation(report.errors.join("; ")));
        }
        self.store.write_custom_template(id, content).await?;
        info!("[Template] Saved custom template {}", id);
        Ok(())
    }

    /// 删除自定义模板
    pub async fn delete_template(&self, id: &str) -> Result<()> {
        if builtin(id).is_some() {
            return Err(ManagerError::InvalidTarget(format!(
                "built-in template '{}' cannot be deleted",
                id
            )));
        }
        if !TEMPLATE_ID.is_match(id) || !self.store.remove_custom_template(id).await? {
            return Err(ManagerError::TemplateNotFound(id.to_string()));
        }
        info!("[Template] Deleted custom template {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ManagerSettings;
    use crate::ssh::config::parse_fragment;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn create_test_engine() -> (TemplateEngine, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(ManagerSettings::with_root(temp_dir.path()));
        (TemplateEngine::new(store), temp_dir)
    }

    #[test]
    fn test_every_builtin_renders_valid_config() {
        let variables = vars(&[
            ("name", "box"),
            ("host", "10.0.0.9"),
            ("user", "admin"),
            ("jump_host", "bastion"),
            ("dynamic_forward", "    DynamicForward 1080"),
        ]);
        for template in BUILTIN_TEMPLATES {
            let result = render_text(template.content, &variables);
            assert!(result.unresolved.is_empty(), "{}: {:?}", template.id, result.unresolved);
            let report = validate(&result.content);
            assert!(report.is_valid, "{}: {:?}", template.id, report.errors);
        }
    }

    #[test]
    fn test_render_round_trip() {
        let variables = vars(&[
            ("name", "db1"),
            ("host", "10.0.0.5"),
            ("user", "admin"),
            ("port", "2200"),
            ("key_file", "~/.ssh/db"),
        ]);
        for template in BUILTIN_TEMPLATES {
            let result = render_text(template.content, &variables);
            let fragment = parse_fragment(&result.content, template.id).unwrap();
            assert_eq!(fragment.name, "db1");
            assert_eq!(fragment.host, "10.0.0.5");
            assert_eq!(fragment.user, "admin");
            assert_eq!(fragment.port, 2200);
            assert_eq!(fragment.key_file, "~/.ssh/db");
        }
    }

    #[test]
    fn test_render_defaults_and_unresolved() {
        let result = render_text(
            builtin("jump-host").unwrap().content,
            &vars(&[("name", "inner"), ("host", "10.1.0.1")]),
        );
        assert!(result.content.contains("    Port 22\n"));
        assert!(result.content.contains("IdentityFile ~/.ssh/id_rsa"));
        assert!(!result.content.contains("User"));
        assert!(result.content.contains("ProxyJump {{jump_host}}"));
        assert_eq!(result.unresolved, vec!["jump_host".to_string()]);
    }

    #[test]
    fn test_caller_values_override_defaults() {
        let result = render_text(
            "Host {{name}}\n    Port {{port}}\n",
            &vars(&[("name", "x"), ("port", "2022")]),
        );
        assert_eq!(result.content, "Host x\n    Port 2022\n");
    }

    #[test]
    fn test_conditional_sections_spliced_after_anchor() {
        let forwards = format_local_forwards(&[PortForward {
            local_port: 5432,
            remote_host: "db.internal".to_string(),
            remote_port: 5432,
        }]);
        let result = render_text(
            builtin("basic-server").unwrap().content,
            &vars(&[
                ("name", "web"),
                ("host", "web.example.com"),
                ("local_forwards", &forwards),
                ("dynamic_forward", "    DynamicForward 1080"),
            ]),
        );
        let lines: Vec<&str> = result.content.lines().collect();
        let identity = lines
            .iter()
            .position(|l| l.trim_start().starts_with("IdentityFile"))
            .unwrap();
        assert_eq!(lines[identity + 1], "    LocalForward 5432 db.internal:5432");
        assert_eq!(lines[identity + 2], "    DynamicForward 1080");
    }

    #[test]
    fn test_explicit_placeholders_not_duplicated() {
        let result = render_text(
            builtin("tunnel").unwrap().content,
            &vars(&[
                ("name", "socks"),
                ("host", "gw"),
                ("dynamic_forward", "    DynamicForward 1080"),
            ]),
        );
        assert_eq!(result.content.matches("DynamicForward").count(), 1);

        let without = render_text(
            builtin("port-forward").unwrap().content,
            &vars(&[("name", "pf"), ("host", "gw")]),
        );
        assert!(!without.content.contains("LocalForward"));
        assert!(!without.content.contains("{{"));
    }

    #[test]
    fn test_validate_reports() {
        let report = validate("User x\n");
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("No Host"));

        let report = validate("Host a\n    Port 0\n");
        assert!(!report.is_valid);

        let report = validate("Host a\n    HostName bad_host!\n    Port 22\n");
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);

        let report = validate("Host a\n    User \"open\n");
        assert!(!report.is_valid);
    }

    #[tokio::test]
    async fn test_render_missing_template() {
        let (engine, _temp) = create_test_engine();
        let err = engine.render("nope", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn test_custom_templates() {
        let (engine, _temp) = create_test_engine();

        assert!(matches!(
            engine.save_template("basic-server", "Host {{name}}\n").await,
            Err(ManagerError::Conflict(_))
        ));
        assert!(matches!(
            engine.save_template("broken", "User x\n").await,
            Err(ManagerError::Validation(_))
        ));

        engine
            .save_template("lab", "# Lab Box\nHost {{name}}\n    HostName {{host}}\n")
            .await
            .unwrap();
        let templates = engine.list_templates().await.unwrap();
        assert_eq!(templates.len(), BUILTIN_TEMPLATES.len() + 1);
        let lab = templates.iter().find(|t| t.id == "lab").unwrap();
        assert_eq!(lab.name, "Lab Box");
        assert!(!lab.is_default);

        let rendered = engine
            .render("lab", &vars(&[("name", "l1"), ("host", "10.9.9.9")]))
            .await
            .unwrap();
        assert_eq!(rendered.content, "# Lab Box\nHost l1\n    HostName 10.9.9.9\n");

        engine.delete_template("lab").await.unwrap();
        assert!(matches!(
            engine.delete_template("lab").await,
            Err(ManagerError::TemplateNotFound(_))
        ));
        assert!(matches!(
            engine.delete_template("aws-ec2").await,
            Err(ManagerError::InvalidTarget(_))
        ));
    }
}
