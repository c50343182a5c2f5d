// SSH 配置解析
//
// 分词器按 OpenSSH 的行语法工作：`Keyword value...` 或 `Keyword=value`，
// 支持双引号参数和整行注释。解析结果保留行号，供主配置注释迁移使用。

use std::io::BufReader;

use ssh2_config::{ParseRule, SshConfig};
use tracing::warn;

use crate::constants::{defaults, icons, markers};
use crate::models::{AdvancedSettings, PortForward, RemoteForward};
use crate::ssh::error::{ManagerError, Result};

/// 一条配置指令
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    /// 原始大小写的关键字
    pub keyword: String,
    /// 去引号后的参数
    pub args: Vec<String>,
    /// 行号（从 0 开始）
    pub line: usize,
}

impl Directive {
    pub fn is(&self, keyword: &str) -> bool {
        self.keyword.eq_ignore_ascii_case(keyword)
    }

    /// 参数以空格连接
    pub fn value(&self) -> String {
        self.args.join(" ")
    }
}

/// 一个 Host 块
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostBlock {
    pub patterns: Vec<String>,
    /// Host 行行号
    pub start_line: usize,
    /// 最后一条指令之后的行号（不含尾部空行与注释）
    pub end_line: usize,
    pub directives: Vec<Directive>,
}

impl HostBlock {
    /// 第一次出现的取值（OpenSSH 首个匹配生效）
    pub fn get(&self, keyword: &str) -> Option<String> {
        self.directives
            .iter()
            .find(|d| d.is(keyword))
            .map(Directive::value)
    }

    pub fn get_all(&self, keyword: &str) -> impl Iterator<Item = &Directive> + '_ {
        let keyword = keyword.to_string();
        self.directives.iter().filter(move |d| d.is(&keyword))
    }

    /// 是否为通配模式（`*`、`?`、`!`）
    pub fn is_wildcard(pattern: &str) -> bool {
        pattern.contains(|c: char| c == '*' || c == '?') || pattern.starts_with('!')
    }
}

/// 整个配置文件的解析结果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedConfig {
    /// 第一个 Host/Match 之前的指令
    pub global: Vec<Directive>,
    pub hosts: Vec<HostBlock>,
    /// 所有 Include 指令
    pub includes: Vec<Directive>,
}

impl ParsedConfig {
    pub fn find_host(&self, name: &str) -> Option<&HostBlock> {
        self.hosts
            .iter()
            .find(|h| h.patterns.iter().any(|p| p == name))
    }
}

/// 单行分词；空行和注释返回 None
pub fn tokenize_line(line: &str) -> std::result::Result<Option<(String, Vec<String>)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let keyword_end = trimmed
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(trimmed.len());
    let keyword = &trimmed[..keyword_end];
    if keyword.is_empty() {
        return Err("missing keyword".to_string());
    }
    if !keyword.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("invalid keyword '{}'", keyword));
    }

    let mut rest = trimmed[keyword_end..].trim_start();
    if let Some(stripped) = rest.strip_prefix('=') {
        rest = stripped.trim_start();
    }

    let mut args = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '#' {
            break;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            for ch in chars.by_ref() {
                if ch == '"' {
                    closed = true;
                    break;
                }
                token.push(ch);
            }
            if !closed {
                return Err("unterminated quote".to_string());
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                if ch == '"' {
                    return Err("unexpected quote inside argument".to_string());
                }
                token.push(ch);
                chars.next();
            }
        }
        args.push(token);
    }

    Ok(Some((keyword.to_string(), args)))
}

/// 解析完整配置文本
///
/// `source_ref` 用于错误信息中的来源标识（文件路径或片段名）。
pub fn parse_config(text: &str, source_ref: &str) -> Result<ParsedConfig> {
    let mut parsed = ParsedConfig::default();
    let mut current: Option<HostBlock> = None;
    let mut in_match = false;

    for (idx, line) in text.lines().enumerate() {
        let tokens = tokenize_line(line)
            .map_err(|message| ManagerError::parse(source_ref, idx + 1, message))?;
        let Some((keyword, args)) = tokens else {
            continue;
        };
        let directive = Directive {
            keyword,
            args,
            line: idx,
        };

        if directive.is("Host") {
            if directive.args.is_empty() {
                return Err(ManagerError::parse(
                    source_ref,
                    idx + 1,
                    "Host directive without a name",
                ));
            }
            if let Some(block) = current.take() {
                parsed.hosts.push(block);
            }
            in_match = false;
            current = Some(HostBlock {
                patterns: directive.args.clone(),
                start_line: idx,
                end_line: idx + 1,
                directives: Vec::new(),
            });
            continue;
        }

        if directive.is("Match") {
            if let Some(block) = current.take() {
                parsed.hosts.push(block);
            }
            in_match = true;
            continue;
        }

        if directive.is("Include") {
            parsed.includes.push(directive.clone());
        }

        match current.as_mut() {
            Some(block) => {
                block.end_line = idx + 1;
                block.directives.push(directive);
            }
            None if !in_match => parsed.global.push(directive),
            None => {}
        }
    }

    if let Some(block) = current.take() {
        parsed.hosts.push(block);
    }
    Ok(parsed)
}

/// 含空白的值加双引号
pub fn quote_value(value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

// ======================== 片段解析 ========================

/// 从片段文本还原的连接字段
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFragment {
    /// Host 名（第一个模式）
    pub name: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_file: String,
    pub icon: String,
    /// 头部记录的模板 id（手写片段没有）
    pub template: Option<String>,
    pub jump_host: Option<String>,
    pub local_forwards: Vec<PortForward>,
    pub remote_forwards: Vec<RemoteForward>,
    pub dynamic_forward: Option<u16>,
    pub advanced: AdvancedSettings,
    /// 是否包含 ForwardX11 yes
    pub forward_x11: bool,
}

/// 读取首行图标注释
pub fn read_icon(text: &str) -> Option<String> {
    let first = text.lines().next()?;
    let glyph = first.strip_prefix(icons::FRAGMENT_ICON_PREFIX)?.trim();
    (!glyph.is_empty()).then(|| glyph.to_string())
}

/// 读取头部注释中记录的模板 id
pub fn read_template(text: &str) -> Option<String> {
    text.lines()
        .take_while(|l| l.trim().is_empty() || l.trim_start().starts_with('#'))
        .find_map(|l| l.strip_prefix(markers::FRAGMENT_TEMPLATE_PREFIX))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// 写入图标与模板注释（替换已有的）
pub fn with_metadata(icon: &str, template: &str, text: &str) -> String {
    let mut body = text;
    while let Some((first, rest)) = body.split_once('\n') {
        if first.starts_with(icons::FRAGMENT_ICON_PREFIX)
            || first.starts_with(markers::FRAGMENT_TEMPLATE_PREFIX)
        {
            body = rest;
        } else {
            break;
        }
    }
    format!(
        "{} {}\n{} {}\n{}",
        icons::FRAGMENT_ICON_PREFIX,
        icon,
        markers::FRAGMENT_TEMPLATE_PREFIX,
        template,
        body
    )
}

fn parse_port(value: &str, source_ref: &str, line: usize) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ManagerError::parse(
            source_ref,
            line + 1,
            format!("invalid port '{}'", value),
        )),
    }
}

/// `[bind:]port` 中的端口
fn listen_port(value: &str) -> Option<u16> {
    let port = value.rsplit_once(':').map(|(_, p)| p).unwrap_or(value);
    port.parse().ok().filter(|p: &u16| *p > 0)
}

/// `host:port`，支持 `[::1]:80`
fn host_port(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port.parse().ok().filter(|p: &u16| *p > 0)?;
    (!host.is_empty()).then(|| (host.to_string(), port))
}

fn yes_no(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

/// 解析单个片段
///
/// 缺失字段使用默认值（host=unknown, port=22, key_file=~/.ssh/id_ed25519），
/// 只有分词失败或端口非法时返回 Parse 错误。
pub fn parse_fragment(text: &str, source_ref: &str) -> Result<ParsedFragment> {
    let parsed = parse_config(text, source_ref)?;
    let icon = read_icon(text).unwrap_or_else(|| icons::DEFAULT_CONNECTION.to_string());

    let mut fragment = ParsedFragment {
        name: String::new(),
        host: defaults::HOST.to_string(),
        user: String::new(),
        port: defaults::PORT,
        key_file: defaults::KEY_FILE.to_string(),
        icon,
        template: read_template(text),
        jump_host: None,
        local_forwards: Vec::new(),
        remote_forwards: Vec::new(),
        dynamic_forward: None,
        advanced: AdvancedSettings::default(),
        forward_x11: false,
    };

    let Some(block) = parsed.hosts.first() else {
        return Ok(fragment);
    };
    fragment.name = block.patterns[0].clone();
    let mut port_seen = false;

    for directive in &block.directives {
        let value = directive.value();
        let keyword = directive.keyword.to_ascii_lowercase();
        match keyword.as_str() {
            "hostname" if fragment.host == defaults::HOST => fragment.host = value,
            "user" if fragment.user.is_empty() => fragment.user = value,
            "port" if !port_seen => {
                fragment.port = parse_port(&value, source_ref, directive.line)?;
                port_seen = true;
            }
            "identityfile" if fragment.key_file == defaults::KEY_FILE => {
                fragment.key_file = value
            }
            "proxyjump" if fragment.jump_host.is_none() => fragment.jump_host = Some(value),
            "localforward" | "remoteforward" => {
                let parsed = match directive.args.as_slice() {
                    [listen, target] => listen_port(listen).zip(host_port(target)),
                    _ => None,
                };
                match parsed {
                    Some((listen, (host, port))) if keyword == "localforward" => {
                        fragment.local_forwards.push(PortForward {
                            local_port: listen,
                            remote_host: host,
                            remote_port: port,
                        })
                    }
                    Some((listen, (host, port))) => fragment.remote_forwards.push(RemoteForward {
                        remote_port: listen,
                        local_host: host,
                        local_port: port,
                    }),
                    None => warn!(
                        "[Parser] {}:{} unsupported {} '{}'",
                        source_ref,
                        directive.line + 1,
                        directive.keyword,
                        value
                    ),
                }
            }
            "dynamicforward" => fragment.dynamic_forward = listen_port(&value),
            "serveraliveinterval" => fragment.advanced.server_alive_interval = value.parse().ok(),
            "serveralivecountmax" => fragment.advanced.server_alive_count_max = value.parse().ok(),
            "connecttimeout" => fragment.advanced.connect_timeout = value.parse().ok(),
            "compression" => fragment.advanced.compression = yes_no(&value),
            "stricthostkeychecking" => fragment.advanced.strict_host_key_checking = Some(value),
            "controlmaster" => fragment.advanced.control_master = Some(value),
            "controlpath" => fragment.advanced.control_path = Some(value),
            "controlpersist" => fragment.advanced.control_persist = Some(value),
            "forwardx11" => {
                fragment.forward_x11 = yes_no(&value).unwrap_or(false);
                fragment.advanced.forward_x11 = yes_no(&value);
            }
            "forwardagent" => fragment.advanced.forward_agent = yes_no(&value),
            _ => {}
        }
    }

    Ok(fragment)
}

/// 交给 ssh2-config 复核的指令
const CROSS_CHECK_KEYWORDS: [&str; 4] = ["host", "hostname", "user", "port"];

/// 用 ssh2-config 独立解析片段的核心字段，返回与本地解析不一致之处
pub fn cross_check(text: &str, fragment: &ParsedFragment) -> Vec<String> {
    let core: String = text
        .lines()
        .filter(|line| {
            matches!(
                tokenize_line(line),
                Ok(Some((keyword, _)))
                    if CROSS_CHECK_KEYWORDS.contains(&keyword.to_ascii_lowercase().as_str())
            )
        })
        .map(|line| format!("{}\n", line.trim()))
        .collect();

    let mut reader = BufReader::new(core.as_bytes());
    let config = match SshConfig::default().parse(&mut reader, ParseRule::STRICT) {
        Ok(config) => config,
        Err(e) => return vec![format!("ssh2-config could not parse fragment: {}", e)],
    };
    let Some(host) = config
        .get_hosts()
        .iter()
        .find(|h| h.pattern.iter().any(|p| p.pattern == fragment.name))
    else {
        return vec![format!("ssh2-config found no Host block for '{}'", fragment.name)];
    };

    let mut mismatches = Vec::new();
    let params = &host.params;
    if let Some(host_name) = params.host_name.as_deref() {
        if host_name != fragment.host {
            mismatches.push(format!(
                "HostName read as '{}' by ssh2-config but '{}' here",
                host_name, fragment.host
            ));
        }
    }
    if let Some(user) = params.user.as_deref() {
        if user != fragment.user {
            mismatches.push(format!(
                "User read as '{}' by ssh2-config but '{}' here",
                user, fragment.user
            ));
        }
    }
    if let Some(port) = params.port {
        if port != fragment.port {
            mismatches.push(format!(
                "Port read as {} by ssh2-config but {} here",
                port, fragment.port
            ));
        }
    }
    mismatches
}

/// 推测模板类型（仅用于预选编辑表单，可能误判）
pub fn detect_template(fragment: &ParsedFragment) -> &'static str {
    const AWS_USERS: [&str; 5] = ["ec2-user", "ubuntu", "centos", "bitnami", "admin"];
    const DEV_HINTS: [&str; 5] = ["dev", "local", "staging", "test", "sandbox"];

    let host = fragment.host.to_ascii_lowercase();
    let name = fragment.name.to_ascii_lowercase();

    if fragment
        .jump_host
        .as_deref()
        .is_some_and(|j| !j.is_empty())
        || name.contains("bastion")
    {
        return "jump-host";
    }
    if fragment.dynamic_forward.is_some() {
        return "tunnel";
    }
    if fragment.forward_x11 {
        return "developer";
    }
    if !fragment.local_forwards.is_empty() || !fragment.remote_forwards.is_empty() {
        return "port-forward";
    }
    if host.contains("amazonaws.com") || AWS_USERS.contains(&fragment.user.as_str()) {
        return "aws-ec2";
    }
    if DEV_HINTS.iter().any(|h| host.contains(h) || name.contains(h)) {
        return "development";
    }
    defaults::TEMPLATE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_line_forms() {
        assert_eq!(tokenize_line("   ").unwrap(), None);
        assert_eq!(tokenize_line("  # note").unwrap(), None);
        assert_eq!(
            tokenize_line("    HostName 10.0.0.5").unwrap(),
            Some(("HostName".to_string(), vec!["10.0.0.5".to_string()]))
        );
        assert_eq!(
            tokenize_line("Port=2222").unwrap(),
            Some(("Port".to_string(), vec!["2222".to_string()]))
        );
        assert_eq!(
            tokenize_line("IdentityFile \"~/my keys/id\" # trailing").unwrap(),
            Some(("IdentityFile".to_string(), vec!["~/my keys/id".to_string()]))
        );
    }

    #[test]
    fn test_tokenize_line_errors() {
        assert!(tokenize_line("IdentityFile \"~/open").is_err());
        assert!(tokenize_line("= value").is_err());
        assert!(tokenize_line("Host{ x").is_err());
    }

    #[test]
    fn test_parse_config_blocks() {
        let text = "Include ~/other/*.conf\nUser global\n\nHost a b\n    HostName 1.1.1.1\n\n# next\nHost *\n    ServerAliveInterval 30\nMatch host x\n    User y\nHost c\n";
        let parsed = parse_config(text, "main").unwrap();
        assert_eq!(parsed.includes.len(), 1);
        assert_eq!(parsed.global.len(), 2);
        assert_eq!(parsed.hosts.len(), 3);

        let ab = &parsed.hosts[0];
        assert_eq!(ab.patterns, vec!["a", "b"]);
        assert_eq!(ab.start_line, 3);
        assert_eq!(ab.end_line, 5);
        assert_eq!(ab.get("hostname").as_deref(), Some("1.1.1.1"));

        assert!(HostBlock::is_wildcard(&parsed.hosts[1].patterns[0]));
        assert_eq!(parsed.hosts[1].end_line, 9);
        assert!(parsed.find_host("c").is_some());
        assert!(parsed.find_host("y").is_none());
    }

    #[test]
    fn test_parse_config_reports_line() {
        let err = parse_config("Host ok\n    User \"broken\n", "frag").unwrap_err();
        match err {
            ManagerError::Parse {
                source_ref, line, ..
            } => {
                assert_eq!(source_ref, "frag");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(parse_config("Host\n", "frag").is_err());
    }

    #[test]
    fn test_parse_fragment_defaults() {
        let fragment = parse_fragment("Host bare\n", "bare").unwrap();
        assert_eq!(fragment.name, "bare");
        assert_eq!(fragment.host, "unknown");
        assert_eq!(fragment.port, 22);
        assert_eq!(fragment.key_file, "~/.ssh/id_ed25519");
        assert_eq!(fragment.icon, "💻");
        assert_eq!(fragment.user, "");
    }

    #[test]
    fn test_parse_fragment_fields() {
        let text = "# SSH Manager Icon: 🚀\nHost web\n    HostName web.example.com\n    User deploy\n    Port 2222\n    IdentityFile ~/.ssh/web\n    ProxyJump bastion\n    LocalForward 8080 localhost:80\n    RemoteForward 9000 127.0.0.1:3000\n    DynamicForward 1080\n    Compression no\n    ServerAliveInterval 30\n";
        let fragment = parse_fragment(text, "web").unwrap();
        assert_eq!(fragment.icon, "🚀");
        assert_eq!(fragment.host, "web.example.com");
        assert_eq!(fragment.user, "deploy");
        assert_eq!(fragment.port, 2222);
        assert_eq!(fragment.key_file, "~/.ssh/web");
        assert_eq!(fragment.jump_host.as_deref(), Some("bastion"));
        assert_eq!(
            fragment.local_forwards,
            vec![PortForward {
                local_port: 8080,
                remote_host: "localhost".to_string(),
                remote_port: 80
            }]
        );
        assert_eq!(fragment.remote_forwards[0].local_host, "127.0.0.1");
        assert_eq!(fragment.remote_forwards[0].local_port, 3000);
        assert_eq!(fragment.dynamic_forward, Some(1080));
        assert_eq!(fragment.advanced.compression, Some(false));
        assert_eq!(fragment.advanced.server_alive_interval, Some(30));
    }

    #[test]
    fn test_parse_fragment_invalid_port() {
        assert!(matches!(
            parse_fragment("Host x\n    Port 70000\n", "x"),
            Err(ManagerError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_template_metadata_round_trip() {
        assert_eq!(read_icon("Host x\n"), None);
        assert_eq!(read_template("Host x\n"), None);
        let text = with_metadata("🐧", "aws-ec2", "# AWS EC2 Instance\nHost x\n");
        assert_eq!(
            text,
            "# SSH Manager Icon: 🐧\n# SSH Manager Template: aws-ec2\n# AWS EC2 Instance\nHost x\n"
        );
        assert_eq!(read_template(&text).as_deref(), Some("aws-ec2"));
        assert_eq!(read_icon(&text).as_deref(), Some("🐧"));

        // 重新写入时替换旧的头部，不会叠加
        let rewritten = with_metadata("🔥", "basic-server", &text);
        assert_eq!(
            rewritten,
            "# SSH Manager Icon: 🔥\n# SSH Manager Template: basic-server\n# AWS EC2 Instance\nHost x\n"
        );

        let fragment = parse_fragment(&rewritten, "x").unwrap();
        assert_eq!(fragment.template.as_deref(), Some("basic-server"));
        // Host 之后的同名注释不算头部
        assert_eq!(
            read_template("Host x\n# SSH Manager Template: tunnel\n"),
            None
        );
    }

    #[test]
    fn test_parse_fragment_first_value_wins() {
        let text = "Host x\n    Port 2200\n    Port 2300\n    ProxyJump first\n    ProxyJump second\n    HostName a\n    HostName b\n";
        let fragment = parse_fragment(text, "x").unwrap();
        assert_eq!(fragment.port, 2200);
        assert_eq!(fragment.jump_host.as_deref(), Some("first"));
        assert_eq!(fragment.host, "a");
    }

    #[test]
    fn test_cross_check_agrees_with_parser() {
        let text = "# SSH Manager Icon: 💻\n# SSH Manager Template: basic-server\nHost web\n    HostName web.example.com\n    User deploy\n    Port 2222\n    IdentityFile ~/.ssh/web\n    ControlMaster auto\n";
        let fragment = parse_fragment(text, "web").unwrap();
        assert!(cross_check(text, &fragment).is_empty());
    }

    #[test]
    fn test_cross_check_reports_missing_host() {
        let text = "Host web\n    HostName web.example.com\n";
        let mut fragment = parse_fragment(text, "web").unwrap();
        fragment.name = "other".to_string();
        assert_eq!(cross_check(text, &fragment).len(), 1);
    }

    #[test]
    fn test_detect_template() {
        let mut fragment = parse_fragment("Host plain\n    HostName 10.1.1.1\n", "p").unwrap();
        assert_eq!(detect_template(&fragment), "basic-server");

        fragment.user = "ec2-user".to_string();
        assert_eq!(detect_template(&fragment), "aws-ec2");

        fragment.user = "root".to_string();
        fragment.host = "dev.internal".to_string();
        assert_eq!(detect_template(&fragment), "development");

        fragment.dynamic_forward = Some(1080);
        assert_eq!(detect_template(&fragment), "tunnel");

        fragment.jump_host = Some("bastion".to_string());
        assert_eq!(detect_template(&fragment), "jump-host");
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(quote_value("~/.ssh/id"), "~/.ssh/id");
        assert_eq!(quote_value("~/my keys/id"), "\"~/my keys/id\"");
    }
}
