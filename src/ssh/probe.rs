// 系统 ssh 客户端探测
//
// 所有探测都有超时；失败按 stderr 特征分类，网络层失败不视为配置错误。

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::ManagerSettings;

/// 网络层失败特征
const NETWORK_SIGNATURES: [&str; 7] = [
    "could not resolve hostname",
    "connection timed out",
    "operation timed out",
    "connection refused",
    "connection closed",
    "no route to host",
    "network is unreachable",
];

/// 已连上主机、只差认证的特征
const AUTH_SIGNATURES: [&str; 4] = [
    "permission denied",
    "host key verification failed",
    "too many authentication failures",
    "no supported authentication methods",
];

/// 连接测试结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Reachable,
    /// 主机可达，但批处理模式下无法完成认证
    AuthenticationRequired,
    Unreachable { reason: String },
    ConfigDefect { message: String },
    ClientUnavailable,
}

impl ProbeOutcome {
    /// 配置本身是否可用（主机不可达也算）
    pub fn config_ok(&self) -> bool {
        !matches!(self, ProbeOutcome::ConfigDefect { .. })
    }
}

/// `ssh -G` 配置检查结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfigCheck {
    Valid,
    Invalid { message: String },
    ClientUnavailable,
    TimedOut,
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

/// 按退出码和 stderr 分类
pub fn classify(exit_code: Option<i32>, stderr: &str) -> ProbeOutcome {
    if exit_code == Some(0) {
        return ProbeOutcome::Reachable;
    }
    let lower = stderr.to_ascii_lowercase();
    if AUTH_SIGNATURES.iter().any(|s| lower.contains(s)) {
        return ProbeOutcome::AuthenticationRequired;
    }
    if NETWORK_SIGNATURES.iter().any(|s| lower.contains(s)) {
        return ProbeOutcome::Unreachable {
            reason: first_line(stderr),
        };
    }
    let message = stderr.trim();
    ProbeOutcome::ConfigDefect {
        message: if message.is_empty() {
            match exit_code {
                Some(code) => format!("ssh exited with status {}", code),
                None => "ssh terminated by signal".to_string(),
            }
        } else {
            message.to_string()
        },
    }
}

enum RunError {
    ClientUnavailable,
    TimedOut,
}

/// ssh 客户端探测器
#[derive(Clone, Debug)]
pub struct SshProbe {
    binary: String,
    timeout: Duration,
}

impl SshProbe {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &ManagerSettings) -> Self {
        Self::new(
            settings.ssh_binary.clone(),
            Duration::from_secs(settings.probe_timeout_secs.max(1)),
        )
    }

    /// 运行 ssh，返回 (退出码, stderr)
    async fn run(&self, args: &[String]) -> Result<(Option<i32>, String), RunError> {
        debug!("[Probe] {} {}", self.binary, args.join(" "));
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => Err(RunError::TimedOut),
            Ok(Err(e)) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("[Probe] Failed to start {}: {}", self.binary, e);
                }
                Err(RunError::ClientUnavailable)
            }
            Ok(Ok(output)) => Ok((
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            )),
        }
    }

    /// 用单个片段作为配置文件测试连接
    pub async fn test_fragment(&self, fragment: &Path, name: &str) -> ProbeOutcome {
        let connect_timeout = self.timeout.as_secs().max(1);
        let args = vec![
            "-F".to_string(),
            fragment.to_string_lossy().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout),
            name.to_string(),
            "exit".to_string(),
        ];
        match self.run(&args).await {
            Ok((code, stderr)) => classify(code, &stderr),
            Err(RunError::ClientUnavailable) => ProbeOutcome::ClientUnavailable,
            Err(RunError::TimedOut) => ProbeOutcome::Unreachable {
                reason: format!("no response within {}s", self.timeout.as_secs()),
            },
        }
    }

    /// `ssh -G` 解析完整配置，不建立连接
    pub async fn check_config(&self, config: &Path, host: &str) -> ConfigCheck {
        let args = vec![
            "-G".to_string(),
            "-F".to_string(),
            config.to_string_lossy().to_string(),
            host.to_string(),
        ];
        match self.run(&args).await {
            Ok((Some(0), _)) => ConfigCheck::Valid,
            Ok((code, stderr)) => ConfigCheck::Invalid {
                message: match first_line(&stderr) {
                    line if line.is_empty() => format!("ssh -G exited with {:?}", code),
                    line => line,
                },
            },
            Err(RunError::ClientUnavailable) => ConfigCheck::ClientUnavailable,
            Err(RunError::TimedOut) => ConfigCheck::TimedOut,
        }
    }
}
