/// 远程命令通道
///
/// 节点上的所有操作都通过 [`RemoteShell`] 执行；默认实现调用系统 `ssh` 客户端

use async_trait::async_trait;
use common::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// SSH 登录凭据
#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub username: String,
    /// 私钥文件，缺省使用 ssh 客户端自己的配置
    pub private_key: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshCredentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            private_key: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }
}

/// SSH 连接端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// 待执行的远程命令
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub command: String,
    pub sudo: bool,
    /// 通过标准输入传给命令的数据（上传文件时使用）
    pub input: Option<Vec<u8>>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sudo: false,
            input: None,
        }
    }

    pub fn sudo(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sudo: true,
            input: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// 在远端 shell 中实际执行的命令行
    pub fn script(&self) -> String {
        if self.sudo {
            format!("sudo -n bash -c {}", shell_quote(&self.command))
        } else {
            format!("bash -c {}", shell_quote(&self.command))
        }
    }
}

/// 命令执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// 非零退出码转换为 [`Error::CommandFailed`]
    pub fn ensure_success(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// 远程命令通道抽象
#[async_trait]
pub trait RemoteShell: Send + Sync + 'static {
    /// 执行一条命令；传输失败返回 `Err`，命令本身失败体现在退出码中
    async fn execute(
        &self,
        endpoint: &SshEndpoint,
        credentials: &SshCredentials,
        command: &RemoteCommand,
    ) -> Result<CommandResponse>;
}

/// 基于系统 `ssh` 客户端的实现
#[derive(Debug, Clone, Default)]
pub struct SshShell;

/// ssh 客户端自身出错（连接失败、认证失败）时的退出码
const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

impl SshShell {
    pub fn new() -> Self {
        Self
    }

    /// 构造 ssh 命令行参数
    fn build_args(
        endpoint: &SshEndpoint,
        credentials: &SshCredentials,
        command: &RemoteCommand,
    ) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", credentials.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            endpoint.port.to_string(),
        ];

        if let Some(key) = &credentials.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        args.push(format!("{}@{}", credentials.username, endpoint.address));
        args.push(command.script());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn execute(
        &self,
        endpoint: &SshEndpoint,
        credentials: &SshCredentials,
        command: &RemoteCommand,
    ) -> Result<CommandResponse> {
        debug!("ssh {}: {}", endpoint, command.command);

        let mut child = Command::new("ssh")
            .args(Self::build_args(endpoint, credentials, command))
            .stdin(if command.input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Remote(format!("无法启动 ssh: {}", e)))?;

        if let Some(input) = &command.input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input)
                    .await
                    .map_err(|e| Error::Remote(format!("写入远程标准输入失败 ({}): {}", endpoint, e)))?;
                // 关闭 stdin，远端才能读到 EOF
                drop(stdin);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Remote(format!("等待 ssh 结束失败 ({}): {}", endpoint, e)))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if exit_code == SSH_TRANSPORT_EXIT_CODE {
            return Err(Error::Remote(format!("连接 {} 失败: {}", endpoint, stderr.trim())));
        }

        Ok(CommandResponse {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

/// 单引号转义，生成可安全拼接进 shell 的参数
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
