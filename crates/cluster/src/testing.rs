/// 测试辅助：内存版远程命令通道与可达性探测器

use async_trait::async_trait;
use common::models::{NodeLabels, VmPlacement};
use common::{Error, NodeDefinition, NodeRole, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::reachable::ReachabilityProbe;
use crate::shell::{CommandResponse, RemoteCommand, RemoteShell, SshCredentials, SshEndpoint};

/// 构造一个测试节点定义
pub fn sample_node(name: &str, role: NodeRole, address: &str) -> NodeDefinition {
    NodeDefinition {
        name: name.to_string(),
        role,
        address: address.parse().expect("valid test address"),
        public_address: None,
        labels: NodeLabels::default(),
        vm: VmPlacement::default(),
    }
}

/// 内存版 RemoteShell
///
/// 记录所有命令；按地址识别幂等标记的 `test -f` / `touch`，其余命令默认成功。
#[derive(Default)]
pub struct MemoryShell {
    commands: Mutex<Vec<(String, String)>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    files: Mutex<HashSet<(String, String)>>,
    failures: Mutex<Vec<(String, i32)>>,
    responses: Mutex<Vec<(String, String)>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MemoryShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有已执行的命令：(地址, 命令)
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    /// 发往指定地址的命令
    pub fn commands_for(&self, address: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c)
            .collect()
    }

    /// 所有上传：(命令, 内容)
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    /// 任一地址上存在该文件
    pub fn file_exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().iter().any(|(_, p)| p == path)
    }

    pub fn file_exists_on(&self, address: &str, path: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .contains(&(address.to_string(), path.to_string()))
    }

    /// 包含 `pattern` 的命令返回指定退出码
    pub fn fail_matching(&self, pattern: &str, exit_code: i32) {
        self.failures.lock().unwrap().push((pattern.to_string(), exit_code));
    }

    /// 包含 `pattern` 的命令返回指定标准输出
    pub fn respond_matching(&self, pattern: &str, stdout: &str) {
        self.responses.lock().unwrap().push((pattern.to_string(), stdout.to_string()));
    }

    /// 指定地址的连接全部失败
    pub fn set_unreachable(&self, address: &str) {
        self.unreachable.lock().unwrap().insert(address.to_string());
    }
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('\'').to_string()
}

#[async_trait]
impl RemoteShell for MemoryShell {
    async fn execute(
        &self,
        endpoint: &SshEndpoint,
        _credentials: &SshCredentials,
        command: &RemoteCommand,
    ) -> Result<CommandResponse> {
        if self.unreachable.lock().unwrap().contains(&endpoint.address) {
            return Err(Error::Remote(format!("{} unreachable", endpoint)));
        }

        let text = command.command.clone();
        self.commands
            .lock()
            .unwrap()
            .push((endpoint.address.clone(), text.clone()));

        if let Some(input) = &command.input {
            self.uploads.lock().unwrap().push((text.clone(), input.clone()));
        }

        for (pattern, exit_code) in self.failures.lock().unwrap().iter() {
            if text.contains(pattern.as_str()) {
                return Ok(CommandResponse {
                    exit_code: *exit_code,
                    stdout: String::new(),
                    stderr: "simulated failure".to_string(),
                });
            }
        }

        if let Some(path) = text.strip_prefix("test -f ") {
            let exists = self.file_exists_on(&endpoint.address, &unquote(path));
            return Ok(CommandResponse {
                exit_code: if exists { 0 } else { 1 },
                ..Default::default()
            });
        }

        if let Some(path) = text.rsplit(" && touch ").next().filter(|_| text.contains(" && touch ")) {
            self.files
                .lock()
                .unwrap()
                .insert((endpoint.address.clone(), unquote(path)));
        }

        let stdout = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| text.contains(pattern.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();

        Ok(CommandResponse {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

/// 固定结果的可达性探测器
#[derive(Default)]
pub struct StaticProbe {
    reachable: Mutex<HashSet<String>>,
    probes: Mutex<HashMap<String, usize>>,
}

impl StaticProbe {
    pub fn new<I, S>(reachable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reachable: Mutex::new(reachable.into_iter().map(Into::into).collect()),
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let mut hosts = self.reachable.lock().unwrap();
        if reachable {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    /// 指定主机被探测的次数
    pub fn probe_count(&self, host: &str) -> usize {
        self.probes.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn probe(&self, host: &str) -> bool {
        *self.probes.lock().unwrap().entry(host.to_string()).or_default() += 1;
        self.reachable.lock().unwrap().contains(host)
    }
}
