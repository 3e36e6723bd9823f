/// 节点代理
///
/// 负责对单个集群节点执行远程命令、上传文件、重启，并记录节点的
/// 配置状态（状态文本 + 故障标记）。幂等操作通过节点上的标记文件实现，
/// 重复执行时会跳过已经完成的操作。

use chrono::{DateTime, Utc};
use common::models::constants::{DEFAULT_SSH_PORT, NODE_STATE_DIR};
use common::{Error, NodeDefinition, NodeRole, Result};
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::shell::{shell_quote, CommandResponse, RemoteCommand, RemoteShell, SshCredentials, SshEndpoint};

/// 节点配置状态
#[derive(Debug, Clone)]
struct NodeState {
    status: String,
    fault: Option<String>,
    updated_at: DateTime<Utc>,
}

/// 节点状态快照（用于进度展示）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    pub status: String,
    pub fault: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub struct NodeProxy {
    name: String,
    role: NodeRole,
    configured_address: Ipv4Addr,
    address: Mutex<Ipv4Addr>,
    port: u16,
    credentials: SshCredentials,
    shell: Arc<dyn RemoteShell>,
    state: Mutex<NodeState>,
    state_dir: String,
    poll_interval: Duration,
}

impl NodeProxy {
    pub fn new(
        definition: &NodeDefinition,
        credentials: SshCredentials,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        Self {
            name: definition.name.clone(),
            role: definition.role,
            configured_address: definition.address,
            address: Mutex::new(definition.address),
            port: DEFAULT_SSH_PORT,
            credentials,
            shell,
            state: Mutex::new(NodeState {
                status: String::new(),
                fault: None,
                updated_at: Utc::now(),
            }),
            state_dir: NODE_STATE_DIR.to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 轮询间隔（等待上线、等待启动）
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    pub fn is_worker(&self) -> bool {
        self.role == NodeRole::Worker
    }

    /// 集群定义中配置的地址
    pub fn configured_address(&self) -> Ipv4Addr {
        self.configured_address
    }

    /// 当前用于连接的地址
    pub fn address(&self) -> Ipv4Addr {
        *self.address.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_address(&self, address: Ipv4Addr) {
        *self.address.lock().unwrap_or_else(|e| e.into_inner()) = address;
    }

    /// 临时替换连接地址，返回的守卫在离开作用域时恢复原地址
    pub fn override_address(&self, address: Ipv4Addr) -> AddressOverride<'_> {
        let previous = self.address();
        debug!("[{}] 临时使用地址 {} (原地址 {})", self.name, address, previous);
        self.set_address(address);
        AddressOverride { node: self, previous }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> SshEndpoint {
        SshEndpoint {
            address: self.address().to_string(),
            port: self.port,
        }
    }

    // ---- 状态 ----

    pub fn status(&self) -> String {
        self.lock_state().status.clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        info!("[{}] {}", self.name, status);

        let mut state = self.lock_state();
        state.status = status;
        state.updated_at = Utc::now();
    }

    /// 标记节点故障；故障标记一经设置不可撤销，保留第一次的故障原因
    pub fn fault(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.lock_state();

        if state.fault.is_some() {
            warn!("[{}] 已处于故障状态，忽略: {}", self.name, message);
            return;
        }

        error!("❌ [{}] 故障: {}", self.name, message);
        state.status = format!("故障: {}", message);
        state.fault = Some(message);
        state.updated_at = Utc::now();
    }

    pub fn is_faulted(&self) -> bool {
        self.lock_state().fault.is_some()
    }

    pub fn fault_message(&self) -> Option<String> {
        self.lock_state().fault.clone()
    }

    pub fn snapshot(&self) -> NodeStatus {
        let state = self.lock_state();
        NodeStatus {
            name: self.name.clone(),
            status: state.status.clone(),
            fault: state.fault.clone(),
            updated_at: state.updated_at,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- 远程命令 ----

    async fn execute(&self, command: RemoteCommand) -> Result<CommandResponse> {
        self.shell
            .execute(&self.endpoint(), &self.credentials, &command)
            .await
    }

    /// 以当前用户执行命令
    pub async fn run_command(&self, command: &str) -> Result<CommandResponse> {
        self.execute(RemoteCommand::new(command)).await
    }

    /// 以 root 身份执行命令，非零退出码不视为错误
    pub async fn sudo_command(&self, command: &str) -> Result<CommandResponse> {
        self.execute(RemoteCommand::sudo(command)).await
    }

    /// 以 root 身份执行命令，非零退出码返回 [`Error::CommandFailed`]
    pub async fn sudo_command_checked(&self, command: &str) -> Result<CommandResponse> {
        self.sudo_command(command).await?.ensure_success(command)
    }

    /// 上传文本文件
    pub async fn upload_text(&self, path: &str, text: &str, mode: &str) -> Result<()> {
        self.upload_bytes(path, text.as_bytes().to_vec(), mode).await
    }

    /// 上传本地文件
    pub async fn upload_file(&self, local: &Path, path: &str, mode: &str) -> Result<()> {
        let bytes = tokio::fs::read(local).await?;
        self.upload_bytes(path, bytes, mode).await
    }

    async fn upload_bytes(&self, path: &str, bytes: Vec<u8>, mode: &str) -> Result<()> {
        let remote = Path::new(path);
        if !remote.is_absolute() {
            return Err(Error::InvalidArgument(format!("远程路径必须为绝对路径: {}", path)));
        }

        let parent = remote
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());

        let script = format!(
            "mkdir -p {dir} && cat > {path} && chmod {mode} {path}",
            dir = shell_quote(&parent),
            path = shell_quote(path),
            mode = mode,
        );

        debug!("[{}] 上传 {} ({} 字节)", self.name, path, bytes.len());
        self.execute(RemoteCommand::sudo(script.clone()).with_input(bytes))
            .await?
            .ensure_success(&script)?;
        Ok(())
    }

    /// 重启节点
    ///
    /// 重启命令在后台延迟执行，保证本次 ssh 会话可以正常返回。
    pub async fn reboot(&self, wait: bool, boot_timeout: Duration) -> Result<()> {
        self.set_status("重启中");
        self.sudo_command_checked("nohup sh -c 'sleep 2 && systemctl reboot' >/dev/null 2>&1 &")
            .await?;

        if wait {
            // 等待节点真正开始关机，避免连到即将关闭的旧会话
            sleep(self.poll_interval.max(Duration::from_secs(1))).await;
            self.wait_for_boot(boot_timeout).await?;
        }

        Ok(())
    }

    /// 等待节点 SSH 端口可连接
    pub async fn wait_for_online(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;

        loop {
            let address = (self.address(), self.port);
            let probe = timeout(Duration::from_secs(2), TcpStream::connect(address)).await;
            if let Ok(Ok(_)) = probe {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "节点 {} 在 {:?} 内未上线 ({}:{})",
                    self.name, limit, address.0, address.1
                )));
            }

            sleep(self.poll_interval).await;
        }
    }

    /// 等待节点完成启动：能够执行命令，且 systemd 启动流程结束
    pub async fn wait_for_boot(&self, limit: Duration) -> Result<()> {
        self.set_status("等待系统启动");
        let deadline = Instant::now() + limit;

        loop {
            match self.run_command("true").await {
                Ok(response) if response.success() => break,
                Ok(response) => {
                    debug!("[{}] 节点尚未就绪 (退出码 {})", self.name, response.exit_code)
                }
                Err(e) => debug!("[{}] 节点尚未就绪: {}", self.name, e),
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "节点 {} 在 {:?} 内未完成启动",
                    self.name, limit
                )));
            }

            sleep(self.poll_interval).await;
        }

        // degraded 也视为启动完成，这里只需要等待启动流程结束
        let response = self.sudo_command("systemctl is-system-running --wait").await?;
        debug!("[{}] 系统状态: {}", self.name, response.stdout.trim());
        Ok(())
    }

    // ---- 幂等操作 ----

    /// 幂等操作标识对应的标记文件，`/` 分隔的标识映射为状态目录下的子目录
    fn marker_path(&self, key: &str) -> Result<String> {
        let valid = !key.is_empty()
            && key.split('/').all(|segment| {
                !segment.is_empty()
                    && !segment.ends_with('.')
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c))
            });

        if !valid {
            return Err(Error::InvalidArgument(format!("无效的幂等操作标识: '{}'", key)));
        }

        Ok(format!("{}/{}", self.state_dir, key))
    }

    /// 检查幂等操作是否已经完成
    pub async fn idempotent_marker_exists(&self, key: &str) -> Result<bool> {
        let path = self.marker_path(key)?;
        let response = self
            .sudo_command(&format!("test -f {}", shell_quote(&path)))
            .await?;
        Ok(response.success())
    }

    /// 执行幂等操作
    ///
    /// 节点上存在标记文件时直接跳过，否则执行 `action` 并在成功后写入标记。
    /// 返回值表示本次是否真正执行了操作。
    pub async fn invoke_idempotent_action<F, Fut>(&self, key: &str, action: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.idempotent_marker_exists(key).await? {
            debug!("[{}] 跳过已完成的操作: {}", self.name, key);
            return Ok(false);
        }

        action().await?;

        let path = self.marker_path(key)?;
        let parent = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(self.state_dir.as_str());
        self.sudo_command_checked(&format!(
            "mkdir -p {} && touch {}",
            shell_quote(parent),
            shell_quote(&path)
        ))
        .await?;

        Ok(true)
    }
}

/// 地址替换守卫，离开作用域时恢复节点原来的连接地址
pub struct AddressOverride<'a> {
    node: &'a NodeProxy,
    previous: Ipv4Addr,
}

impl Drop for AddressOverride<'_> {
    fn drop(&mut self) {
        debug!("[{}] 恢复地址 {}", self.node.name, self.previous);
        self.node.set_address(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_node, MemoryShell};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node_with(shell: Arc<MemoryShell>) -> NodeProxy {
        NodeProxy::new(&sample_node("master-0", NodeRole::Master, "10.0.1.10"), SshCredentials::new("sysadmin"), shell)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_idempotent_action_runs_once() {
        let shell = Arc::new(MemoryShell::new());
        let node = node_with(shell.clone());
        let calls = AtomicUsize::new(0);

        let first = node
            .invoke_idempotent_action("setup/static-ip", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        let commands_after_first = shell.commands().len();

        let second = node
            .invoke_idempotent_action("setup/static-ip", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // 第二次只做了一次标记检查，没有其他副作用
        assert_eq!(shell.commands().len(), commands_after_first + 1);
        assert!(shell.file_exists("/var/lib/cluster-setup/state/setup/static-ip"));
        assert!(shell
            .commands()
            .iter()
            .any(|(_, c)| c.starts_with("mkdir -p '/var/lib/cluster-setup/state/setup' && touch")));
    }

    #[tokio::test]
    async fn test_idempotent_keys_do_not_collide() {
        let shell = Arc::new(MemoryShell::new());
        let node = node_with(shell.clone());

        assert!(node.invoke_idempotent_action("setup/static-ip", || async { Ok(()) }).await.unwrap());
        assert!(node.invoke_idempotent_action("setup-static-ip", || async { Ok(()) }).await.unwrap());

        assert!(shell.file_exists("/var/lib/cluster-setup/state/setup/static-ip"));
        assert!(shell.file_exists("/var/lib/cluster-setup/state/setup-static-ip"));
    }

    #[tokio::test]
    async fn test_failed_idempotent_action_leaves_no_marker() {
        let shell = Arc::new(MemoryShell::new());
        let node = node_with(shell.clone());

        let result = node
            .invoke_idempotent_action("setup/grow-root", || async {
                Err(Error::Remote("connection reset".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert!(!node.idempotent_marker_exists("setup/grow-root").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_idempotent_key() {
        let shell = Arc::new(MemoryShell::new());
        let node = node_with(shell.clone());

        assert!(node.invoke_idempotent_action("../etc", || async { Ok(()) }).await.is_err());
        assert!(node.invoke_idempotent_action("Setup", || async { Ok(()) }).await.is_err());
        // 标记会落在状态目录本身或其上级
        for key in [".", "..", "setup/.", "setup/..", "a.", "/setup", "setup//ip", "setup/"] {
            assert!(
                node.invoke_idempotent_action(key, || async { Ok(()) }).await.is_err(),
                "{}",
                key
            );
        }
        assert!(shell.commands().is_empty());
    }

    #[test]
    fn test_fault_is_a_one_way_latch() {
        let node = node_with(Arc::new(MemoryShell::new()));
        assert!(!node.is_faulted());

        node.fault("address timeout");
        node.set_status("still running");
        node.fault("second fault");

        assert!(node.is_faulted());
        assert_eq!(node.fault_message().as_deref(), Some("address timeout"));
    }

    #[test]
    fn test_address_override_restored_on_drop() {
        let node = node_with(Arc::new(MemoryShell::new()));
        let dhcp: Ipv4Addr = "192.168.122.55".parse().unwrap();

        {
            let _guard = node.override_address(dhcp);
            assert_eq!(node.address(), dhcp);
            assert_eq!(node.endpoint().address, "192.168.122.55");
        }

        assert_eq!(node.address(), node.configured_address());
    }

    #[tokio::test]
    async fn test_address_override_restored_on_error() {
        let shell = Arc::new(MemoryShell::new());
        let node = node_with(shell.clone());
        shell.fail_matching("netplan", 1);

        async fn configure(node: &NodeProxy) -> Result<()> {
            let _guard = node.override_address("192.168.122.60".parse().unwrap());
            node.sudo_command_checked("netplan generate").await?;
            Ok(())
        }

        assert!(configure(&node).await.is_err());
        assert_eq!(node.address(), "10.0.1.10".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_upload_text() {
        let shell = Arc::new(MemoryShell::new());
        let node = node_with(shell.clone());

        node.upload_text("/etc/netplan/50-cluster.yaml", "network: {}\n", "600")
            .await
            .unwrap();

        let uploads = shell.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].0.contains("'/etc/netplan/50-cluster.yaml'"));
        assert_eq!(uploads[0].1, b"network: {}\n".to_vec());

        assert!(node.upload_text("relative/path", "x", "644").await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_boot_times_out() {
        let shell = Arc::new(MemoryShell::new());
        shell.set_unreachable("10.0.1.10");
        let node = node_with(shell);

        let result = node.wait_for_boot(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_for_online() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let definition = sample_node("worker-0", NodeRole::Worker, "127.0.0.1");
        let node = NodeProxy::new(&definition, SshCredentials::new("sysadmin"), Arc::new(MemoryShell::new()))
            .with_port(port)
            .with_poll_interval(Duration::from_millis(10));

        node.wait_for_online(Duration::from_secs(2)).await.unwrap();
    }
}
