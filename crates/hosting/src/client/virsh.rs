/// 基于 `virsh` 命令行的虚拟化客户端
///
/// 同一实现既可以连接本机 (`qemu:///system`)，也可以通过 `qemu+ssh://` 连接远程
/// hypervisor。每条命令的输出都解析为强类型结构，格式不符时返回
/// [`Error::Hypervisor`]。磁盘以存储卷的形式保存在 libvirt 存储池中。

use async_trait::async_trait;
use common::models::{HypervisorHost, LocalHostingOptions};
use common::utils::validate_mac_address;
use common::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::command::{CommandRunner, LocalCommandRunner};
use super::xml;
use super::{
    HostAdapter, VirtualDrive, VirtualMachine, VirtualNetworkAdapter, VirtualSwitch,
    VirtualizationClient, VmSpec, VmState, SwitchType,
};

/// qcow2 镜像文件头
const QCOW2_MAGIC: [u8; 4] = [b'Q', b'F', b'I', 0xfb];

pub struct VirshClient {
    uri: String,
    storage_pool: String,
    /// 远程 hypervisor 的登录信息，用于在宿主机上执行 `ip` 等命令
    host: Option<HypervisorHost>,
    runner: Arc<dyn CommandRunner>,
    stop_timeout: Duration,
    poll_interval: Duration,
}

impl VirshClient {
    pub fn new(uri: impl Into<String>, storage_pool: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            storage_pool: storage_pool.into(),
            host: None,
            runner: Arc::new(LocalCommandRunner),
            stop_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// 本机 hypervisor
    pub fn local(options: &LocalHostingOptions) -> Self {
        Self::new(options.uri.clone(), options.storage_pool.clone())
    }

    /// 远程 hypervisor
    pub fn remote(host: &HypervisorHost, storage_pool: &str) -> Self {
        let mut client = Self::new(host.connection_uri(), storage_pool);
        client.host = Some(host.clone());
        client
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn storage_pool(&self) -> &str {
        &self.storage_pool
    }

    /// 执行 virsh 命令，返回标准输出
    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-c".to_string(), self.uri.clone()];
        full.extend(args.iter().map(|a| a.to_string()));

        let output = self.runner.run("virsh", &full).await?;
        if !output.success() {
            return Err(Error::Hypervisor(format!(
                "virsh {} 失败 ({}): {}",
                args.first().copied().unwrap_or_default(),
                self.uri,
                output.stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    /// 在 hypervisor 宿主机上执行命令（远程宿主机经由 ssh）
    async fn host_command(&self, program: &str, args: &[&str]) -> Result<String> {
        let (program, full) = match &self.host {
            Some(host) => {
                let mut full = vec![
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    format!("{}@{}", host.username, host.address),
                    program.to_string(),
                ];
                full.extend(args.iter().map(|a| a.to_string()));
                ("ssh", full)
            }
            None => (program, args.iter().map(|a| a.to_string()).collect()),
        };

        let output = self.runner.run(program, &full).await?;
        if !output.success() {
            return Err(Error::Hypervisor(format!(
                "{} 执行失败: {}",
                program,
                output.stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    async fn vm_state(&self, name: &str) -> Result<VmState> {
        let output = self.virsh(&["domstate", name]).await?;
        Ok(parse_vm_state(output.trim()))
    }

    /// 将 XML 写入临时文件后执行 virsh 命令
    async fn virsh_with_xml(&self, command: &str, content: &str) -> Result<String> {
        let mut file = tempfile::Builder::new().suffix(".xml").tempfile()?;
        file.write_all(content.as_bytes())?;
        file.flush()?;

        let path = file.path().display().to_string();
        self.virsh(&[command, path.as_str()]).await
    }

    async fn volume_path(&self, volume: &str) -> Result<PathBuf> {
        let output = self
            .virsh(&["vol-path", "--pool", self.storage_pool.as_str(), volume])
            .await?;
        parse_volume_path(&output)
    }

    async fn volume_capacity(&self, volume: &str) -> Result<u64> {
        let output = self
            .virsh(&["vol-info", "--pool", self.storage_pool.as_str(), volume, "--bytes"])
            .await?;
        parse_volume_capacity(&output)
    }

    /// 存储池中是否存在指定的存储卷
    async fn volume_exists(&self, volume: &str) -> Result<bool> {
        let args: Vec<String> = [
            "-c",
            self.uri.as_str(),
            "vol-info",
            "--pool",
            self.storage_pool.as_str(),
            volume,
        ]
        .iter()
        .map(|a| a.to_string())
        .collect();

        Ok(self.runner.run("virsh", &args).await?.success())
    }

    async fn interface_addresses(&self, vm: &str) -> HashMap<String, Vec<Ipv4Addr>> {
        let mut addresses: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();

        // 桥接网络没有 libvirt DHCP 租约，需要再查询 ARP 表
        for source in ["lease", "arp"] {
            let output = match self.virsh(&["domifaddr", vm, "--source", source]).await {
                Ok(output) => output,
                Err(e) => {
                    debug!("domifaddr --source {} 失败: {}", source, e);
                    continue;
                }
            };

            match parse_domifaddr(&output) {
                Ok(entries) => {
                    for (mac, address) in entries {
                        let list = addresses.entry(mac).or_default();
                        if !list.contains(&address) {
                            list.push(address);
                        }
                    }
                }
                Err(e) => warn!("⚠️ 无法解析 {} 的网卡地址: {}", vm, e),
            }

            if !addresses.is_empty() {
                break;
            }
        }

        addresses
    }
}

#[async_trait]
impl VirtualizationClient for VirshClient {
    fn describe(&self) -> String {
        self.uri.clone()
    }

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        let output = self.virsh(&["list", "--all"]).await?;
        parse_vm_list(&output)
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        info!("🖥️ 定义虚拟机 {} ({})", spec.name, self.uri);
        self.virsh_with_xml("define", &xml::domain_xml(spec)).await?;
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        match self.vm_state(name).await? {
            VmState::Running => {
                info!("✅ 虚拟机 {} 已经在运行", name);
                Ok(())
            }
            VmState::Paused => {
                info!("▶️ 恢复暂停的虚拟机: {}", name);
                self.virsh(&["resume", name]).await.map(|_| ())
            }
            _ => {
                info!("🚀 启动虚拟机: {}", name);
                self.virsh(&["start", name]).await.map(|_| ())
            }
        }
    }

    async fn stop_vm(&self, name: &str, force: bool) -> Result<()> {
        if !self.vm_state(name).await?.is_active() {
            return Ok(());
        }

        if force {
            info!("⚡ 强制停止虚拟机: {}", name);
            self.virsh(&["destroy", name]).await?;
            return Ok(());
        }

        info!("🔄 优雅停止虚拟机: {}", name);
        self.virsh(&["shutdown", name]).await?;

        let deadline = Instant::now() + self.stop_timeout;
        while Instant::now() < deadline {
            sleep(self.poll_interval).await;
            if self.vm_state(name).await? == VmState::Off {
                return Ok(());
            }
        }

        warn!("⚠️ 优雅停止超时，强制停止虚拟机: {}", name);
        self.virsh(&["destroy", name]).await?;
        Ok(())
    }

    async fn remove_vm(&self, name: &str) -> Result<()> {
        info!("🗑️ 删除虚拟机: {}", name);

        if self.vm_state(name).await?.is_active() {
            self.virsh(&["destroy", name]).await?;
        }

        self.virsh(&["undefine", name, "--remove-all-storage"]).await?;
        Ok(())
    }

    async fn list_switches(&self) -> Result<Vec<VirtualSwitch>> {
        let output = self.virsh(&["net-list", "--all", "--name"]).await?;
        let mut switches = Vec::new();

        for name in parse_name_list(&output) {
            let definition = self.virsh(&["net-dumpxml", name.as_str()]).await?;
            switches.push(VirtualSwitch {
                switch_type: xml::parse_switch_type(&definition)?,
                name,
            });
        }

        Ok(switches)
    }

    async fn create_external_switch(&self, name: &str, adapter: &HostAdapter) -> Result<VirtualSwitch> {
        info!("🌐 创建外部交换机 {} (宿主机网卡 {})", name, adapter.name);

        self.virsh_with_xml("net-define", &xml::external_network_xml(name, &adapter.name))
            .await?;
        self.virsh(&["net-start", name]).await?;
        self.virsh(&["net-autostart", name]).await?;

        Ok(VirtualSwitch {
            name: name.to_string(),
            switch_type: SwitchType::External,
        })
    }

    async fn list_host_adapters(&self) -> Result<Vec<HostAdapter>> {
        let output = self.host_command("ip", &["-j", "-4", "addr", "show"]).await?;
        parse_host_adapters(&output)
    }

    async fn create_drive(&self, name: &str, drive: &VirtualDrive) -> Result<PathBuf> {
        let size = drive.size.to_string();

        if let Some(path) = &drive.path {
            let target = path.display().to_string();
            self.host_command("qemu-img", &["create", "-f", drive.format(), target.as_str(), size.as_str()])
                .await?;
            return Ok(path.clone());
        }

        let volume = format!("{}.{}", name, drive.format());
        info!("💾 创建磁盘 {} ({} 字节, {})", volume, drive.size, drive.format());

        self.virsh(&[
            "vol-create-as",
            self.storage_pool.as_str(),
            volume.as_str(),
            size.as_str(),
            "--format",
            drive.format(),
        ])
        .await?;

        self.volume_path(&volume).await
    }

    async fn import_drive(&self, name: &str, source: &Path, size: u64) -> Result<PathBuf> {
        let format = detect_image_format(source).await?;
        let length = tokio::fs::metadata(source).await?.len();
        let volume = format!("{}.{}", name, format);
        let source_path = source.display().to_string();

        info!("📥 导入磁盘 {} ← {}", volume, source_path);

        self.virsh(&[
            "vol-create-as",
            self.storage_pool.as_str(),
            volume.as_str(),
            length.to_string().as_str(),
            "--format",
            format,
        ])
        .await?;

        self.virsh(&[
            "vol-upload",
            "--pool",
            self.storage_pool.as_str(),
            volume.as_str(),
            source_path.as_str(),
        ])
        .await?;

        if size > self.volume_capacity(&volume).await? {
            self.virsh(&[
                "vol-resize",
                "--pool",
                self.storage_pool.as_str(),
                volume.as_str(),
                size.to_string().as_str(),
            ])
            .await?;
        }

        self.volume_path(&volume).await
    }

    async fn remove_drive(&self, name: &str) -> Result<bool> {
        let mut removed = false;

        for format in ["qcow2", "raw"] {
            let volume = format!("{}.{}", name, format);
            if !self.volume_exists(&volume).await? {
                continue;
            }

            info!("🗑️ 删除存储卷 {} ({})", volume, self.storage_pool);
            self.virsh(&["vol-delete", "--pool", self.storage_pool.as_str(), volume.as_str()])
                .await?;
            removed = true;
        }

        Ok(removed)
    }

    async fn attach_drive(&self, vm: &str, path: &Path) -> Result<()> {
        let definition = self.virsh(&["dumpxml", vm, "--inactive"]).await?;
        let device = xml::next_disk_device(&definition)?;
        let source = path.display().to_string();

        let mut args = vec![
            "attach-disk",
            vm,
            source.as_str(),
            device.as_str(),
            "--subdriver",
            xml::drive_format(path),
            "--targetbus",
            "virtio",
            "--config",
        ];
        if self.vm_state(vm).await?.is_active() {
            args.push("--live");
        }

        info!("🔗 挂载磁盘 {} 到 {} ({})", source, vm, device);
        self.virsh(&args).await?;
        Ok(())
    }

    async fn list_network_adapters(&self, vm: &str) -> Result<Vec<VirtualNetworkAdapter>> {
        let definition = self.virsh(&["dumpxml", vm]).await?;
        let interfaces = xml::parse_domain_interfaces(&definition)?;

        let addresses = if self.vm_state(vm).await?.is_active() {
            self.interface_addresses(vm).await
        } else {
            HashMap::new()
        };

        Ok(interfaces
            .into_iter()
            .map(|interface| VirtualNetworkAdapter {
                addresses: addresses.get(&interface.mac_address).cloned().unwrap_or_default(),
                name: interface.target,
                switch_name: interface.network,
                mac_address: interface.mac_address,
            })
            .collect())
    }
}

/// 根据文件头判断镜像格式
async fn detect_image_format(path: &Path) -> Result<&'static str> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; 4];

    match file.read_exact(&mut magic).await {
        Ok(_) if magic == QCOW2_MAGIC => Ok("qcow2"),
        Ok(_) => Ok("raw"),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::Storage(format!("镜像文件过小: {}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

/// 解析 `virsh domstate` / `virsh list` 中的状态文本
pub fn parse_vm_state(state: &str) -> VmState {
    match state.trim() {
        "running" | "idle" | "blocked" | "in shutdown" => VmState::Running,
        "paused" => VmState::Paused,
        "shut off" => VmState::Off,
        "pmsuspended" => VmState::Saved,
        _ => VmState::Unknown,
    }
}

/// 跳过表头和分隔线，返回数据行
fn table_rows<'a>(output: &'a str, header: &[&str]) -> Result<Vec<&'a str>> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());

    let first = lines
        .next()
        .ok_or_else(|| Error::Hypervisor("virsh 输出为空".to_string()))?;
    if !header.iter().all(|column| first.contains(column)) {
        return Err(Error::Hypervisor(format!("无法识别的 virsh 输出表头: {}", first)));
    }

    let separator = lines.next().unwrap_or_default();
    if !separator.is_empty() && !separator.chars().all(|c| c == '-') {
        return Err(Error::Hypervisor(format!("无法识别的 virsh 输出: {}", separator)));
    }

    Ok(lines.collect())
}

/// 解析 `virsh list --all`
pub fn parse_vm_list(output: &str) -> Result<Vec<VirtualMachine>> {
    let mut vms = Vec::new();

    for row in table_rows(output, &["Id", "Name", "State"])? {
        let mut columns = row.split_whitespace();
        let (Some(_id), Some(name)) = (columns.next(), columns.next()) else {
            return Err(Error::Hypervisor(format!("无法解析虚拟机行: {}", row)));
        };

        let state: Vec<&str> = columns.collect();
        if state.is_empty() {
            return Err(Error::Hypervisor(format!("虚拟机行缺少状态: {}", row)));
        }

        vms.push(VirtualMachine {
            name: name.to_string(),
            state: parse_vm_state(&state.join(" ")),
        });
    }

    Ok(vms)
}

/// 解析 `--name` 形式的列表输出
pub fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// 解析 `virsh domifaddr`，返回 (MAC, IPv4 地址)
pub fn parse_domifaddr(output: &str) -> Result<Vec<(String, Ipv4Addr)>> {
    let mut entries = Vec::new();
    let mut current_mac: Option<String> = None;

    for row in table_rows(output, &["Name", "MAC address", "Protocol", "Address"])? {
        let columns: Vec<&str> = row.split_whitespace().collect();
        let [_name, mac, protocol, address] = columns.as_slice() else {
            return Err(Error::Hypervisor(format!("无法解析网卡地址行: {}", row)));
        };

        // 同一网卡的后续地址行 MAC 显示为 "-"
        if *mac != "-" {
            if !validate_mac_address(mac) {
                return Err(Error::Hypervisor(format!("无效的 MAC 地址 '{}': {}", mac, row)));
            }
            current_mac = Some(mac.to_lowercase());
        }

        if *protocol != "ipv4" {
            continue;
        }

        let mac = current_mac
            .clone()
            .ok_or_else(|| Error::Hypervisor(format!("地址行缺少 MAC: {}", row)))?;
        let ip = address
            .split('/')
            .next()
            .unwrap_or_default()
            .parse::<Ipv4Addr>()
            .map_err(|e| Error::Hypervisor(format!("无效的 IPv4 地址 '{}': {}", address, e)))?;

        entries.push((mac, ip));
    }

    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: Ipv4Addr,
    prefixlen: u8,
}

/// 解析 `ip -j -4 addr show`
pub fn parse_host_adapters(output: &str) -> Result<Vec<HostAdapter>> {
    let links: Vec<IpLink> = serde_json::from_str(output)
        .map_err(|e| Error::Hypervisor(format!("无法解析宿主机网卡信息: {}", e)))?;

    let mut adapters = Vec::new();
    for link in links.into_iter().filter(|l| l.ifname != "lo") {
        let mut networks = Vec::new();
        for info in link.addr_info.iter().filter(|i| i.family == "inet") {
            let network = Ipv4Network::new(info.local, info.prefixlen)
                .map_err(|e| Error::Hypervisor(format!("无效的网络前缀: {}", e)))?;
            networks.push(network);
        }

        if !networks.is_empty() {
            adapters.push(HostAdapter {
                name: link.ifname,
                networks,
            });
        }
    }

    Ok(adapters)
}

/// 解析 `virsh vol-path`
pub fn parse_volume_path(output: &str) -> Result<PathBuf> {
    let path = PathBuf::from(output.trim());
    if !path.is_absolute() {
        return Err(Error::Storage(format!("无效的存储卷路径: '{}'", output.trim())));
    }
    Ok(path)
}

/// 解析 `virsh vol-info --bytes` 中的容量
pub fn parse_volume_capacity(output: &str) -> Result<u64> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Capacity:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| Error::Storage(format!("无法解析存储卷容量: {}", output.trim())))
}
