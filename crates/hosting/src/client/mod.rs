/// 虚拟化客户端
///
/// 对单个 hypervisor 控制面的抽象：虚拟机增删启停、虚拟交换机、虚拟磁盘、
/// 网卡地址查询。默认实现通过 `virsh` 命令行驱动 libvirt。

mod command;
pub mod virsh;
pub mod xml;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use command::{CommandOutput, CommandRunner, LocalCommandRunner};
pub use virsh::VirshClient;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtClient;

use async_trait::async_trait;
use common::Result;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// 虚拟机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Off,
    Starting,
    Running,
    Paused,
    Saved,
    Unknown,
}

impl VmState {
    /// 是否需要先停止才能删除
    pub fn is_active(&self) -> bool {
        matches!(self, VmState::Starting | VmState::Running | VmState::Paused)
    }
}

/// 虚拟机（hypervisor 状态的只读镜像）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachine {
    pub name: String,
    pub state: VmState,
}

/// 虚拟磁盘
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDrive {
    /// 为空时由客户端在存储池中按约定生成
    pub path: Option<PathBuf>,
    /// 容量（字节）
    pub size: u64,
    /// 动态分配（qcow2），否则为 raw
    pub is_dynamic: bool,
}

impl VirtualDrive {
    pub fn raw(size: u64) -> Self {
        Self {
            path: None,
            size,
            is_dynamic: false,
        }
    }

    pub fn format(&self) -> &'static str {
        if self.is_dynamic {
            "qcow2"
        } else {
            "raw"
        }
    }
}

/// 虚拟交换机类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchType {
    /// 与宿主机互通（NAT / 路由）
    Internal,
    /// 桥接到宿主机物理网卡
    External,
    /// 隔离网络
    Private,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSwitch {
    pub name: String,
    pub switch_type: SwitchType,
}

/// 虚拟机网卡
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNetworkAdapter {
    pub name: String,
    pub switch_name: String,
    pub mac_address: String,
    pub addresses: Vec<Ipv4Addr>,
}

/// 宿主机物理网卡
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAdapter {
    pub name: String,
    pub networks: Vec<Ipv4Network>,
}

impl HostAdapter {
    /// 网卡所在的网络是否包含指定地址
    pub fn owns(&self, address: Ipv4Addr) -> bool {
        self.networks.iter().any(|n| n.contains(address))
    }
}

/// 创建虚拟机所需的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub processors: u32,
    /// 最大内存（字节）
    pub memory_bytes: u64,
    /// 最小内存（字节），为空时与最大内存相同
    pub min_memory_bytes: Option<u64>,
    pub switch_name: String,
    /// 启动盘
    pub boot_drive: PathBuf,
}

#[async_trait]
pub trait VirtualizationClient: Send + Sync + 'static {
    /// 用于日志的描述（通常是连接 URI）
    fn describe(&self) -> String;

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>>;

    async fn find_vm(&self, name: &str) -> Result<Option<VirtualMachine>> {
        Ok(self.list_vms().await?.into_iter().find(|vm| vm.name == name))
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()>;

    async fn start_vm(&self, name: &str) -> Result<()>;

    async fn stop_vm(&self, name: &str, force: bool) -> Result<()>;

    /// 删除虚拟机及其磁盘
    async fn remove_vm(&self, name: &str) -> Result<()>;

    async fn list_switches(&self) -> Result<Vec<VirtualSwitch>>;

    async fn create_external_switch(&self, name: &str, adapter: &HostAdapter) -> Result<VirtualSwitch>;

    async fn list_host_adapters(&self) -> Result<Vec<HostAdapter>>;

    /// 创建空磁盘，返回磁盘路径
    async fn create_drive(&self, name: &str, drive: &VirtualDrive) -> Result<PathBuf>;

    /// 以本地镜像文件为内容创建磁盘，并扩容到 `size` 字节，返回磁盘路径
    async fn import_drive(&self, name: &str, source: &Path, size: u64) -> Result<PathBuf>;

    /// 删除指定名称的磁盘（不区分格式），返回是否确实删除了磁盘
    async fn remove_drive(&self, name: &str) -> Result<bool>;

    async fn attach_drive(&self, vm: &str, path: &Path) -> Result<()>;

    async fn list_network_adapters(&self, vm: &str) -> Result<Vec<VirtualNetworkAdapter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_adapter_owns() {
        let adapter = HostAdapter {
            name: "br0".to_string(),
            networks: vec!["192.168.1.0/24".parse().unwrap()],
        };

        assert!(adapter.owns("192.168.1.1".parse().unwrap()));
        assert!(!adapter.owns("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_drive_format() {
        assert_eq!(VirtualDrive::raw(1024).format(), "raw");
        let dynamic = VirtualDrive {
            path: None,
            size: 1024,
            is_dynamic: true,
        };
        assert_eq!(dynamic.format(), "qcow2");
    }
}
