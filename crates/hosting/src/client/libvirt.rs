/// 基于 libvirt 原生绑定的虚拟化客户端
///
/// 虚拟机与网络通过 `virt` 直接调用 libvirt；存储卷导入和宿主机网卡查询仍交给
/// [`VirshClient`]（`vol-upload` 需要数据流传输）。

use async_trait::async_trait;
use common::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;
use virt::storage_vol::StorageVol;

use super::virsh::VirshClient;
use super::xml;
use super::{
    HostAdapter, SwitchType, VirtualDrive, VirtualMachine, VirtualNetworkAdapter, VirtualSwitch,
    VirtualizationClient, VmSpec, VmState,
};

// libvirt 域状态常量
const VIR_DOMAIN_RUNNING: u32 = 1;
const VIR_DOMAIN_BLOCKED: u32 = 2;
const VIR_DOMAIN_PAUSED: u32 = 3;
const VIR_DOMAIN_SHUTDOWN: u32 = 4;
const VIR_DOMAIN_SHUTOFF: u32 = 5;
const VIR_DOMAIN_PMSUSPENDED: u32 = 7;

const VIR_DOMAIN_AFFECT_LIVE: u32 = 1;
const VIR_DOMAIN_AFFECT_CONFIG: u32 = 2;

const VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE: u32 = 0;
const VIR_IP_ADDR_TYPE_IPV4: i64 = 0;

pub struct LibvirtClient {
    uri: String,
    conn: Arc<Mutex<Connect>>,
    storage: VirshClient,
    stop_timeout: Duration,
}

fn map_err(context: &str) -> impl Fn(virt::error::Error) -> Error + '_ {
    move |e| Error::Hypervisor(format!("{}: {}", context, e))
}

fn state_from_code(state: u32) -> VmState {
    match state {
        VIR_DOMAIN_RUNNING | VIR_DOMAIN_BLOCKED | VIR_DOMAIN_SHUTDOWN => VmState::Running,
        VIR_DOMAIN_PAUSED => VmState::Paused,
        VIR_DOMAIN_SHUTOFF => VmState::Off,
        VIR_DOMAIN_PMSUSPENDED => VmState::Saved,
        _ => VmState::Unknown,
    }
}

impl LibvirtClient {
    /// 连接 hypervisor；`storage` 使用同一 URI
    pub fn connect(storage: VirshClient) -> Result<Self> {
        let uri = storage.uri().to_string();
        let conn = Connect::open(Some(uri.as_str()))
            .map_err(|e| Error::Hypervisor(format!("无法连接到 libvirt ({}): {}", uri, e)))?;

        tracing::info!("✅ 成功连接到 libvirt: {}", uri);

        Ok(Self {
            uri,
            conn: Arc::new(Mutex::new(conn)),
            storage,
            stop_timeout: Duration::from_secs(30),
        })
    }

    fn lookup(conn: &Connect, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(conn, name)
            .map_err(|e| Error::NotFound(format!("虚拟机不存在: {} ({})", name, e)))
    }

    fn state(domain: &Domain) -> Result<VmState> {
        let (state, _reason) = domain.get_state().map_err(map_err("无法获取虚拟机状态"))?;
        Ok(state_from_code(state as u32))
    }
}

#[async_trait]
impl VirtualizationClient for LibvirtClient {
    fn describe(&self) -> String {
        self.uri.clone()
    }

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        let conn = self.conn.lock().await;
        let domains = conn.list_all_domains(0).map_err(map_err("无法列出虚拟机"))?;

        let mut vms = Vec::new();
        for domain in domains {
            vms.push(VirtualMachine {
                name: domain.get_name().map_err(map_err("无法获取虚拟机名称"))?,
                state: Self::state(&domain)?,
            });
        }

        Ok(vms)
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        tracing::info!("🖥️ 定义虚拟机 {} ({})", spec.name, self.uri);
        let conn = self.conn.lock().await;
        Domain::define_xml(&conn, &xml::domain_xml(spec)).map_err(map_err("无法定义虚拟机"))?;
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, name)?;

        match Self::state(&domain)? {
            VmState::Running => Ok(()),
            VmState::Paused => {
                domain.resume().map_err(map_err("无法恢复虚拟机"))?;
                Ok(())
            }
            _ => {
                tracing::info!("🚀 启动虚拟机: {}", name);
                domain.create().map_err(map_err("无法启动虚拟机"))?;
                Ok(())
            }
        }
    }

    async fn stop_vm(&self, name: &str, force: bool) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            let domain = Self::lookup(&conn, name)?;

            if !Self::state(&domain)?.is_active() {
                return Ok(());
            }
            if !force {
                domain.shutdown().map_err(map_err("无法停止虚拟机"))?;
            }
        }

        if !force {
            // 等待期间不持有连接锁
            for _ in 0..self.stop_timeout.as_secs() {
                tokio::time::sleep(Duration::from_secs(1)).await;

                let conn = self.conn.lock().await;
                if Self::state(&Self::lookup(&conn, name)?)? == VmState::Off {
                    return Ok(());
                }
            }

            tracing::warn!("⚠️ 优雅停止超时，尝试强制停止虚拟机: {}", name);
        }

        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, name)?;
        if Self::state(&domain)?.is_active() {
            domain.destroy().map_err(map_err("无法强制停止虚拟机"))?;
        }
        Ok(())
    }

    async fn remove_vm(&self, name: &str) -> Result<()> {
        tracing::info!("🗑️ 删除虚拟机: {}", name);
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, name)?;

        if Self::state(&domain)?.is_active() {
            domain.destroy().map_err(map_err("无法停止虚拟机"))?;
        }

        let definition = domain.get_xml_desc(0).map_err(map_err("无法获取虚拟机XML"))?;
        domain.undefine().map_err(map_err("无法删除虚拟机定义"))?;

        for path in xml::parse_disk_sources(&definition)? {
            let path = path.display().to_string();
            match StorageVol::lookup_by_path(&conn, &path) {
                Ok(volume) => volume
                    .delete(0)
                    .map_err(|e| Error::Storage(format!("无法删除存储卷 {}: {}", path, e)))?,
                Err(e) => tracing::warn!("⚠️ 找不到存储卷 {}: {}", path, e),
            }
        }

        Ok(())
    }

    async fn list_switches(&self) -> Result<Vec<VirtualSwitch>> {
        let conn = self.conn.lock().await;
        let networks = conn.list_all_networks(0).map_err(map_err("无法列出网络"))?;

        let mut switches = Vec::new();
        for network in networks {
            let definition = network.get_xml_desc(0).map_err(map_err("无法获取网络XML"))?;
            switches.push(VirtualSwitch {
                name: network.get_name().map_err(map_err("无法获取网络名称"))?,
                switch_type: xml::parse_switch_type(&definition)?,
            });
        }

        Ok(switches)
    }

    async fn create_external_switch(&self, name: &str, adapter: &HostAdapter) -> Result<VirtualSwitch> {
        tracing::info!("🌐 创建外部交换机 {} (宿主机网卡 {})", name, adapter.name);
        let conn = self.conn.lock().await;

        let network = Network::define_xml(&conn, &xml::external_network_xml(name, &adapter.name))
            .map_err(map_err("无法定义网络"))?;
        network.create().map_err(map_err("无法启动网络"))?;
        network.set_autostart(true).map_err(map_err("无法设置网络自动启动"))?;

        Ok(VirtualSwitch {
            name: name.to_string(),
            switch_type: SwitchType::External,
        })
    }

    async fn list_host_adapters(&self) -> Result<Vec<HostAdapter>> {
        self.storage.list_host_adapters().await
    }

    async fn create_drive(&self, name: &str, drive: &VirtualDrive) -> Result<PathBuf> {
        self.storage.create_drive(name, drive).await
    }

    async fn import_drive(&self, name: &str, source: &Path, size: u64) -> Result<PathBuf> {
        self.storage.import_drive(name, source, size).await
    }

    async fn remove_drive(&self, name: &str) -> Result<bool> {
        self.storage.remove_drive(name).await
    }

    async fn attach_drive(&self, vm: &str, path: &Path) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, vm)?;

        let definition = domain.get_xml_desc(0).map_err(map_err("无法获取虚拟机XML"))?;
        let device = xml::next_disk_device(&definition)?;

        let mut flags = VIR_DOMAIN_AFFECT_CONFIG;
        if Self::state(&domain)?.is_active() {
            flags |= VIR_DOMAIN_AFFECT_LIVE;
        }

        tracing::info!("🔗 挂载磁盘 {} 到 {} ({})", path.display(), vm, device);
        domain
            .attach_device_flags(&xml::disk_xml(path, &device), flags)
            .map_err(map_err("挂载磁盘失败"))?;
        Ok(())
    }

    async fn list_network_adapters(&self, vm: &str) -> Result<Vec<VirtualNetworkAdapter>> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, vm)?;

        let definition = domain.get_xml_desc(0).map_err(map_err("无法获取虚拟机XML"))?;
        let interfaces = xml::parse_domain_interfaces(&definition)?;

        let mut addresses: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();
        if Self::state(&domain)?.is_active() {
            let reported = domain
                .interface_addresses(VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
                .map_err(map_err("无法获取网卡地址"))?;

            for interface in reported {
                let list = addresses.entry(interface.hwaddr.to_lowercase()).or_default();
                for address in interface.addrs {
                    if address.typed == VIR_IP_ADDR_TYPE_IPV4 {
                        if let Ok(ip) = address.addr.parse() {
                            list.push(ip);
                        }
                    }
                }
            }
        }

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_code() {
        assert_eq!(state_from_code(VIR_DOMAIN_RUNNING), VmState::Running);
        assert_eq!(state_from_code(VIR_DOMAIN_SHUTOFF), VmState::Off);
        assert_eq!(state_from_code(VIR_DOMAIN_PAUSED), VmState::Paused);
        assert_eq!(state_from_code(VIR_DOMAIN_PMSUSPENDED), VmState::Saved);
        assert_eq!(state_from_code(6), VmState::Unknown);
    }

    /// libvirt 自带的 test 驱动中有一台运行中的虚拟机 `test`
    #[tokio::test]
    async fn test_stop_vm_releases_connection_while_waiting() {
        let client = LibvirtClient::connect(VirshClient::new("test:///default", "default")).unwrap();

        let listing = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let started = tokio::time::Instant::now();
            let vms = client.list_vms().await.unwrap();
            (vms, started.elapsed())
        };
        let (stopped, (vms, elapsed)) = tokio::join!(client.stop_vm("test", false), listing);

        stopped.unwrap();
        assert!(vms.iter().any(|vm| vm.name == "test"));
        // 停止流程每秒检查一次状态，期间其他操作不需要等待
        assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
        assert_eq!(client.find_vm("test").await.unwrap().map(|vm| vm.state), Some(VmState::Off));
    }
}
