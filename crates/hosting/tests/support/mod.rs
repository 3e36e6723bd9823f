//! 集成测试共用的内存版虚拟化客户端与集群构造

#![allow(dead_code)]

use async_trait::async_trait;
use cluster::testing::{sample_node, MemoryShell, StaticProbe};
use cluster::{ClusterProxy, SshCredentials};
use common::models::{HostingDefinition, HostingEnvironment, NetworkDefinition};
use common::{ClusterDefinition, Error, NodeRole, Result};
use hosting::client::{
    HostAdapter, SwitchType, VirtualDrive, VirtualMachine, VirtualNetworkAdapter, VirtualSwitch,
    VirtualizationClient, VmSpec, VmState,
};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 内存版虚拟化客户端
///
/// 记录创建次数和 `create_vm` 的最大并发数；启动后的虚拟机立即获得地址，
/// `withhold_address` 指定的虚拟机除外。存储卷按名称记录，同名卷不能重复创建。
pub struct FakeClient {
    vms: Mutex<HashMap<String, VmState>>,
    macs: Mutex<HashMap<String, String>>,
    switches: Mutex<Vec<VirtualSwitch>>,
    adapters: Vec<HostAdapter>,
    withheld: Mutex<HashSet<String>>,
    volumes: Mutex<HashSet<String>>,
    define_failures: Mutex<HashSet<String>>,
    removed: Mutex<Vec<String>>,
    specs: Mutex<Vec<VmSpec>>,
    attached: Mutex<Vec<(String, PathBuf)>>,
    creations: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    create_delay: Duration,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(HashMap::new()),
            macs: Mutex::new(HashMap::new()),
            switches: Mutex::new(vec![VirtualSwitch {
                name: "br-ext".to_string(),
                switch_type: SwitchType::External,
            }]),
            adapters: vec![HostAdapter {
                name: "eno1".to_string(),
                networks: vec!["10.0.0.0/24".parse().unwrap()],
            }],
            withheld: Mutex::new(HashSet::new()),
            volumes: Mutex::new(HashSet::new()),
            define_failures: Mutex::new(HashSet::new()),
            removed: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            creations: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            create_delay: Duration::from_millis(50),
        }
    }

    /// 只有内部网络的 hypervisor
    pub fn without_external_switch(self) -> Self {
        *self.switches.lock().unwrap() = vec![VirtualSwitch {
            name: "default".to_string(),
            switch_type: SwitchType::Internal,
        }];
        self
    }

    pub fn with_existing_vm(self, name: &str, state: VmState) -> Self {
        self.vms.lock().unwrap().insert(name.to_string(), state);
        self
    }

    /// 指定的虚拟机永远不会获得地址
    pub fn withhold_address(&self, vm: &str) {
        self.withheld.lock().unwrap().insert(vm.to_string());
    }

    /// 指定虚拟机的下一次定义失败
    pub fn fail_define(&self, vm: &str) {
        self.define_failures.lock().unwrap().insert(vm.to_string());
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.lock().unwrap().contains(name)
    }

    fn add_volume(&self, name: &str) -> Result<()> {
        if !self.volumes.lock().unwrap().insert(name.to_string()) {
            return Err(Error::Storage(format!("storage volume '{}' already exists", name)));
        }
        Ok(())
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<VmSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn attached(&self) -> Vec<(String, PathBuf)> {
        self.attached.lock().unwrap().clone()
    }

    pub fn switch_names(&self) -> Vec<String> {
        self.switches.lock().unwrap().iter().map(|s| s.name.clone()).collect()
    }

    pub fn state(&self, vm: &str) -> Option<VmState> {
        self.vms.lock().unwrap().get(vm).copied()
    }
}

#[async_trait]
impl VirtualizationClient for FakeClient {
    fn describe(&self) -> String {
        "fake:///system".to_string()
    }

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        let mut vms: Vec<VirtualMachine> = self
            .vms
            .lock()
            .unwrap()
            .iter()
            .map(|(name, state)| VirtualMachine {
                name: name.clone(),
                state: *state,
            })
            .collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.create_delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.define_failures.lock().unwrap().remove(&spec.name) {
            return Err(Error::Hypervisor(format!("failed to define domain '{}'", spec.name)));
        }

        let mut vms = self.vms.lock().unwrap();
        if vms.contains_key(&spec.name) {
            return Err(Error::Hypervisor(format!("domain '{}' already exists", spec.name)));
        }
        vms.insert(spec.name.clone(), VmState::Off);

        let index = self.creations.fetch_add(1, Ordering::SeqCst);
        self.macs
            .lock()
            .unwrap()
            .insert(spec.name.clone(), format!("52:54:00:00:00:{:02x}", index));
        self.specs.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        match self.vms.lock().unwrap().get_mut(name) {
            Some(state) => {
                *state = VmState::Running;
                Ok(())
            }
            None => Err(Error::NotFound(format!("虚拟机不存在: {}", name))),
        }
    }

    async fn stop_vm(&self, name: &str, _force: bool) -> Result<()> {
        if let Some(state) = self.vms.lock().unwrap().get_mut(name) {
            *state = VmState::Off;
        }
        Ok(())
    }

    async fn remove_vm(&self, name: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        match vms.get(name) {
            Some(state) if state.is_active() => {
                Err(Error::Hypervisor(format!("虚拟机仍在运行: {}", name)))
            }
            Some(_) => {
                vms.remove(name);
                let mut volumes = self.volumes.lock().unwrap();
                volumes.remove(&format!("{}-boot", name));
                volumes.remove(&format!("{}-osd", name));
                self.removed.lock().unwrap().push(name.to_string());
                Ok(())
            }
            None => Err(Error::NotFound(format!("虚拟机不存在: {}", name))),
        }
    }

    async fn list_switches(&self) -> Result<Vec<VirtualSwitch>> {
        Ok(self.switches.lock().unwrap().clone())
    }

    async fn create_external_switch(&self, name: &str, _adapter: &HostAdapter) -> Result<VirtualSwitch> {
        let switch = VirtualSwitch {
            name: name.to_string(),
            switch_type: SwitchType::External,
        };
        self.switches.lock().unwrap().push(switch.clone());
        Ok(switch)
    }

    async fn list_host_adapters(&self) -> Result<Vec<HostAdapter>> {
        Ok(self.adapters.clone())
    }

    async fn create_drive(&self, name: &str, drive: &VirtualDrive) -> Result<PathBuf> {
        self.add_volume(name)?;
        Ok(PathBuf::from(format!("/pool/{}.{}", name, drive.format())))
    }

    async fn import_drive(&self, name: &str, source: &Path, _size: u64) -> Result<PathBuf> {
        if !source.exists() {
            return Err(Error::Storage(format!("模板文件不存在: {}", source.display())));
        }
        self.add_volume(name)?;
        Ok(PathBuf::from(format!("/pool/{}.qcow2", name)))
    }

    async fn remove_drive(&self, name: &str) -> Result<bool> {
        Ok(self.volumes.lock().unwrap().remove(name))
    }

    async fn attach_drive(&self, vm: &str, path: &Path) -> Result<()> {
        self.attached.lock().unwrap().push((vm.to_string(), path.to_path_buf()));
        Ok(())
    }

    async fn list_network_adapters(&self, vm: &str) -> Result<Vec<VirtualNetworkAdapter>> {
        let running = self.vms.lock().unwrap().get(vm) == Some(&VmState::Running);
        let mac_address = self
            .macs
            .lock()
            .unwrap()
            .get(vm)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("虚拟机不存在: {}", vm)))?;

        let addresses = if running && !self.withheld.lock().unwrap().contains(vm) {
            let last = u8::from_str_radix(&mac_address[15..], 16).unwrap_or(0);
            vec![Ipv4Addr::new(10, 0, 0, 200 + last)]
        } else {
            Vec::new()
        };

        Ok(vec![VirtualNetworkAdapter {
            name: "vnet0".to_string(),
            switch_name: "br-ext".to_string(),
            mac_address,
            addresses,
        }])
    }
}

/// 1 个 master + 2 个 worker 的集群
pub fn definition(environment: HostingEnvironment, template_uri: &str) -> ClusterDefinition {
    let mut worker = sample_node("worker-1", NodeRole::Worker, "10.0.0.12");
    worker.labels.osd_disk = Some("100GiB".to_string());

    ClusterDefinition {
        name: "demo".to_string(),
        network: NetworkDefinition {
            premise_subnet: "10.0.0.0/24".parse().unwrap(),
            node_subnet: "10.0.0.0/25".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
            nameservers: vec!["10.0.0.1".parse().unwrap(), "1.1.1.1".parse().unwrap()],
        },
        hosting: HostingDefinition {
            environment,
            template_uri: Some(template_uri.to_string()),
            vm_name_prefix: None,
            local: None,
            pool: None,
        },
        nodes: vec![
            sample_node("master-0", NodeRole::Master, "10.0.0.10"),
            sample_node("worker-0", NodeRole::Worker, "10.0.0.11"),
            worker,
        ],
    }
}

pub fn cluster(definition: ClusterDefinition, shell: Arc<MemoryShell>) -> Arc<ClusterProxy> {
    Arc::new(ClusterProxy::new(
        Arc::new(definition),
        SshCredentials::new("ubuntu"),
        shell,
        Arc::new(StaticProbe::new(Vec::<String>::new())),
    ))
}
