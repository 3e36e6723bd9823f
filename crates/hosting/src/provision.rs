/// 虚拟机集群配置流程
///
/// 本机和主机池两种托管环境共用的流水线：
///
/// 1. 准备系统盘模板（下载或使用缓存，必要时解压）
/// 2. 检查虚拟机名称冲突（`force` 时删除冲突的虚拟机）
/// 3. 选择虚拟交换机
/// 4. 为每个节点创建并启动虚拟机
/// 5. 等待虚拟机通过 DHCP 获得地址
/// 6. 通过 DHCP 地址登录节点：配置静态 IP、扩容根分区、重启
/// 7. 重建节点代理

use cluster::{ClusterProxy, NodeProxy, SetupController};
use common::models::NodeDefinition;
use common::utils::retry_fixed;
use common::{ClusterDefinition, Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::client::{VirtualDrive, VirtualizationClient, VmSpec, SwitchType};
use crate::template::{PreparedTemplate, TemplateCache};

/// 静态网络配置文件
const NETPLAN_PATH: &str = "/etc/netplan/60-cluster.yaml";
/// 禁止 cloud-init 重新生成网络配置
const CLOUD_INIT_NETWORK_PATH: &str = "/etc/cloud/cloud.cfg.d/99-disable-network-config.cfg";
/// 扩容根分区；growpart 在分区无需扩容时返回 1，其他非零退出码为失败
const GROW_ROOT_COMMAND: &str =
    "{ growpart /dev/vda 1 || [ $? -eq 1 ]; } && resize2fs \"$(findmnt -n -o SOURCE /)\"";

/// 配置流程参数
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// 节点步骤的最大并发数
    pub max_parallel: usize,
    /// 等待虚拟机获得地址的时间
    pub address_timeout: Duration,
    /// 轮询虚拟机网卡地址的间隔
    pub poll_interval: Duration,
    /// 等待节点启动完成的时间
    pub boot_timeout: Duration,
    /// 远程命令的重试次数
    pub retry_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            address_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            boot_timeout: Duration::from_secs(600),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// 一台 hypervisor 及其上放置的节点
pub struct HypervisorTarget {
    pub name: String,
    pub client: Arc<dyn VirtualizationClient>,
    /// 指定的虚拟交换机，缺省时自动选择
    pub switch_name: Option<String>,
}

/// 虚拟机获得的 DHCP 地址
#[derive(Debug, Clone, PartialEq, Eq)]
struct DiscoveredAddress {
    address: Ipv4Addr,
    mac_address: String,
}

/// 一次配置过程中各步骤共享的状态
#[derive(Default)]
struct ProvisionState {
    template: Mutex<Option<Arc<PreparedTemplate>>>,
    switches: Mutex<HashMap<usize, String>>,
    addresses: Mutex<HashMap<String, DiscoveredAddress>>,
}

pub struct VmProvisioner {
    cluster: Arc<ClusterProxy>,
    targets: Vec<HypervisorTarget>,
    /// 节点名 → targets 下标
    placement: HashMap<String, usize>,
    templates: Arc<TemplateCache>,
    options: ProvisionOptions,
}

impl VmProvisioner {
    pub fn new(
        cluster: Arc<ClusterProxy>,
        targets: Vec<HypervisorTarget>,
        placement: HashMap<String, usize>,
        templates: Arc<TemplateCache>,
        options: ProvisionOptions,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(Error::Config("至少需要一台 hypervisor".to_string()));
        }

        for node in &cluster.definition().nodes {
            match placement.get(&node.name) {
                Some(index) if *index < targets.len() => {}
                _ => {
                    return Err(Error::Config(format!("节点 {} 没有分配 hypervisor", node.name)));
                }
            }
        }

        Ok(Self {
            cluster,
            targets,
            placement,
            templates,
            options,
        })
    }

    pub fn options(&self) -> &ProvisionOptions {
        &self.options
    }

    fn definition(&self) -> &ClusterDefinition {
        self.cluster.definition()
    }

    fn node_definition(&self, name: &str) -> Result<&NodeDefinition> {
        self.definition()
            .node(name)
            .ok_or_else(|| Error::NotFound(format!("节点不存在: {}", name)))
    }

    fn target_for(&self, node: &str) -> Result<(usize, &HypervisorTarget)> {
        let index = *self
            .placement
            .get(node)
            .ok_or_else(|| Error::Config(format!("节点 {} 没有分配 hypervisor", node)))?;
        Ok((index, &self.targets[index]))
    }

    /// 实际用到的 hypervisor 下标
    fn used_targets(&self) -> Vec<usize> {
        let used: HashSet<usize> = self.placement.values().copied().collect();
        let mut used: Vec<usize> = used.into_iter().collect();
        used.sort_unstable();
        used
    }

    /// 执行配置流程；有节点故障时返回 `Ok(false)`
    pub async fn provision(self: &Arc<Self>, force: bool) -> Result<bool> {
        let state = Arc::new(ProvisionState::default());
        let nodes = self.cluster.nodes().to_vec();

        let mut controller = SetupController::new(format!("配置集群 {}", self.cluster.name()), nodes)
            .with_max_parallel(self.options.max_parallel);

        let (this, shared) = (self.clone(), state.clone());
        controller.add_global_step(
            "准备系统盘模板",
            move || {
                let (this, shared) = (this.clone(), shared.clone());
                async move { this.prepare_template(&shared).await }
            },
            false,
        );

        let this = self.clone();
        controller.add_global_step(
            "检查虚拟机冲突",
            move || {
                let this = this.clone();
                async move { this.check_conflicts(force).await }
            },
            false,
        );

        let (this, shared) = (self.clone(), state.clone());
        controller.add_global_step(
            "选择虚拟交换机",
            move || {
                let (this, shared) = (this.clone(), shared.clone());
                async move { this.select_switches(&shared).await }
            },
            false,
        );

        let (this, shared) = (self.clone(), state.clone());
        controller.add_node_step(
            "创建虚拟机",
            move |node: Arc<NodeProxy>, _| {
                let (this, shared) = (this.clone(), shared.clone());
                async move { this.create_vm(&node, &shared).await }
            },
            None,
        );

        let (this, shared) = (self.clone(), state.clone());
        controller.add_node_step(
            "等待虚拟机地址",
            move |node: Arc<NodeProxy>, _| {
                let (this, shared) = (this.clone(), shared.clone());
                async move { this.wait_for_address(&node, &shared).await }
            },
            None,
        );

        let (this, shared) = (self.clone(), state.clone());
        controller.add_node_step(
            "配置节点",
            move |node: Arc<NodeProxy>, _| {
                let (this, shared) = (this.clone(), shared.clone());
                async move { this.configure_node(&node, &shared).await }
            },
            None,
        );

        // 节点全部故障时也要执行
        let cluster = self.cluster.clone();
        controller.add_final_step(
            "重建节点代理",
            move || {
                let cluster = cluster.clone();
                async move {
                    cluster.create_nodes();
                    Ok(())
                }
            },
            true,
        );

        controller.run().await
    }

    // ---- 全局步骤 ----

    async fn prepare_template(&self, state: &ProvisionState) -> Result<()> {
        let uri = self
            .definition()
            .hosting
            .template_uri
            .as_deref()
            .ok_or_else(|| Error::Config("没有配置系统盘模板地址".to_string()))?;

        let template = self.templates.acquire(uri).await?;
        let prepared = self.templates.prepare(&template).await?;

        *state.template.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(prepared));
        Ok(())
    }

    /// 检查集群要创建的虚拟机名称是否已被占用
    async fn check_conflicts(&self, force: bool) -> Result<()> {
        let definition = self.definition();
        let expected: HashSet<String> = definition
            .nodes
            .iter()
            .map(|n| definition.vm_name(n))
            .collect();

        let mut conflicts = Vec::new();
        for target in &self.targets {
            for vm in target.client.list_vms().await? {
                if expected.contains(&vm.name) {
                    conflicts.push((target, vm));
                }
            }
        }

        if conflicts.is_empty() {
            return Ok(());
        }

        if !force {
            let names: Vec<String> = conflicts
                .iter()
                .map(|(target, vm)| format!("{} ({})", vm.name, target.name))
                .collect();
            return Err(Error::Conflict(format!("虚拟机已存在: {}", names.join(", "))));
        }

        for (target, vm) in conflicts {
            warn!("⚠️ 删除已存在的虚拟机 {} ({})", vm.name, target.name);
            if vm.state.is_active() {
                target.client.stop_vm(&vm.name, true).await?;
            }
            target.client.remove_vm(&vm.name).await?;
        }

        Ok(())
    }

    /// 为每台用到的 hypervisor 选择虚拟交换机
    async fn select_switches(&self, state: &ProvisionState) -> Result<()> {
        let gateway = self.definition().network.gateway;

        for index in self.used_targets() {
            let target = &self.targets[index];
            let switches = target.client.list_switches().await?;

            let name = match &target.switch_name {
                Some(name) => {
                    if !switches.iter().any(|s| &s.name == name) {
                        return Err(Error::NotFound(format!(
                            "虚拟交换机 {} 不存在 ({})",
                            name, target.name
                        )));
                    }
                    name.clone()
                }
                None => match switches.iter().find(|s| s.switch_type == SwitchType::External) {
                    Some(switch) => switch.name.clone(),
                    None => {
                        let adapters = target.client.list_host_adapters().await?;
                        let adapter = adapters.iter().find(|a| a.owns(gateway)).ok_or_else(|| {
                            Error::Network(format!(
                                "{} 上没有连接网关 {} 的网卡",
                                target.name, gateway
                            ))
                        })?;

                        let name = format!("{}-external", self.cluster.name());
                        target.client.create_external_switch(&name, adapter).await?.name
                    }
                },
            };

            info!("🌐 {} 使用虚拟交换机 {}", target.name, name);
            state
                .switches
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(index, name);
        }

        Ok(())
    }

    // ---- 节点步骤 ----

    async fn create_vm(&self, node: &NodeProxy, state: &ProvisionState) -> Result<()> {
        let definition = self.node_definition(node.name())?;
        let vm_name = self.definition().vm_name(definition);
        let (index, target) = self.target_for(node.name())?;
        let labels = &definition.labels;

        let template = state
            .template
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::Internal("系统盘模板尚未准备".to_string()))?;
        let switch_name = state
            .switches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("{} 没有选定虚拟交换机", target.name)))?;

        // 上次失败的运行可能留下了磁盘，同名存储卷会导致创建失败
        let (boot_name, osd_name) = (format!("{}-boot", vm_name), format!("{}-osd", vm_name));
        for drive in [&boot_name, &osd_name] {
            if target.client.remove_drive(drive).await? {
                warn!("⚠️ [{}] 删除残留磁盘 {} ({})", node.name(), drive, target.name);
            }
        }

        node.set_status(format!("创建系统盘 ({})", target.name));
        let boot_drive = target
            .client
            .import_drive(&boot_name, template.path(), labels.boot_disk_bytes()?)
            .await?;

        node.set_status("创建虚拟机");
        let spec = VmSpec {
            name: vm_name.clone(),
            processors: labels.processors,
            memory_bytes: labels.memory_bytes()?,
            min_memory_bytes: Some(labels.min_memory_bytes()?),
            switch_name,
            boot_drive,
        };
        target.client.create_vm(&spec).await?;

        if let Some(size) = labels.osd_disk_bytes()? {
            node.set_status("创建数据盘");
            let path = target
                .client
                .create_drive(&osd_name, &VirtualDrive::raw(size))
                .await?;
            target.client.attach_drive(&vm_name, &path).await?;
        }

        node.set_status("启动虚拟机");
        target.client.start_vm(&vm_name).await?;
        Ok(())
    }

    /// 轮询虚拟机网卡，直到获得 IPv4 地址
    async fn wait_for_address(&self, node: &NodeProxy, state: &ProvisionState) -> Result<()> {
        let definition = self.node_definition(node.name())?;
        let vm_name = self.definition().vm_name(definition);
        let (_, target) = self.target_for(node.name())?;

        node.set_status("等待虚拟机获得地址");
        let deadline = Instant::now() + self.options.address_timeout;

        loop {
            match target.client.list_network_adapters(&vm_name).await {
                Ok(adapters) => {
                    let found = adapters.into_iter().find_map(|adapter| {
                        adapter.addresses.first().map(|address| DiscoveredAddress {
                            address: *address,
                            mac_address: adapter.mac_address.clone(),
                        })
                    });

                    if let Some(found) = found {
                        info!("📡 [{}] 虚拟机地址: {} ({})", node.name(), found.address, found.mac_address);
                        state
                            .addresses
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(node.name().to_string(), found);
                        return Ok(());
                    }
                }
                Err(e) => debug!("[{}] 查询网卡失败: {}", node.name(), e),
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "虚拟机 {} 在 {:?} 内没有获得地址",
                    vm_name, self.options.address_timeout
                )));
            }

            sleep(self.options.poll_interval).await;
        }
    }

    /// 通过 DHCP 地址登录节点完成系统配置
    async fn configure_node(&self, node: &NodeProxy, state: &ProvisionState) -> Result<()> {
        let discovered = state
            .addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node.name())
            .cloned()
            .ok_or_else(|| Error::Internal(format!("节点 {} 没有记录 DHCP 地址", node.name())))?;

        let _guard = node.override_address(discovered.address);
        node.wait_for_boot(self.options.boot_timeout).await?;

        let netplan = self.netplan_config(node, &discovered.mac_address);
        node.invoke_idempotent_action("setup/static-ip", || async move {
            node.set_status("配置静态 IP");
            node.upload_text(NETPLAN_PATH, &netplan, "600").await?;
            node.upload_text(CLOUD_INIT_NETWORK_PATH, "network: {config: disabled}\n", "644")
                .await?;
            node.sudo_command_checked("rm -f /etc/netplan/50-cloud-init.yaml").await?;
            Ok(())
        })
        .await?;

        node.invoke_idempotent_action("setup/grow-root", || async move {
            node.set_status("扩容根分区");
            retry_fixed(
                "扩容根分区",
                self.options.retry_attempts,
                self.options.retry_delay,
                || async move { node.sudo_command_checked(GROW_ROOT_COMMAND).await.map(|_| ()) },
            )
            .await
        })
        .await?;

        node.reboot(false, self.options.boot_timeout).await?;
        node.set_status("配置完成");
        Ok(())
    }

    /// 按 MAC 匹配网卡的 netplan 静态地址配置
    fn netplan_config(&self, node: &NodeProxy, mac_address: &str) -> String {
        let network = &self.definition().network;
        let nameservers: Vec<String> = network.nameservers.iter().map(|n| n.to_string()).collect();

        format!(
            r#"network:
  version: 2
  ethernets:
    eth0:
      match:
        macaddress: "{mac}"
      set-name: eth0
      dhcp4: false
      addresses: [{address}/{prefix}]
      routes:
        - to: default
          via: {gateway}
      nameservers:
        addresses: [{nameservers}]
"#,
            mac = mac_address,
            address = node.configured_address(),
            prefix = network.premise_subnet.prefix(),
            gateway = network.gateway,
            nameservers = nameservers.join(", "),
        )
    }
}
