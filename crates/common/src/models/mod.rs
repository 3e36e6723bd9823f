/// 集群定义数据模型
///
/// 描述目标集群的节点、网络与托管环境；校验通过后只读共享

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::utils::{parse_size, validate_dns_label};
use crate::{Error, Result};

/// 节点角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

/// 托管环境类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HostingEnvironment {
    /// 本机 libvirt/QEMU
    Local,
    /// 远程 libvirt 主机池
    Pool,
    /// 预先准备好的物理机，无需创建虚拟机
    Machine,
}

/// 集群网络配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub premise_subnet: Ipv4Network,
    pub node_subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
}

/// 节点资源标签
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLabels {
    #[serde(default = "default_processors")]
    pub processors: u32,
    #[serde(default = "default_memory")]
    pub memory: String,
    /// 动态内存下限，缺省等于 `memory`
    #[serde(default)]
    pub min_memory: Option<String>,
    #[serde(default = "default_boot_disk")]
    pub boot_disk: String,
    /// 设置后为节点额外创建一块 raw 数据盘（OSD）
    #[serde(default)]
    pub osd_disk: Option<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

fn default_processors() -> u32 {
    2
}

fn default_memory() -> String {
    "4GiB".to_string()
}

fn default_boot_disk() -> String {
    "64GiB".to_string()
}

impl Default for NodeLabels {
    fn default() -> Self {
        Self {
            processors: default_processors(),
            memory: default_memory(),
            min_memory: None,
            boot_disk: default_boot_disk(),
            osd_disk: None,
            custom: BTreeMap::new(),
        }
    }
}

impl NodeLabels {
    pub fn memory_bytes(&self) -> Result<u64> {
        parse_size(&self.memory)
    }

    pub fn min_memory_bytes(&self) -> Result<u64> {
        match &self.min_memory {
            Some(min) => parse_size(min),
            None => self.memory_bytes(),
        }
    }

    pub fn boot_disk_bytes(&self) -> Result<u64> {
        parse_size(&self.boot_disk)
    }

    pub fn osd_disk_bytes(&self) -> Result<Option<u64>> {
        self.osd_disk.as_deref().map(parse_size).transpose()
    }
}

/// 虚拟机放置提示（主机池环境使用）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmPlacement {
    #[serde(default)]
    pub host: Option<String>,
}

/// 节点定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    pub role: NodeRole,
    /// 节点私有地址（最终静态地址）
    pub address: Ipv4Addr,
    #[serde(default)]
    pub public_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub labels: NodeLabels,
    #[serde(default)]
    pub vm: VmPlacement,
}

impl NodeDefinition {
    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    pub fn is_worker(&self) -> bool {
        self.role == NodeRole::Worker
    }
}

/// 本机 libvirt 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHostingOptions {
    #[serde(default = "default_local_uri")]
    pub uri: String,
    #[serde(default = "default_storage_pool")]
    pub storage_pool: String,
    /// 指定使用的虚拟交换机，缺省时自动选择外部交换机
    #[serde(default)]
    pub switch_name: Option<String>,
}

fn default_local_uri() -> String {
    "qemu:///system".to_string()
}

fn default_storage_pool() -> String {
    "default".to_string()
}

impl Default for LocalHostingOptions {
    fn default() -> Self {
        Self {
            uri: default_local_uri(),
            storage_pool: default_storage_pool(),
            switch_name: None,
        }
    }
}

/// 主机池中的一台 hypervisor 主机
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorHost {
    pub name: String,
    pub address: String,
    #[serde(default = "default_host_username")]
    pub username: String,
}

fn default_host_username() -> String {
    "root".to_string()
}

impl HypervisorHost {
    /// libvirt 远程连接 URI
    pub fn connection_uri(&self) -> String {
        format!("qemu+ssh://{}@{}/system", self.username, self.address)
    }
}

/// 远程主机池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHostingOptions {
    pub hosts: Vec<HypervisorHost>,
    #[serde(default = "default_storage_pool")]
    pub storage_pool: String,
    #[serde(default)]
    pub switch_name: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

/// 托管环境配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingDefinition {
    pub environment: HostingEnvironment,
    /// 基础系统磁盘镜像地址
    #[serde(default)]
    pub template_uri: Option<String>,
    /// 虚拟机名称前缀，缺省为 `<集群名>-`
    #[serde(default)]
    pub vm_name_prefix: Option<String>,
    #[serde(default)]
    pub local: Option<LocalHostingOptions>,
    #[serde(default)]
    pub pool: Option<PoolHostingOptions>,
}

/// 集群定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDefinition {
    pub name: String,
    pub network: NetworkDefinition,
    pub hosting: HostingDefinition,
    pub nodes: Vec<NodeDefinition>,
}

impl ClusterDefinition {
    /// 从 JSON 文本解析
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// 从 JSON 文件加载
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("无法读取集群定义 {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// 校验集群定义
    pub fn validate(&self) -> Result<()> {
        if !validate_dns_label(&self.name) {
            return Err(Error::Validation(format!("无效的集群名称: '{}'", self.name)));
        }

        if self.nodes.is_empty() {
            return Err(Error::Validation("集群至少需要一个节点".to_string()));
        }

        let network = &self.network;

        if !network.node_subnet.is_subnet_of(network.premise_subnet) {
            return Err(Error::Validation(format!(
                "节点子网 {} 不在本地子网 {} 内",
                network.node_subnet, network.premise_subnet
            )));
        }

        if !network.premise_subnet.contains(network.gateway) {
            return Err(Error::Validation(format!(
                "网关 {} 不在本地子网 {} 内",
                network.gateway, network.premise_subnet
            )));
        }

        if network.nameservers.is_empty() {
            return Err(Error::Validation("至少需要配置一个 DNS 服务器".to_string()));
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();

        for node in &self.nodes {
            if !validate_dns_label(&node.name) {
                return Err(Error::Validation(format!("无效的节点名称: '{}'", node.name)));
            }

            if !names.insert(node.name.as_str()) {
                return Err(Error::Validation(format!("节点名称重复: {}", node.name)));
            }

            let subnet = network.node_subnet;
            if !subnet.contains(node.address)
                || node.address == subnet.network()
                || node.address == subnet.broadcast()
            {
                return Err(Error::Validation(format!(
                    "节点 {} 的地址 {} 不在节点子网 {} 的可用范围内",
                    node.name, node.address, subnet
                )));
            }

            if node.address == network.gateway {
                return Err(Error::Validation(format!(
                    "节点 {} 的地址与网关冲突: {}",
                    node.name, node.address
                )));
            }

            if !addresses.insert(node.address) {
                return Err(Error::Validation(format!(
                    "节点地址重复: {} ({})",
                    node.address, node.name
                )));
            }

            if node.labels.processors == 0 {
                return Err(Error::Validation(format!("节点 {} 的处理器数量不能为 0", node.name)));
            }

            let memory = node.labels.memory_bytes().map_err(|e| label_error(node, e))?;
            let min_memory = node.labels.min_memory_bytes().map_err(|e| label_error(node, e))?;
            if min_memory > memory {
                return Err(Error::Validation(format!(
                    "节点 {} 的 min_memory 大于 memory",
                    node.name
                )));
            }
            node.labels.boot_disk_bytes().map_err(|e| label_error(node, e))?;
            node.labels.osd_disk_bytes().map_err(|e| label_error(node, e))?;
        }

        if !self.nodes.iter().any(NodeDefinition::is_master) {
            return Err(Error::Validation("集群至少需要一个 master 节点".to_string()));
        }

        Ok(())
    }

    /// 按名称排序的节点
    pub fn sorted_nodes(&self) -> Vec<&NodeDefinition> {
        let mut nodes: Vec<&NodeDefinition> = self.nodes.iter().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub fn masters(&self) -> Vec<&NodeDefinition> {
        self.sorted_nodes().into_iter().filter(|n| n.is_master()).collect()
    }

    pub fn workers(&self) -> Vec<&NodeDefinition> {
        self.sorted_nodes().into_iter().filter(|n| n.is_worker()).collect()
    }

    /// 排序后的第一个 master
    pub fn first_master(&self) -> Option<&NodeDefinition> {
        self.masters().into_iter().next()
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// 虚拟机名称前缀
    pub fn vm_name_prefix(&self) -> String {
        self.hosting
            .vm_name_prefix
            .clone()
            .unwrap_or_else(|| format!("{}-", self.name))
    }

    /// 节点对应的虚拟机名称
    pub fn vm_name(&self, node: &NodeDefinition) -> String {
        format!("{}{}", self.vm_name_prefix(), node.name)
    }
}

fn label_error(node: &NodeDefinition, e: Error) -> Error {
    Error::Validation(format!("节点 {} 的资源标签无效: {}", node.name, e))
}

/// 常量定义
pub mod constants {
    /// 默认 SSH 端口
    pub const DEFAULT_SSH_PORT: u16 = 22;

    /// 节点上记录幂等操作完成标记的目录
    pub const NODE_STATE_DIR: &str = "/var/lib/cluster-setup/state";

    /// 模板缓存元数据文件扩展名
    pub const TEMPLATE_INFO_EXTENSION: &str = "info";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "name": "demo",
            "network": {
                "premise_subnet": "10.0.0.0/16",
                "node_subnet": "10.0.1.0/24",
                "gateway": "10.0.0.1",
                "nameservers": ["8.8.8.8"]
            },
            "hosting": { "environment": "local" },
            "nodes": [
                { "name": "worker-1", "role": "worker", "address": "10.0.1.21" },
                { "name": "master-0", "role": "master", "address": "10.0.1.10",
                  "labels": { "osd_disk": "16GiB" } },
                { "name": "worker-0", "role": "worker", "address": "10.0.1.20" }
            ]
        }"#
    }

    #[test]
    fn test_parse_and_validate() {
        let definition = ClusterDefinition::from_json(sample_json()).unwrap();
        definition.validate().unwrap();

        assert_eq!(definition.hosting.environment, HostingEnvironment::Local);
        assert_eq!(definition.first_master().unwrap().name, "master-0");

        let workers: Vec<&str> = definition.workers().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(workers, vec!["worker-0", "worker-1"]);

        let master = definition.node("master-0").unwrap();
        assert_eq!(master.labels.osd_disk_bytes().unwrap(), Some(16 * 1024 * 1024 * 1024));
        assert_eq!(definition.vm_name(master), "demo-master-0");
    }

    #[test]
    fn test_node_outside_subnet_is_rejected() {
        let mut definition = ClusterDefinition::from_json(sample_json()).unwrap();
        definition.nodes[0].address = "10.0.2.5".parse().unwrap();

        assert!(matches!(definition.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_node_subnet_must_be_inside_premise_subnet() {
        let mut definition = ClusterDefinition::from_json(sample_json()).unwrap();
        definition.network.node_subnet = "192.168.0.0/24".parse().unwrap();

        assert!(matches!(definition.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_duplicate_names_and_addresses_are_rejected() {
        let mut definition = ClusterDefinition::from_json(sample_json()).unwrap();
        definition.nodes[2].name = "worker-1".to_string();
        assert!(definition.validate().is_err());

        let mut definition = ClusterDefinition::from_json(sample_json()).unwrap();
        definition.nodes[2].address = definition.nodes[0].address;
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_master_is_required() {
        let mut definition = ClusterDefinition::from_json(sample_json()).unwrap();
        for node in &mut definition.nodes {
            node.role = NodeRole::Worker;
        }

        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_invalid_label_is_rejected() {
        let mut definition = ClusterDefinition::from_json(sample_json()).unwrap();
        definition.nodes[1].labels.boot_disk = "lots".to_string();

        assert!(matches!(definition.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_pool_host_uri() {
        let host = HypervisorHost {
            name: "hv-1".to_string(),
            address: "10.0.0.50".to_string(),
            username: "root".to_string(),
        };

        assert_eq!(host.connection_uri(), "qemu+ssh://root@10.0.0.50/system");
    }
}
