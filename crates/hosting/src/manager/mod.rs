/// 托管环境管理器
///
/// 每种托管环境一个实现，负责预检查集群定义并创建集群所需的虚拟机。

mod local;
mod machine;
mod pool;
mod registry;

pub use local::LocalHostingManager;
pub use machine::MachineHostingManager;
pub use pool::PoolHostingManager;
pub use registry::{HostingFactory, HostingRegistry};

use async_trait::async_trait;
use common::models::HostingEnvironment;
use common::{ClusterDefinition, Error, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::client::{VirshClient, VirtualizationClient};
use crate::provision::ProvisionOptions;

/// 虚拟化客户端的实现方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientBackend {
    /// `virsh` 命令行
    #[default]
    Virsh,
    /// libvirt 原生绑定（需要 `libvirt` 特性）
    Libvirt,
}

impl ClientBackend {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "virsh" => Ok(ClientBackend::Virsh),
            "libvirt" => Ok(ClientBackend::Libvirt),
            other => Err(Error::Config(format!("未知的虚拟化客户端类型: {}", other))),
        }
    }

    /// 按选定的实现创建客户端
    pub fn connect(&self, virsh: VirshClient) -> Result<Arc<dyn VirtualizationClient>> {
        match self {
            ClientBackend::Virsh => Ok(Arc::new(virsh)),
            #[cfg(feature = "libvirt")]
            ClientBackend::Libvirt => Ok(Arc::new(crate::client::LibvirtClient::connect(virsh)?)),
            #[cfg(not(feature = "libvirt"))]
            ClientBackend::Libvirt => Err(Error::Config(
                "未启用 libvirt 特性，无法使用原生 libvirt 客户端".to_string(),
            )),
        }
    }
}

/// 创建托管环境管理器所需的运行环境
#[derive(Debug, Clone)]
pub struct HostingContext {
    /// 系统盘模板缓存目录
    pub cache_dir: PathBuf,
    pub backend: ClientBackend,
    pub provision: ProvisionOptions,
}

impl HostingContext {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            backend: ClientBackend::default(),
            provision: ProvisionOptions::default(),
        }
    }
}

#[async_trait]
pub trait HostingManager: Send + Sync {
    fn environment(&self) -> HostingEnvironment;

    /// 托管环境相关的预检查，在任何修改操作之前执行
    fn validate(&self, definition: &ClusterDefinition) -> Result<()>;

    /// 创建并配置集群节点；有节点故障时返回 `Ok(false)`
    async fn provision(&self, force: bool) -> Result<bool>;

    /// 节点的 SSH 地址和端口
    fn ssh_endpoint(&self, node: &str) -> Result<(Ipv4Addr, u16)>;

    /// 节点上数据盘的设备名前缀
    fn drive_prefix(&self) -> &'static str;

    fn requires_admin_privileges(&self) -> bool;

    /// 是否不需要创建任何资源
    fn is_provision_nop(&self) -> bool {
        false
    }

    /// 节点步骤的最大并发数
    fn max_parallel(&self) -> usize;
}

/// 托管环境共用的检查：模板地址、节点规格
pub(crate) fn validate_vm_cluster(definition: &ClusterDefinition) -> Result<()> {
    let uri = definition
        .hosting
        .template_uri
        .as_deref()
        .ok_or_else(|| Error::Validation("缺少系统盘模板地址 (hosting.template_uri)".to_string()))?;

    let url = reqwest::Url::parse(uri)
        .map_err(|e| Error::Validation(format!("无效的模板地址 '{}': {}", uri, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!("模板地址只支持 http/https: {}", uri)));
    }

    for node in &definition.nodes {
        let vm_name = definition.vm_name(node);
        if !common::utils::validate_dns_label(&vm_name) {
            return Err(Error::Validation(format!("无效的虚拟机名称: {}", vm_name)));
        }
    }

    Ok(())
}

/// 按名称查找节点的 SSH 地址
pub(crate) fn node_endpoint(definition: &ClusterDefinition, node: &str) -> Result<(Ipv4Addr, u16)> {
    definition
        .node(node)
        .map(|n| (n.address, common::models::constants::DEFAULT_SSH_PORT))
        .ok_or_else(|| Error::NotFound(format!("节点不存在: {}", node)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_backend_parse() {
        assert_eq!(ClientBackend::parse("virsh").unwrap(), ClientBackend::Virsh);
        assert_eq!(ClientBackend::parse("LibVirt").unwrap(), ClientBackend::Libvirt);
        assert!(ClientBackend::parse("hyperv").is_err());
    }

    #[cfg(not(feature = "libvirt"))]
    #[test]
    fn test_libvirt_backend_requires_feature() {
        let virsh = VirshClient::new("qemu:///system", "default");
        assert!(ClientBackend::Libvirt.connect(virsh).is_err());
    }
}
