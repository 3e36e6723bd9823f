/// 本机托管环境
///
/// 所有节点都创建在本机的 libvirt/QEMU 上。同一个 hypervisor 上的虚拟机创建
/// 串行执行，节点步骤的并发数固定为 1。

use async_trait::async_trait;
use cluster::ClusterProxy;
use common::models::HostingEnvironment;
use common::{ClusterDefinition, Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

use super::{node_endpoint, validate_vm_cluster, HostingContext, HostingManager};
use crate::client::{VirshClient, VirtualizationClient};
use crate::provision::{HypervisorTarget, VmProvisioner};
use crate::template::TemplateCache;

const LOCAL_HOST_NAME: &str = "localhost";

pub struct LocalHostingManager {
    cluster: Arc<ClusterProxy>,
    provisioner: Arc<VmProvisioner>,
}

impl LocalHostingManager {
    pub fn new(cluster: Arc<ClusterProxy>, context: &HostingContext) -> Result<Self> {
        let options = cluster.definition().hosting.local.clone().unwrap_or_default();
        let client = context.backend.connect(VirshClient::local(&options))?;
        Self::with_client(cluster, client, context)
    }

    /// 使用指定的虚拟化客户端
    pub fn with_client(
        cluster: Arc<ClusterProxy>,
        client: Arc<dyn VirtualizationClient>,
        context: &HostingContext,
    ) -> Result<Self> {
        let switch_name = cluster
            .definition()
            .hosting
            .local
            .as_ref()
            .and_then(|local| local.switch_name.clone());

        info!("🖥️ 本机托管环境: {}", client.describe());

        let targets = vec![HypervisorTarget {
            name: LOCAL_HOST_NAME.to_string(),
            client,
            switch_name,
        }];
        let placement: HashMap<String, usize> = cluster
            .definition()
            .nodes
            .iter()
            .map(|node| (node.name.clone(), 0))
            .collect();

        let mut options = context.provision.clone();
        options.max_parallel = 1;

        let templates = Arc::new(TemplateCache::new(context.cache_dir.clone()));
        let provisioner = VmProvisioner::new(cluster.clone(), targets, placement, templates, options)?;

        Ok(Self {
            cluster,
            provisioner: Arc::new(provisioner),
        })
    }
}

#[async_trait]
impl HostingManager for LocalHostingManager {
    fn environment(&self) -> HostingEnvironment {
        HostingEnvironment::Local
    }

    fn validate(&self, definition: &ClusterDefinition) -> Result<()> {
        if definition.hosting.pool.is_some() {
            return Err(Error::Validation(
                "本机托管环境不能配置主机池 (hosting.pool)".to_string(),
            ));
        }

        validate_vm_cluster(definition)
    }

    async fn provision(&self, force: bool) -> Result<bool> {
        self.provisioner.provision(force).await
    }

    fn ssh_endpoint(&self, node: &str) -> Result<(Ipv4Addr, u16)> {
        node_endpoint(self.cluster.definition(), node)
    }

    fn drive_prefix(&self) -> &'static str {
        "vd"
    }

    fn requires_admin_privileges(&self) -> bool {
        true
    }

    fn max_parallel(&self) -> usize {
        self.provisioner.options().max_parallel
    }
}
