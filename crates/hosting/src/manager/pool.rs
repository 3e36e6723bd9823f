/// 远程主机池托管环境
///
/// 每台主机一个虚拟化客户端（`qemu+ssh://`），节点按 `vm.host` 放置；
/// 只有一台主机时可以省略。不同主机上的节点并行创建。

use async_trait::async_trait;
use cluster::ClusterProxy;
use common::models::{HostingEnvironment, PoolHostingOptions};
use common::{ClusterDefinition, Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

use super::{node_endpoint, validate_vm_cluster, HostingContext, HostingManager};
use crate::client::{VirshClient, VirtualizationClient};
use crate::provision::{HypervisorTarget, VmProvisioner};
use crate::template::TemplateCache;

pub struct PoolHostingManager {
    cluster: Arc<ClusterProxy>,
    provisioner: Arc<VmProvisioner>,
}

fn pool_options(definition: &ClusterDefinition) -> Result<&PoolHostingOptions> {
    definition
        .hosting
        .pool
        .as_ref()
        .ok_or_else(|| Error::Validation("主机池托管环境缺少 hosting.pool 配置".to_string()))
}

/// 节点到主机下标的映射
fn place_nodes(definition: &ClusterDefinition) -> Result<HashMap<String, usize>> {
    let pool = pool_options(definition)?;

    if pool.hosts.is_empty() {
        return Err(Error::Validation("主机池至少需要一台主机".to_string()));
    }

    let mut names = HashSet::new();
    for host in &pool.hosts {
        if !names.insert(host.name.as_str()) {
            return Err(Error::Validation(format!("主机名称重复: {}", host.name)));
        }
    }

    let mut placement = HashMap::new();
    for node in &definition.nodes {
        let index = match node.vm.host.as_deref() {
            Some(host) => pool.hosts.iter().position(|h| h.name == host).ok_or_else(|| {
                Error::Validation(format!("节点 {} 指定的主机 {} 不在主机池中", node.name, host))
            })?,
            None if pool.hosts.len() == 1 => 0,
            None => {
                return Err(Error::Validation(format!(
                    "主机池有多台主机，节点 {} 必须指定 vm.host",
                    node.name
                )));
            }
        };
        placement.insert(node.name.clone(), index);
    }

    Ok(placement)
}

impl PoolHostingManager {
    pub fn new(cluster: Arc<ClusterProxy>, context: &HostingContext) -> Result<Self> {
        let pool = pool_options(cluster.definition())?;

        let mut clients = Vec::with_capacity(pool.hosts.len());
        for host in &pool.hosts {
            let client = context
                .backend
                .connect(VirshClient::remote(host, &pool.storage_pool))?;
            clients.push((host.name.clone(), client));
        }

        Self::with_clients(cluster, clients, context)
    }

    /// 使用指定的客户端，顺序与 `hosting.pool.hosts` 一致
    pub fn with_clients(
        cluster: Arc<ClusterProxy>,
        clients: Vec<(String, Arc<dyn VirtualizationClient>)>,
        context: &HostingContext,
    ) -> Result<Self> {
        let definition = cluster.definition().clone();
        let pool = pool_options(&definition)?;
        let placement = place_nodes(&definition)?;

        if clients.len() != pool.hosts.len() {
            return Err(Error::Config(format!(
                "主机池有 {} 台主机，但提供了 {} 个客户端",
                pool.hosts.len(),
                clients.len()
            )));
        }

        let targets: Vec<HypervisorTarget> = clients
            .into_iter()
            .map(|(name, client)| {
                info!("🖥️ 主机池成员 {}: {}", name, client.describe());
                HypervisorTarget {
                    name,
                    client,
                    switch_name: pool.switch_name.clone(),
                }
            })
            .collect();

        let mut options = context.provision.clone();
        options.max_parallel = pool.max_parallel.unwrap_or(pool.hosts.len()).max(1);

        let templates = Arc::new(TemplateCache::new(context.cache_dir.clone()));
        let provisioner = VmProvisioner::new(cluster.clone(), targets, placement, templates, options)?;

        Ok(Self {
            cluster,
            provisioner: Arc::new(provisioner),
        })
    }
}

#[async_trait]
impl HostingManager for PoolHostingManager {
    fn environment(&self) -> HostingEnvironment {
        HostingEnvironment::Pool
    }

    fn validate(&self, definition: &ClusterDefinition) -> Result<()> {
        if definition.hosting.local.is_some() {
            return Err(Error::Validation(
                "主机池托管环境不能配置 hosting.local".to_string(),
            ));
        }

        place_nodes(definition)?;
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
        false
    }

    fn max_parallel(&self) -> usize {
        self.provisioner.options().max_parallel
    }
}
