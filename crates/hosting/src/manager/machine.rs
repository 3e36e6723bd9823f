/// 物理机托管环境
///
/// 节点是预先准备好的机器，不需要创建任何资源。

use async_trait::async_trait;
use cluster::ClusterProxy;
use common::models::constants::DEFAULT_SSH_PORT;
use common::models::HostingEnvironment;
use common::{ClusterDefinition, Error, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

use super::HostingManager;

pub struct MachineHostingManager {
    cluster: Arc<ClusterProxy>,
}

impl MachineHostingManager {
    pub fn new(cluster: Arc<ClusterProxy>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl HostingManager for MachineHostingManager {
    fn environment(&self) -> HostingEnvironment {
        HostingEnvironment::Machine
    }

    fn validate(&self, definition: &ClusterDefinition) -> Result<()> {
        if definition.hosting.local.is_some() || definition.hosting.pool.is_some() {
            return Err(Error::Validation(
                "物理机托管环境不能配置 hosting.local 或 hosting.pool".to_string(),
            ));
        }
        Ok(())
    }

    async fn provision(&self, _force: bool) -> Result<bool> {
        info!("⏭️ [{}] 物理机环境，无需创建虚拟机", self.cluster.name());
        Ok(true)
    }

    /// 优先使用公网地址
    fn ssh_endpoint(&self, node: &str) -> Result<(Ipv4Addr, u16)> {
        let definition = self
            .cluster
            .definition()
            .node(node)
            .ok_or_else(|| Error::NotFound(format!("节点不存在: {}", node)))?;

        Ok((
            definition.public_address.unwrap_or(definition.address),
            DEFAULT_SSH_PORT,
        ))
    }

    fn drive_prefix(&self) -> &'static str {
        "sd"
    }

    fn requires_admin_privileges(&self) -> bool {
        false
    }

    fn is_provision_nop(&self) -> bool {
        true
    }

    fn max_parallel(&self) -> usize {
        self.cluster.nodes().len().max(1)
    }
}
