/// 集群代理
///
/// 集群在内存中的模型：按名称排序的节点代理集合、角色查询、可达性选择

use common::{ClusterDefinition, Error, Result};
use futures::future::join_all;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::node::NodeProxy;
use crate::reachable::{get_reachable_host, ReachabilityProbe, ReachableHostMode};
use crate::shell::{RemoteShell, SshCredentials};

pub struct ClusterProxy {
    definition: Arc<ClusterDefinition>,
    credentials: SshCredentials,
    shell: Arc<dyn RemoteShell>,
    probe: Arc<dyn ReachabilityProbe>,
    nodes: RwLock<Arc<Vec<Arc<NodeProxy>>>>,
}

impl ClusterProxy {
    pub fn new(
        definition: Arc<ClusterDefinition>,
        credentials: SshCredentials,
        shell: Arc<dyn RemoteShell>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let cluster = Self {
            definition,
            credentials,
            shell,
            probe,
            nodes: RwLock::new(Arc::new(Vec::new())),
        };
        cluster.create_nodes();
        cluster
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &Arc<ClusterDefinition> {
        &self.definition
    }

    /// 按集群定义重新创建全部节点代理
    ///
    /// 节点地址变化后调用；整体替换节点集合，之前取得的节点代理不受影响。
    pub fn create_nodes(&self) {
        let nodes: Vec<Arc<NodeProxy>> = self
            .definition
            .sorted_nodes()
            .into_iter()
            .map(|definition| {
                Arc::new(NodeProxy::new(
                    definition,
                    self.credentials.clone(),
                    self.shell.clone(),
                ))
            })
            .collect();

        info!("🔄 [{}] 创建 {} 个节点代理", self.name(), nodes.len());
        *self.nodes.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(nodes);
    }

    /// 全部节点（按名称排序）
    pub fn nodes(&self) -> Arc<Vec<Arc<NodeProxy>>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn node(&self, name: &str) -> Result<Arc<NodeProxy>> {
        self.nodes()
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("节点不存在: {}", name)))
    }

    pub fn masters(&self) -> Vec<Arc<NodeProxy>> {
        self.nodes().iter().filter(|n| n.is_master()).cloned().collect()
    }

    pub fn workers(&self) -> Vec<Arc<NodeProxy>> {
        self.nodes().iter().filter(|n| n.is_worker()).cloned().collect()
    }

    /// 排序后的第一个 master
    pub fn first_master(&self) -> Result<Arc<NodeProxy>> {
        self.masters()
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("集群 {} 没有 master 节点", self.name())))
    }

    pub async fn get_reachable_master(&self, mode: ReachableHostMode) -> Result<Option<Arc<NodeProxy>>> {
        self.get_reachable_node(|n| n.is_master(), mode).await
    }

    /// 从满足条件的节点中选出一个可达节点
    pub async fn get_reachable_node<P>(
        &self,
        predicate: P,
        mode: ReachableHostMode,
    ) -> Result<Option<Arc<NodeProxy>>>
    where
        P: Fn(&NodeProxy) -> bool,
    {
        let candidates: Vec<Arc<NodeProxy>> = self
            .nodes()
            .iter()
            .filter(|n| predicate(n.as_ref()))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return match mode {
                ReachableHostMode::Throw => {
                    Err(Error::NotFound("没有满足条件的节点".to_string()))
                }
                _ => Ok(None),
            };
        }

        let hosts: Vec<String> = candidates.iter().map(|n| n.address().to_string()).collect();
        let selected = get_reachable_host(&hosts, self.probe.as_ref(), mode).await?;

        Ok(selected.map(|host| {
            let node = candidates[host.index].clone();
            if host.unreachable {
                warn!("⚠️ 节点 {} 不可达，仍按第一个候选返回", node.name());
            }
            node
        }))
    }

    /// 向所有未故障节点上传同一份文本文件
    pub async fn upload_text_to_all(&self, path: &str, text: &str, mode: &str) -> Result<()> {
        let nodes = self.nodes();
        let targets: Vec<&Arc<NodeProxy>> = nodes.iter().filter(|n| !n.is_faulted()).collect();

        let results = join_all(targets.iter().map(|n| n.upload_text(path, text, mode))).await;

        let failed: Vec<String> = targets
            .iter()
            .zip(results)
            .filter_map(|(node, result)| result.err().map(|e| format!("{}: {}", node.name(), e)))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Remote(format!("上传 {} 失败: {}", path, failed.join("; "))))
        }
    }

    /// 输出一条带集群名的日志
    pub fn log_line(&self, message: &str) {
        info!(cluster = %self.name(), "{}", message);
    }
}
