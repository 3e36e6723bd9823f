/// 配置步骤流水线
///
/// 按注册顺序执行一组步骤。全局步骤只执行一次；节点步骤对每个节点执行一次，
/// 最多 `max_parallel` 个节点并发。某个节点出错只会让该节点进入故障状态并跳过
/// 它后续的步骤，其他节点继续执行；全局步骤出错则终止整个流水线。
/// 所有节点都故障后只执行收尾步骤。

use common::utils::generate_id;
use common::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::node::{NodeProxy, NodeStatus};

type GlobalAction = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
type NodeAction = Arc<dyn Fn(Arc<NodeProxy>, Duration) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type NodePredicate = Arc<dyn Fn(&NodeProxy) -> bool + Send + Sync>;

enum StepKind {
    Global(GlobalAction),
    Node {
        action: NodeAction,
        predicate: Option<NodePredicate>,
        stagger: Option<Duration>,
    },
}

/// 流水线中的一个步骤
pub struct SetupStep {
    label: String,
    quiet: bool,
    /// 所有节点故障时仍然执行
    always: bool,
    kind: StepKind,
}

impl SetupStep {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_global(&self) -> bool {
        matches!(self.kind, StepKind::Global(_))
    }

    pub fn is_always(&self) -> bool {
        self.always
    }
}

pub struct SetupController {
    title: String,
    /// 本次执行的标识，出现在开始和结束的日志中
    run_id: String,
    nodes: Vec<Arc<NodeProxy>>,
    steps: Vec<SetupStep>,
    max_parallel: usize,
}

impl SetupController {
    pub fn new(title: impl Into<String>, nodes: Vec<Arc<NodeProxy>>) -> Self {
        Self {
            title: title.into(),
            run_id: generate_id(),
            nodes,
            steps: Vec::new(),
            max_parallel: 1,
        }
    }

    /// 节点步骤的最大并发数（至少为 1）
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn nodes(&self) -> &[Arc<NodeProxy>] {
        &self.nodes
    }

    pub fn steps(&self) -> &[SetupStep] {
        &self.steps
    }

    /// 添加全局步骤
    pub fn add_global_step<F, Fut>(&mut self, label: impl Into<String>, action: F, quiet: bool)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push_global_step(label.into(), Box::new(move || action().boxed()), quiet, false);
    }

    /// 添加收尾的全局步骤，即使所有节点都已故障也会执行
    pub fn add_final_step<F, Fut>(&mut self, label: impl Into<String>, action: F, quiet: bool)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push_global_step(label.into(), Box::new(move || action().boxed()), quiet, true);
    }

    fn push_global_step(&mut self, label: String, action: GlobalAction, quiet: bool, always: bool) {
        self.steps.push(SetupStep {
            label,
            quiet,
            always,
            kind: StepKind::Global(action),
        });
    }

    /// 添加节点步骤
    ///
    /// `stagger` 不为空时，第 i 个节点收到的延迟为 `i * stagger`，由步骤自己决定如何使用。
    pub fn add_node_step<F, Fut>(&mut self, label: impl Into<String>, action: F, stagger: Option<Duration>)
    where
        F: Fn(Arc<NodeProxy>, Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push_node_step(
            label.into(),
            None,
            Arc::new(move |node, delay| action(node, delay).boxed()),
            stagger,
        );
    }

    /// 添加只作用于部分节点的步骤
    pub fn add_node_step_where<P, F, Fut>(
        &mut self,
        label: impl Into<String>,
        predicate: P,
        action: F,
        stagger: Option<Duration>,
    ) where
        P: Fn(&NodeProxy) -> bool + Send + Sync + 'static,
        F: Fn(Arc<NodeProxy>, Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push_node_step(
            label.into(),
            Some(Arc::new(predicate)),
            Arc::new(move |node, delay| action(node, delay).boxed()),
            stagger,
        );
    }

    /// 添加等待节点上线的步骤
    pub fn add_wait_until_online_step(&mut self, label: impl Into<String>, timeout: Duration) {
        self.add_node_step(
            label,
            move |node: Arc<NodeProxy>, _| async move {
                node.set_status("等待上线");
                node.wait_for_online(timeout).await?;
                node.set_status("已上线");
                Ok(())
            },
            None,
        );
    }

    fn push_node_step(
        &mut self,
        label: String,
        predicate: Option<NodePredicate>,
        action: NodeAction,
        stagger: Option<Duration>,
    ) {
        self.steps.push(SetupStep {
            label,
            quiet: false,
            always: false,
            kind: StepKind::Node {
                action,
                predicate,
                stagger,
            },
        });
    }

    /// 执行流水线
    ///
    /// 所有节点都没有故障时返回 `Ok(true)`；有节点故障返回 `Ok(false)`；
    /// 全局步骤失败返回该错误。
    pub async fn run(&self) -> Result<bool> {
        info!(
            "🚀 {} [{}] ({} 个节点, 并发 {})",
            self.title,
            self.run_id,
            self.nodes.len(),
            self.max_parallel
        );
        let total = self.steps.len();
        let mut stopped = false;

        for (index, step) in self.steps.iter().enumerate() {
            if !self.nodes.is_empty() && self.nodes.iter().all(|n| n.is_faulted()) {
                if !stopped {
                    warn!("⚠️ 所有节点均已故障，只执行收尾步骤");
                    stopped = true;
                }
                if !step.always {
                    debug!("[{}/{}] 跳过 {}", index + 1, total, step.label);
                    continue;
                }
            }

            if step.quiet {
                debug!("[{}/{}] {}", index + 1, total, step.label);
            } else {
                info!("▶️ [{}/{}] {}", index + 1, total, step.label);
            }

            match &step.kind {
                StepKind::Global(action) => {
                    if let Err(e) = action().await {
                        error!("❌ 全局步骤 '{}' 失败: {}", step.label, e);
                        return Err(e);
                    }
                }
                StepKind::Node {
                    action,
                    predicate,
                    stagger,
                } => {
                    self.run_node_step(step, action, predicate.as_ref(), *stagger).await;
                }
            }
        }

        match self.fault_summary() {
            Some(summary) => {
                error!("❌ {} [{}] 失败:\n{}", self.title, self.run_id, summary);
                Ok(false)
            }
            None => {
                info!("✅ {} [{}] 完成", self.title, self.run_id);
                Ok(true)
            }
        }
    }

    async fn run_node_step(
        &self,
        step: &SetupStep,
        action: &NodeAction,
        predicate: Option<&NodePredicate>,
        stagger: Option<Duration>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::new();

        let targets = self
            .nodes
            .iter()
            .filter(|node| predicate.map_or(true, |p| p(node.as_ref())));

        for (position, node) in targets.enumerate() {
            if node.is_faulted() {
                debug!("[{}] 已故障，跳过步骤 '{}'", node.name(), step.label);
                continue;
            }

            let delay = stagger
                .map(|s| s * position as u32)
                .unwrap_or(Duration::ZERO);
            let semaphore = semaphore.clone();
            let action = action.clone();
            let target = node.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| common::Error::Internal(format!("并发控制异常: {}", e)))?;
                action(target, delay).await
            });

            handles.push((node.clone(), handle));
        }

        for (node, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => node.fault(format!("{}: {}", step.label, e)),
                Err(e) => node.fault(format!("{}: 步骤异常终止: {}", step.label, e)),
            }
        }
    }

    /// 所有节点的状态快照
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }

    pub fn is_faulted(&self) -> bool {
        self.nodes.iter().any(|n| n.is_faulted())
    }

    /// 故障节点汇总，没有故障时返回 `None`
    pub fn fault_summary(&self) -> Option<String> {
        let lines: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|n| n.fault_message().map(|m| format!("  {}: {}", n.name(), m)))
            .collect();

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}
