/// 主机可达性探测
///
/// 并发探测一组候选主机，并按 [`ReachableHostMode`] 决定没有可达主机时的行为

use async_trait::async_trait;
use common::{Error, Result};
use futures::future::join_all;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// 没有可达主机时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachableHostMode {
    /// 返回第一个候选，并标记为不可达
    ReturnFirst,
    /// 返回 `None`
    ReturnNull,
    /// 返回错误
    Throw,
}

/// 探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachableHost {
    pub host: String,
    /// 位于候选列表中的位置
    pub index: usize,
    pub unreachable: bool,
}

/// 可达性探测器
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn probe(&self, host: &str) -> bool;
}

/// 调用系统 `ping` 进行 ICMP 探测
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn probe(&self, host: &str) -> bool {
        let wait = self.timeout.as_secs().max(1).to_string();
        let output = Command::new("ping")
            .args(["-c", "1", "-W", wait.as_str(), host])
            .output()
            .await;

        match output {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!("无法执行 ping: {}", e);
                false
            }
        }
    }
}

/// TCP 端口探测
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self, host: &str) -> bool {
        matches!(
            timeout(self.timeout, TcpStream::connect((host, self.port))).await,
            Ok(Ok(_))
        )
    }
}

/// 从候选主机中选出第一个可达的主机（按列表顺序）
pub async fn get_reachable_host(
    hosts: &[String],
    probe: &dyn ReachabilityProbe,
    mode: ReachableHostMode,
) -> Result<Option<ReachableHost>> {
    if hosts.is_empty() {
        return Err(Error::InvalidArgument("候选主机列表为空".to_string()));
    }

    let results = join_all(hosts.iter().map(|host| probe.probe(host))).await;

    if let Some(index) = results.iter().position(|reachable| *reachable) {
        debug!("可达主机: {}", hosts[index]);
        return Ok(Some(ReachableHost {
            host: hosts[index].clone(),
            index,
            unreachable: false,
        }));
    }

    match mode {
        ReachableHostMode::ReturnFirst => {
            warn!("⚠️ 所有主机均不可达，使用第一个: {}", hosts[0]);
            Ok(Some(ReachableHost {
                host: hosts[0].clone(),
                index: 0,
                unreachable: true,
            }))
        }
        ReachableHostMode::ReturnNull => Ok(None),
        ReachableHostMode::Throw => Err(Error::Network(format!(
            "所有主机均不可达: {}",
            hosts.join(", ")
        ))),
    }
}
