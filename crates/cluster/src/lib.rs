/// 集群控制
///
/// 远程命令通道、节点代理、集群代理、可达性探测以及配置步骤流水线

pub mod cluster;
pub mod node;
pub mod reachable;
pub mod setup;
pub mod shell;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::ClusterProxy;
pub use node::{AddressOverride, NodeProxy, NodeStatus};
pub use reachable::{get_reachable_host, PingProbe, ReachabilityProbe, ReachableHost, ReachableHostMode, TcpProbe};
pub use setup::SetupController;
pub use shell::{CommandResponse, RemoteCommand, RemoteShell, SshCredentials, SshEndpoint, SshShell};
