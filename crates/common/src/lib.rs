/// 集群配置工具 - 公共库
///
/// 提供集群定义模型、错误处理、工具函数等，由 cluster / hosting / provisioner 共享

pub mod errors;
pub mod models;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use models::{ClusterDefinition, NodeDefinition, NodeRole};
