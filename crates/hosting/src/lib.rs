/// 托管环境
///
/// 虚拟化客户端（virsh / libvirt）、系统盘模板缓存、虚拟机配置流程，
/// 以及各托管环境的管理器和注册表

pub mod client;
pub mod manager;
pub mod provision;
pub mod template;

pub use client::{VirshClient, VirtualizationClient};
pub use manager::{
    ClientBackend, HostingContext, HostingManager, HostingRegistry, LocalHostingManager,
    MachineHostingManager, PoolHostingManager,
};
pub use provision::{HypervisorTarget, ProvisionOptions, VmProvisioner};
pub use template::{DriveTemplateInfo, TemplateCache};
