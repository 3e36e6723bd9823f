/// 配置管理
///
/// 优先级从低到高：内置默认值、配置文件（缺省 `provisioner.toml`，可选）、
/// `PROVISIONER_` 前缀的环境变量（嵌套字段用 `__` 分隔，如 `PROVISIONER_SSH__USERNAME`）。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "provisioner.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// 集群定义文件（JSON）
    pub definition: PathBuf,
    /// 删除与集群虚拟机同名的已有虚拟机
    pub force: bool,
    /// 系统盘模板缓存目录
    pub cache_dir: PathBuf,
    /// 虚拟化客户端：virsh / libvirt
    pub backend: String,
    /// 日志格式：text / json
    pub log_format: String,
    pub ssh: SshSettings,
    pub provision: ProvisionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSettings {
    pub username: String,
    pub private_key: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// 可达性探测的超时
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionSettings {
    pub address_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub boot_timeout_secs: u64,
    pub retry_attempts: usize,
    pub retry_delay_secs: u64,
}

impl Settings {
    /// 加载配置；`file` 为空时使用当前目录下的 `provisioner.toml`
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Config::builder()
            .set_default("definition", "cluster.json")?
            .set_default("force", false)?
            .set_default("cache_dir", "/var/cache/cluster-provisioner/templates")?
            .set_default("backend", "virsh")?
            .set_default("log_format", "text")?
            .set_default("ssh.username", "ubuntu")?
            .set_default("ssh.connect_timeout_secs", 10)?
            .set_default("ssh.probe_timeout_secs", 3)?
            .set_default("provision.address_timeout_secs", 300)?
            .set_default("provision.poll_interval_secs", 5)?
            .set_default("provision.boot_timeout_secs", 600)?
            .set_default("provision.retry_attempts", 3)?
            .set_default("provision.retry_delay_secs", 5)?
            .add_source(File::from(file).required(false))
            .add_source(
                Environment::with_prefix("PROVISIONER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
