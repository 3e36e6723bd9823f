/// 运行环境
///
/// 启动时由配置构建一次，之后只读：SSH 凭据、模板缓存目录、超时参数、
/// 虚拟化客户端类型。

use cluster::{ClusterProxy, SshCredentials, SshShell, TcpProbe};
use common::models::constants::DEFAULT_SSH_PORT;
use common::{ClusterDefinition, Result};
use hosting::{ClientBackend, HostingContext, ProvisionOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct EnvironmentContext {
    pub definition_path: PathBuf,
    pub force: bool,
    pub credentials: SshCredentials,
    pub probe_timeout: Duration,
    pub hosting: HostingContext,
}

impl EnvironmentContext {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut credentials = SshCredentials::new(settings.ssh.username.clone());
        credentials.connect_timeout = Duration::from_secs(settings.ssh.connect_timeout_secs);
        if let Some(key) = &settings.ssh.private_key {
            credentials = credentials.with_private_key(key.clone());
        }

        let provision = &settings.provision;
        let hosting = HostingContext {
            cache_dir: settings.cache_dir.clone(),
            backend: ClientBackend::parse(&settings.backend)?,
            provision: ProvisionOptions {
                address_timeout: Duration::from_secs(provision.address_timeout_secs),
                poll_interval: Duration::from_secs(provision.poll_interval_secs.max(1)),
                boot_timeout: Duration::from_secs(provision.boot_timeout_secs),
                retry_attempts: provision.retry_attempts.max(1),
                retry_delay: Duration::from_secs(provision.retry_delay_secs),
                ..ProvisionOptions::default()
            },
        };

        Ok(Self {
            definition_path: settings.definition.clone(),
            force: settings.force,
            credentials,
            probe_timeout: Duration::from_secs(settings.ssh.probe_timeout_secs),
            hosting,
        })
    }

    /// 通过系统 ssh 访问节点的集群代理
    pub fn cluster(&self, definition: ClusterDefinition) -> Arc<ClusterProxy> {
        Arc::new(ClusterProxy::new(
            Arc::new(definition),
            self.credentials.clone(),
            Arc::new(SshShell::new()),
            Arc::new(TcpProbe::new(DEFAULT_SSH_PORT, self.probe_timeout)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ProvisionSettings, SshSettings};

    fn settings(backend: &str) -> Settings {
        Settings {
            definition: PathBuf::from("cluster.json"),
            force: true,
            cache_dir: PathBuf::from("/tmp/templates"),
            backend: backend.to_string(),
            log_format: "text".to_string(),
            ssh: SshSettings {
                username: "admin".to_string(),
                private_key: Some(PathBuf::from("/keys/id_ed25519")),
                connect_timeout_secs: 7,
                probe_timeout_secs: 2,
            },
            provision: ProvisionSettings {
                address_timeout_secs: 120,
                poll_interval_secs: 0,
                boot_timeout_secs: 300,
                retry_attempts: 0,
                retry_delay_secs: 1,
            },
        }
    }

    #[test]
    fn test_from_settings() {
        let context = EnvironmentContext::from_settings(&settings("virsh")).unwrap();

        assert!(context.force);
        assert_eq!(context.credentials.username, "admin");
        assert_eq!(context.credentials.private_key, Some(PathBuf::from("/keys/id_ed25519")));
        assert_eq!(context.credentials.connect_timeout, Duration::from_secs(7));
        assert_eq!(context.hosting.backend, ClientBackend::Virsh);
        assert_eq!(context.hosting.provision.address_timeout, Duration::from_secs(120));
        // 轮询间隔和重试次数至少为 1
        assert_eq!(context.hosting.provision.poll_interval, Duration::from_secs(1));
        assert_eq!(context.hosting.provision.retry_attempts, 1);
    }

    #[test]
    fn test_unknown_backend() {
        assert!(EnvironmentContext::from_settings(&settings("hyperv")).is_err());
    }
}
