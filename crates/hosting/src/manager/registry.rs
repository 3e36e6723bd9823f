/// 托管环境注册表
///
/// 启动时构建一次，按 `HostingEnvironment` 选择管理器工厂。

use cluster::ClusterProxy;
use common::models::HostingEnvironment;
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    HostingContext, HostingManager, LocalHostingManager, MachineHostingManager, PoolHostingManager,
};

pub type HostingFactory =
    Box<dyn Fn(Arc<ClusterProxy>, &HostingContext) -> Result<Box<dyn HostingManager>> + Send + Sync>;

pub struct HostingRegistry {
    factories: HashMap<HostingEnvironment, HostingFactory>,
}

impl HostingRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, environment: HostingEnvironment, factory: F)
    where
        F: Fn(Arc<ClusterProxy>, &HostingContext) -> Result<Box<dyn HostingManager>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(environment, Box::new(factory));
    }

    pub fn contains(&self, environment: HostingEnvironment) -> bool {
        self.factories.contains_key(&environment)
    }

    /// 为集群定义中的托管环境创建管理器
    pub fn create(
        &self,
        cluster: Arc<ClusterProxy>,
        context: &HostingContext,
    ) -> Result<Box<dyn HostingManager>> {
        let environment = cluster.definition().hosting.environment;
        let factory = self.factories.get(&environment).ok_or_else(|| {
            Error::Config(format!("不支持的托管环境: {:?}", environment))
        })?;

        factory(cluster, context)
    }
}

impl Default for HostingRegistry {
    /// 内置的本机、主机池、物理机三种环境
    fn default() -> Self {
        let mut registry = Self::new();

        registry.register(HostingEnvironment::Local, |cluster, context| {
            Ok(Box::new(LocalHostingManager::new(cluster, context)?) as Box<dyn HostingManager>)
        });
        registry.register(HostingEnvironment::Pool, |cluster, context| {
            Ok(Box::new(PoolHostingManager::new(cluster, context)?) as Box<dyn HostingManager>)
        });
        registry.register(HostingEnvironment::Machine, |cluster, _| {
            Ok(Box::new(MachineHostingManager::new(cluster)) as Box<dyn HostingManager>)
        });

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::testing::{sample_node, MemoryShell, StaticProbe};
    use cluster::SshCredentials;
    use common::models::{HostingDefinition, NetworkDefinition};
    use common::{ClusterDefinition, NodeRole};

    fn cluster(environment: HostingEnvironment) -> Arc<ClusterProxy> {
        let definition = ClusterDefinition {
            name: "demo".to_string(),
            network: NetworkDefinition {
                premise_subnet: "10.0.0.0/24".parse().unwrap(),
                node_subnet: "10.0.0.0/25".parse().unwrap(),
                gateway: "10.0.0.1".parse().unwrap(),
                nameservers: vec!["10.0.0.1".parse().unwrap()],
            },
            hosting: HostingDefinition {
                environment,
                template_uri: None,
                vm_name_prefix: None,
                local: None,
                pool: None,
            },
            nodes: vec![
                sample_node("master-0", NodeRole::Master, "10.0.0.10"),
                sample_node("worker-0", NodeRole::Worker, "10.0.0.11"),
            ],
        };

        Arc::new(ClusterProxy::new(
            Arc::new(definition),
            SshCredentials::new("ubuntu"),
            Arc::new(MemoryShell::new()),
            Arc::new(StaticProbe::new(Vec::<String>::new())),
        ))
    }

    #[test]
    fn test_default_registry_creates_machine_manager() {
        let registry = HostingRegistry::default();
        assert!(registry.contains(HostingEnvironment::Local));
        assert!(registry.contains(HostingEnvironment::Pool));

        let context = HostingContext::new(std::env::temp_dir());
        let manager = registry.create(cluster(HostingEnvironment::Machine), &context).unwrap();

        assert_eq!(manager.environment(), HostingEnvironment::Machine);
        assert!(manager.is_provision_nop());
        assert!(!manager.requires_admin_privileges());
        assert_eq!(manager.drive_prefix(), "sd");
        assert_eq!(manager.max_parallel(), 2);
        assert_eq!(
            manager.ssh_endpoint("worker-0").unwrap(),
            ("10.0.0.11".parse().unwrap(), 22)
        );
        assert!(manager.ssh_endpoint("missing").is_err());
    }

    #[tokio::test]
    async fn test_machine_provision_is_nop() {
        let registry = HostingRegistry::default();
        let context = HostingContext::new(std::env::temp_dir());
        let manager = registry.create(cluster(HostingEnvironment::Machine), &context).unwrap();

        assert!(manager.provision(true).await.unwrap());
    }

    #[test]
    fn test_unregistered_environment() {
        let registry = HostingRegistry::new();
        let context = HostingContext::new(std::env::temp_dir());

        let result = registry.create(cluster(HostingEnvironment::Local), &context);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_pool_manager_requires_pool_options() {
        let registry = HostingRegistry::default();
        let context = HostingContext::new(std::env::temp_dir());

        let result = registry.create(cluster(HostingEnvironment::Pool), &context);
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
