//! The engine's wiring: one [`Engine`] struct aggregating the hypervisor
//! transport, a per-node shell factory, a DNS resolver, the image
//! catalogue, and configuration — the object every admin-facing operation
//! is a method on.

use std::sync::Arc;

use chrono::NaiveDate;
use cloud_core::catalogue::ImageCatalogue;
use cloud_core::config::EngineConfig;
use cloud_core::error::EngineResult;
use cloud_core::model::{Instance, InstanceKind};
use cloud_core::naming::build_fqdn;
use cloud_transport::node_shell::NodeShell;
use cloud_transport::rest::ClusterApi;

use crate::domain::{DnsResolver, HickoryDnsResolver};
use crate::read;

/// Acquires a [`NodeShell`] scoped to one named cluster node. Abstracted so
/// `Engine` can run against the real bastion-jump SSH path or a single
/// shared mock shell in tests.
#[async_trait::async_trait]
pub trait NodeShellFactory: Send + Sync {
    async fn acquire(&self, node: &str) -> anyhow::Result<Arc<dyn NodeShell>>;
}

/// Real factory: one SSH/SFTP session per acquisition, via the bastion jump
/// host configured in [`EngineConfig::bastion`].
pub struct SshNodeShellFactory {
    bastion: cloud_core::config::BastionConfig,
}

impl SshNodeShellFactory {
    pub fn new(bastion: cloud_core::config::BastionConfig) -> Self {
        Self { bastion }
    }
}

#[async_trait::async_trait]
impl NodeShellFactory for SshNodeShellFactory {
    async fn acquire(&self, node: &str) -> anyhow::Result<Arc<dyn NodeShell>> {
        let shell = cloud_transport::node_shell::SshNodeShell::acquire(node, &self.bastion).await?;
        Ok(Arc::new(shell))
    }
}

/// The instance lifecycle manager and its collaborators.
pub struct Engine {
    pub config: EngineConfig,
    pub catalogue: ImageCatalogue,
    pub cluster: Arc<dyn ClusterApi>,
    pub shells: Arc<dyn NodeShellFactory>,
    pub dns: Arc<dyn DnsResolver>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalogue: ImageCatalogue,
        cluster: Arc<dyn ClusterApi>,
        shells: Arc<dyn NodeShellFactory>,
    ) -> Self {
        Self { config, catalogue, cluster, shells, dns: Arc::new(HickoryDnsResolver::new()) }
    }

    pub fn with_dns_resolver(mut self, dns: Arc<dyn DnsResolver>) -> Self {
        self.dns = dns;
        self
    }

    /// Read every instance on the cluster.
    pub async fn read_instances(&self, today: NaiveDate, ignore_errors: bool) -> EngineResult<Vec<Instance>> {
        read::read_instances(self.cluster.as_ref(), &self.config, today, ignore_errors).await
    }

    /// Read one instance by its fqdn.
    pub async fn read_instance_by_fqdn(&self, today: NaiveDate, fqdn: &str) -> EngineResult<Option<Instance>> {
        read::read_instance_by_fqdn(self.cluster.as_ref(), &self.config, today, fqdn).await
    }

    /// Read one instance by `(owner, kind, hostname)` — the collision check
    /// Create performs before provisioning.
    pub async fn read_instance_by_account(
        &self,
        today: NaiveDate,
        kind: InstanceKind,
        owner: &str,
        hostname: &str,
    ) -> EngineResult<Option<Instance>> {
        let fqdn = build_fqdn(&self.config, kind, owner, hostname);
        self.read_instance_by_fqdn(today, &fqdn).await
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use cloud_transport::mock::MockNodeShell;

    /// A [`NodeShellFactory`] that hands out clones of a single shared
    /// [`MockNodeShell`] regardless of the requested node name.
    pub struct MockNodeShellFactory(pub MockNodeShell);

    #[async_trait::async_trait]
    impl NodeShellFactory for MockNodeShellFactory {
        async fn acquire(&self, _node: &str) -> anyhow::Result<Arc<dyn NodeShell>> {
            Ok(Arc::new(self.0.clone()))
        }
    }
}
