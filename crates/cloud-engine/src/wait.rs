//! Wait primitives: thin, named wrappers around
//! [`cloud_core::retry::wait_until`] so call sites read as intent rather
//! than inline polling loops.

use std::time::Duration;

use cloud_core::error::EngineResult;
use cloud_transport::rest::{ClusterApi, ResourceTree};

/// Poll an object's config until it carries no `lock` key.
pub async fn wait_lock_released(
    cluster: &dyn ClusterApi,
    node: &str,
    tree: ResourceTree,
    vmid: u64,
    timeout: Duration,
    poll_interval: Duration,
) -> EngineResult<()> {
    cloud_core::retry::wait_until("lock release", timeout, poll_interval, || async {
        let config = cluster.get_config(node, tree, vmid).await?;
        Ok(if config.contains_key("lock") { None } else { Some(()) })
    })
    .await
}

/// Poll cluster resources until an object named `fqdn` exists on `node`
/// with a lock-free config.
pub async fn wait_created(
    cluster: &dyn ClusterApi,
    node: &str,
    tree: ResourceTree,
    vmid: u64,
    fqdn: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> EngineResult<()> {
    cloud_core::retry::wait_until("instance created", timeout, poll_interval, || async {
        let resources = cluster.list_cluster_resources().await?;
        let found = resources.iter().any(|r| r.vmid == vmid && r.name.as_deref() == Some(fqdn));
        if !found {
            return Ok(None);
        }
        let config = cluster.get_config(node, tree, vmid).await?;
        Ok(if config.contains_key("lock") { None } else { Some(()) })
    })
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredStatus {
    Running,
    Stopped,
}

/// Poll status/current until it reports the desired state.
pub async fn wait_status(
    cluster: &dyn ClusterApi,
    node: &str,
    tree: ResourceTree,
    vmid: u64,
    desired: DesiredStatus,
    timeout: Duration,
    poll_interval: Duration,
) -> EngineResult<()> {
    cloud_core::retry::wait_until("instance status", timeout, poll_interval, || async {
        let status = cluster.status_current(node, tree, vmid).await?;
        let running = status.get("status").map(|s| s.as_str()) == Some("running");
        let reached = match desired {
            DesiredStatus::Running => running,
            DesiredStatus::Stopped => !running,
        };
        Ok(if reached { Some(()) } else { None })
    })
    .await
}

/// Poll the QEMU guest agent until it responds to a ping.
pub async fn wait_guest_agent_ping(
    cluster: &dyn ClusterApi,
    node: &str,
    vmid: u64,
    timeout: Duration,
    poll_interval: Duration,
) -> EngineResult<()> {
    cloud_core::retry::wait_until("guest agent ping", timeout, poll_interval, || async {
        let ok = cluster.agent_ping(node, vmid).await?;
        Ok(if ok { Some(()) } else { None })
    })
    .await
}
