//! Bulk and single-instance reads: list cluster resources, fetch each
//! object's config for its description field, and decode metadata
//! defensively back into [`Instance`] projections.

use chrono::NaiveDate;
use cloud_core::config::EngineConfig;
use cloud_core::error::{EngineError, EngineResult};
use cloud_core::model::{Instance, InstanceKind, InstanceStatus, Specs};
use cloud_core::{activity, metadata_codec, naming};
use cloud_transport::rest::{ClusterApi, ClusterResource, ConfigMap, ResourceTree, parse_config_string};
use tracing::warn;

fn kind_and_tree(resource_kind: &str) -> Option<(InstanceKind, ResourceTree)> {
    match resource_kind {
        "lxc" => Some((InstanceKind::Container, ResourceTree::Lxc)),
        "qemu" => Some((InstanceKind::Vm, ResourceTree::Qemu)),
        _ => None,
    }
}

fn parse_size_gb(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(num) = value.strip_suffix('G') {
        num.parse::<f64>().ok().map(|g| g.round() as u64)
    } else if let Some(num) = value.strip_suffix('T') {
        num.parse::<f64>().ok().map(|t| (t * 1024.0).round() as u64)
    } else if let Some(num) = value.strip_suffix('M') {
        num.parse::<f64>().ok().map(|m| (m / 1024.0).round() as u64)
    } else {
        value.parse::<f64>().ok().map(|b| b.round() as u64)
    }
}

fn specs_from_config(kind: InstanceKind, config: &ConfigMap) -> Specs {
    let cores = config.get("cores").and_then(|v| v.parse().ok()).unwrap_or(1);
    let memory_mb = config.get("memory").and_then(|v| v.parse().ok()).unwrap_or(0);
    let swap_mb = config.get("swap").and_then(|v| v.parse().ok()).unwrap_or(0);
    let disk_key = match kind {
        InstanceKind::Container => "rootfs",
        InstanceKind::Vm => "virtio0",
    };
    let disk_space_gb = config
        .get(disk_key)
        .map(|v| parse_config_string(v))
        .and_then(|m| m.get("size").cloned())
        .and_then(|s| parse_size_gb(&s))
        .unwrap_or(0);
    Specs { cores, memory_mb, swap_mb, disk_space_gb }
}

/// Decode one cluster resource into an [`Instance`], or `Ok(None)` if it is
/// not a resource kind this engine manages.
async fn decode_one(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    resource: &ClusterResource,
    today: NaiveDate,
) -> EngineResult<Option<Instance>> {
    let Some((kind, tree)) = kind_and_tree(&resource.kind) else {
        return Ok(None);
    };
    let fqdn = match &resource.name {
        Some(name) => name.clone(),
        None => return Ok(None),
    };

    let object_config = cluster
        .get_config(&resource.node, tree, resource.vmid)
        .await
        .map_err(|e| EngineError::resource_unavailable("could not read instance config", e))?;

    let description = object_config.get("description").cloned().unwrap_or_default();
    let metadata = metadata_codec::decode(&description)?;

    let hostname = naming::parse_hostname(config, kind, &metadata.owner, &fqdn).ok_or_else(|| {
        EngineError::MalformedMetadata(format!("fqdn '{fqdn}' does not match the expected grammar"))
    })?;

    let policy = config.inactivity_policy(kind);
    let status = match resource.status.as_deref() {
        Some("running") => InstanceStatus::Running,
        _ => InstanceStatus::Stopped,
    };

    Ok(Some(Instance {
        kind,
        id: resource.vmid,
        fqdn,
        hostname,
        node: resource.node.clone(),
        specs: specs_from_config(kind, &object_config),
        status,
        active: activity::is_active(&metadata, policy, today),
        inactivity_shutdown_date: activity::shutdown_date(&metadata, policy),
        inactivity_deletion_date: activity::deletion_date(&metadata, policy),
        remarks: Vec::new(),
        metadata,
    }))
}

/// Read every instance on the cluster. With `ignore_errors`, malformed or
/// unavailable objects are logged and omitted rather than aborting the
/// whole read.
pub async fn read_instances(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    today: NaiveDate,
    ignore_errors: bool,
) -> EngineResult<Vec<Instance>> {
    let resources = cluster
        .list_cluster_resources()
        .await
        .map_err(|e| EngineError::resource_unavailable("could not list cluster resources", e))?;

    let mut instances = Vec::with_capacity(resources.len());
    for resource in &resources {
        match decode_one(cluster, config, resource, today).await {
            Ok(Some(instance)) => instances.push(instance),
            Ok(None) => {}
            Err(e) if ignore_errors => {
                warn!(resource = %resource.id, error = %e, "omitting instance from bulk read");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(instances)
}

/// Read a single instance by its fully-qualified name. `Ok(None)` if no
/// object with that name exists on the cluster.
pub async fn read_instance_by_fqdn(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    today: NaiveDate,
    fqdn: &str,
) -> EngineResult<Option<Instance>> {
    let resources = cluster
        .list_cluster_resources()
        .await
        .map_err(|e| EngineError::resource_unavailable("could not list cluster resources", e))?;

    let Some(resource) = resources.iter().find(|r| r.name.as_deref() == Some(fqdn)) else {
        return Ok(None);
    };
    decode_one(cluster, config, resource, today).await
}
