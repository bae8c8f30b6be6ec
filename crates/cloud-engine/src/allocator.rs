//! Resource allocator: cluster-wide IP/MAC and external-port allocation,
//! plus the domain-availability scan used by vhost mutation.
//!
//! There is no coordinator: every allocation is computed against a fresh
//! cluster-wide read and conflicts are left for the next reader to surface
//! as remarks.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::NaiveDate;
use cloud_core::config::EngineConfig;
use cloud_core::error::{EngineError, EngineResult};
use cloud_core::model::{InstanceKind, NicAllocation};
use cloud_core::naming;
use cloud_transport::rest::ClusterApi;
use ipnet::IpNet;
use rand::Rng;
use tracing::warn;

use crate::domain::{validate_domain, DnsResolver};
use crate::read::read_instances;

/// Pick a free address from the kind's configured network, excluding the
/// gateway and every address already held by a live instance, and pair it
/// with a freshly generated locally-administered MAC.
pub async fn allocate_nic(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    kind: InstanceKind,
    today: NaiveDate,
) -> EngineResult<NicAllocation> {
    let net_cfg = config.network_for(kind);
    let instances = read_instances(cluster, config, today, true).await?;

    let mut used: std::collections::BTreeSet<Ipv4Addr> = std::collections::BTreeSet::new();
    used.insert(net_cfg.gateway);
    for instance in &instances {
        for address in &instance.metadata.network.nic_allocation.addresses {
            used.insert(address.ip);
        }
    }

    let candidate = net_cfg
        .network
        .hosts()
        .filter(|ip| net_cfg.allowed_range.contains(*ip))
        .find(|ip| !used.contains(ip))
        .ok_or_else(|| EngineError::ResourceUnavailable(format!("IP pool for {kind:?} is exhausted")))?;

    Ok(NicAllocation {
        addresses: vec![cloud_core::model::IpAllocation { ip: candidate, prefix: net_cfg.network.prefix_len() }],
        gateway4: net_cfg.gateway,
        mac: naming::random_mac(),
        vlan: net_cfg.vlan,
    })
}

/// `external_port -> (owning fqdn, primary ip, internal port)`, folded over
/// every instance's port-forward map. First writer wins a given external
/// port; later conflicts and out-of-range entries are dropped from the map
/// (but never from the owning instance's metadata) and logged.
pub async fn port_map(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    today: NaiveDate,
) -> EngineResult<BTreeMap<u16, (String, Ipv4Addr, u16)>> {
    let instances = read_instances(cluster, config, today, true).await?;
    let (lo, hi) = config.external_port_range;

    let mut map = BTreeMap::new();
    for instance in &instances {
        let primary_ip = instance.metadata.network.nic_allocation.primary_ip();
        for (&external, &internal) in &instance.metadata.network.ports {
            if !(lo..=hi).contains(&external) {
                warn!(fqdn = %instance.fqdn, external, "external port out of configured range, dropping from map");
                continue;
            }
            if map.contains_key(&external) {
                warn!(fqdn = %instance.fqdn, external, "external port conflict, dropping from map");
                continue;
            }
            map.insert(external, (instance.fqdn.clone(), primary_ip, internal));
        }
    }
    Ok(map)
}

/// A uniformly-random external port from the configured range not already
/// present in the current port map.
pub async fn allocate_external(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    today: NaiveDate,
) -> EngineResult<u16> {
    let map = port_map(cluster, config, today).await?;
    let (lo, hi) = config.external_port_range;
    let free: Vec<u16> = (lo..=hi).filter(|p| !map.contains_key(p)).collect();
    if free.is_empty() {
        return Err(EngineError::ResourceUnavailable("external port range is exhausted".to_string()));
    }
    let idx = rand::thread_rng().gen_range(0..free.len());
    Ok(free[idx])
}

/// `domain` is available iff no *valid* vhost on any instance already
/// claims it.
pub async fn is_domain_available(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    today: NaiveDate,
    resolver: &dyn DnsResolver,
    domain: &str,
) -> EngineResult<bool> {
    let instances = read_instances(cluster, config, today, true).await?;
    for instance in &instances {
        for vhost in instance.metadata.network.vhosts.keys() {
            if vhost != domain {
                continue;
            }
            let (valid, _remarks) = validate_domain(config, instance, vhost, resolver).await;
            if valid {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
