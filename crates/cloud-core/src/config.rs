//! The engine's configuration surface, loaded from TOML by the embedding
//! application.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::model::InstanceKind;

fn default_mtu() -> u32 {
    1450
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_lock_wait_secs() -> u64 {
    25
}

fn default_status_wait_secs() -> u64 {
    25
}

fn default_guest_agent_wait_secs() -> u64 {
    25
}

fn default_creation_wait_secs() -> u64 {
    120
}

/// Per-kind inactivity thresholds, in days.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InactivityPolicy {
    pub shutdown_after_days: i64,
    pub deletion_after_days: i64,
}

/// Network configuration for one instance kind. Each kind (Container, VM)
/// typically sits on its own VLAN/subnet in the original deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindNetworkConfig {
    pub network: Ipv4Net,
    pub allowed_range: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub vlan: u16,
    pub bridge: String,
    pub base_fqdn: String,
    pub inactivity: InactivityPolicy,
}

/// Hypervisor REST connection details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRestConfig {
    pub base_url: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub token_value: Option<String>,
}

/// SSH bastion-jump configuration for the per-node scoped shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BastionConfig {
    pub bastion_host: String,
    pub bastion_user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cluster_base_domain: String,
    pub service_base_domain: String,
    #[serde(default)]
    pub service_subdomain_blacklist: BTreeSet<String>,

    /// User-domain allow-list of A/AAAA values the custom-domain path accepts.
    #[serde(default)]
    pub user_domain_allowed_addrs: BTreeSet<String>,
    pub user_domain_verification_label: String,

    pub cert_resolver_service: String,
    pub cert_resolver_user: String,

    pub external_port_range: (u16, u16),

    #[serde(default)]
    pub node_blacklist: BTreeSet<String>,

    pub pool_images: String,
    pub pool_instances: String,
    pub pool_snippets: String,

    #[serde(default = "default_mtu")]
    pub mtu: u32,

    pub networks: HashMap<InstanceKind, KindNetworkConfig>,

    pub rest: ClusterRestConfig,
    pub bastion: BastionConfig,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_status_wait_secs")]
    pub status_wait_secs: u64,
    #[serde(default = "default_guest_agent_wait_secs")]
    pub guest_agent_wait_secs: u64,
    #[serde(default = "default_creation_wait_secs")]
    pub creation_wait_secs: u64,
}

impl EngineConfig {
    pub fn kind_subdomain(&self, kind: InstanceKind) -> &'static str {
        match kind {
            InstanceKind::Container => "container",
            InstanceKind::Vm => "vm",
        }
    }

    pub fn network_for(&self, kind: InstanceKind) -> &KindNetworkConfig {
        self.networks
            .get(&kind)
            .unwrap_or_else(|| panic!("no network config for kind {kind:?}"))
    }

    pub fn inactivity_policy(&self, kind: InstanceKind) -> InactivityPolicy {
        self.network_for(kind).inactivity
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn status_wait(&self) -> Duration {
        Duration::from_secs(self.status_wait_secs)
    }

    pub fn guest_agent_wait(&self) -> Duration {
        Duration::from_secs(self.guest_agent_wait_secs)
    }

    pub fn creation_wait(&self) -> Duration {
        Duration::from_secs(self.creation_wait_secs)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tests_support::sample_config;

    #[test]
    fn defaults_round_trip_through_missing_fields() {
        let cfg = sample_config();
        let mut json = serde_json::to_value(&cfg).unwrap();
        json.as_object_mut().unwrap().remove("mtu");
        json.as_object_mut().unwrap().remove("poll_interval_secs");
        let reparsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(reparsed.mtu, 1450);
        assert_eq!(reparsed.poll_interval_secs, 1);
    }

    #[test]
    fn kind_subdomain_is_stable() {
        let cfg = sample_config();
        assert_eq!(cfg.kind_subdomain(InstanceKind::Container), "container");
        assert_eq!(cfg.kind_subdomain(InstanceKind::Vm), "vm");
    }
}
