//! The data model: instances, images, metadata, and the
//! network/inactivity/root-user shapes nested inside metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Container,
    Vm,
}

impl InstanceKind {
    pub fn required_disk_format(self) -> DiskFormat {
        match self {
            InstanceKind::Container => DiskFormat::TarGz,
            InstanceKind::Vm => DiskFormat::Qcow2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormat {
    TarGz,
    Qcow2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specs {
    pub cores: u32,
    pub memory_mb: u64,
    pub swap_mb: u64,
    pub disk_space_gb: u64,
}

/// A read-only catalogue entry. No I/O — process config only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub disk_file: String,
    pub disk_format: DiskFormat,
    #[serde(default)]
    pub disk_sha256: Option<String>,
    #[serde(default)]
    pub fallback_url: Option<String>,
    pub specs: Specs,
    #[serde(default)]
    pub wake_on_request: bool,
}

impl Image {
    /// Enforce the Container ⇒ tar_gz / VM ⇒ qcow2 invariant.
    pub fn matches_kind(&self, kind: InstanceKind) -> bool {
        self.disk_format == kind.required_disk_format()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllocation {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

/// NIC allocation. `addresses` is non-empty by construction; index 0 is
/// the instance's primary address for routing/upstream purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicAllocation {
    pub addresses: Vec<IpAllocation>,
    pub gateway4: Ipv4Addr,
    pub mac: String,
    pub vlan: u16,
}

impl NicAllocation {
    pub fn primary_ip(&self) -> Ipv4Addr {
        self.addresses[0].ip
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhostOpts {
    pub port: u16,
    pub https: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMetadata {
    pub nic_allocation: NicAllocation,
    #[serde(default)]
    pub vhosts: BTreeMap<String, VhostOpts>,
    /// external_port -> internal_port
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Inactivity {
    pub marked_active_at: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootUser {
    pub password_hash: String,
    pub ssh_public_key: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Tos {
    #[serde(default)]
    pub suspended: bool,
}

/// The value stored (encoded) in the hypervisor's free-form description
/// field. Every field must tolerate being read back after a partially
/// applied write, since there is no database transaction backing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub owner: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub request_detail: String,
    pub inactivity: Inactivity,
    pub network: NetworkMetadata,
    pub root_user: RootUser,
    #[serde(default)]
    pub wake_on_request: bool,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default)]
    pub tos: Tos,
}

/// The in-memory projection returned by reads. Distinct from `Metadata`:
/// it carries cluster-assigned identity (`id`, `node`, `status`) and derived
/// fields (`active`, the two inactivity dates, `remarks`) that are never
/// themselves persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub kind: InstanceKind,
    pub id: u64,
    pub fqdn: String,
    pub hostname: String,
    pub node: String,
    pub metadata: Metadata,
    pub specs: Specs,
    pub status: InstanceStatus,
    pub active: bool,
    pub inactivity_shutdown_date: NaiveDate,
    pub inactivity_deletion_date: NaiveDate,
    #[serde(default)]
    pub remarks: Vec<String>,
}
