//! FQDN grammar, candidate instance-id hashing, and MAC generation.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::model::InstanceKind;

/// Build `<hostname>.<username>.<kind_sub>.<cluster_base>`.
pub fn build_fqdn(cfg: &EngineConfig, kind: InstanceKind, owner: &str, hostname: &str) -> String {
    format!(
        "{hostname}.{owner}.{}.{}",
        cfg.kind_subdomain(kind),
        cfg.cluster_base_domain
    )
}

/// Strip the `.<username>.<kind_sub>.<cluster_base>` suffix from an FQDN,
/// returning the hostname, or `None` if the FQDN does not match the
/// grammar for the given owner/kind.
pub fn parse_hostname(cfg: &EngineConfig, kind: InstanceKind, owner: &str, fqdn: &str) -> Option<String> {
    let suffix = format!(".{owner}.{}.{}", cfg.kind_subdomain(kind), cfg.cluster_base_domain);
    fqdn.strip_suffix(&suffix).map(|h| h.to_string())
}

/// Default service-subdomain vhost label: `{hostname}-{username}-{kind}`.
pub fn default_vhost_label(kind: InstanceKind, owner: &str, hostname: &str, cfg: &EngineConfig) -> String {
    format!("{hostname}-{owner}-{}", cfg.kind_subdomain(kind))
}

/// Deterministic candidate instance id: a stable hash of the FQDN, mapped
/// into `[1000, 5_000_000]`. Advisory only — the cluster is
/// always re-read by name after creation.
pub fn candidate_instance_id(fqdn: &str) -> u64 {
    let digest = Sha256::digest(fqdn.as_bytes());
    let n = u64::from_be_bytes(digest[0..8].try_into().unwrap());
    1000 + (n % (5_000_000 - 1000))
}

/// Generate a fresh locally-administered MAC address, prefix `02:00:00`.
pub fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    let tail: [u8; 3] = rng.gen();
    format!("02:00:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

/// Validate a user-supplied hostname label: non-empty, lowercase
/// alphanumeric/hyphen, does not start or end with a hyphen.
pub fn validate_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 63 {
        return false;
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return false;
    }
    hostname
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
