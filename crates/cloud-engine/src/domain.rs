//! Domain validator: service subdomains and custom (BYO) domains for
//! vhosts.
//!
//! DNS resolution is abstracted behind [`DnsResolver`] the same way the
//! cluster transport abstracts the hypervisor API, so this component can be
//! exercised against a canned fixture instead of a live resolver.

use std::net::IpAddr;

use cloud_core::config::EngineConfig;
use cloud_core::model::Instance;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

/// A/AAAA and TXT lookups, abstracted so the validator can run against a
/// static fixture in tests.
#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_a_aaaa(&self, name: &str) -> anyhow::Result<Vec<IpAddr>>;
    async fn lookup_txt(&self, name: &str) -> anyhow::Result<Vec<String>>;
}

/// Resolves against the system-configured recursive resolver via
/// `hickory-resolver`.
pub struct HickoryDnsResolver {
    inner: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    pub fn new() -> Self {
        Self { inner: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()) }
    }
}

impl Default for HickoryDnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DnsResolver for HickoryDnsResolver {
    async fn lookup_a_aaaa(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
        let lookup = self.inner.lookup_ip(name).await?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_txt(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let lookup = self.inner.txt_lookup(name).await?;
        Ok(lookup.iter().map(|txt| txt.to_string()).collect())
    }
}

/// Validate `domain` as a vhost for `instance`. Returns `(valid, remarks)`;
/// a domain is valid iff no remark was produced.
pub async fn validate_domain(
    config: &EngineConfig,
    instance: &Instance,
    domain: &str,
    resolver: &dyn DnsResolver,
) -> (bool, Vec<String>) {
    let mut remarks = Vec::new();

    if let Some(label) = domain.strip_suffix(&format!(".{}", config.service_base_domain)) {
        if label.is_empty() || label.contains('.') {
            remarks.push(format!(
                "{domain}: service-subdomain vhosts must be a single label under {}",
                config.service_base_domain
            ));
        } else if config.service_subdomain_blacklist.contains(label) {
            remarks.push(format!("{domain}: subdomain '{label}' is blacklisted"));
        }
        return (remarks.is_empty(), remarks);
    }

    match resolver.lookup_a_aaaa(domain).await {
        Ok(addrs) if addrs.is_empty() => {
            remarks.push(format!("{domain}: no A/AAAA records found"));
        }
        Ok(addrs) => {
            for ip in addrs {
                if !config.user_domain_allowed_addrs.contains(&ip.to_string()) {
                    remarks.push(format!("{domain}: address {ip} is not in the allow-list"));
                }
            }
        }
        Err(e) => remarks.push(format!("{domain}: A/AAAA lookup failed: {e}")),
    }

    let base = registrable_base(domain);
    let txt_name = format!("{}.{}", config.user_domain_verification_label, base);
    match resolver.lookup_txt(&txt_name).await {
        Ok(values) => {
            let found = values.iter().any(|v| v.contains(&instance.metadata.owner));
            if !found {
                remarks.push(format!(
                    "{domain}: no TXT record at {txt_name} naming owner '{}'",
                    instance.metadata.owner
                ));
            }
        }
        Err(e) => remarks.push(format!("{domain}: TXT lookup at {txt_name} failed: {e}")),
    }

    (remarks.is_empty(), remarks)
}

/// The last two labels of `domain` (the registrable base the verification
/// TXT record is expected at), e.g. `a.b.blog.example.net` -> `example.net`.
fn registrable_base(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        domain.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// In-memory [`DnsResolver`] fixture. Exposed to unit tests in this crate
/// and to integration tests / downstream dev-dependents via the
/// `test-util` feature.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct StaticDnsResolver {
        a_aaaa: Mutex<HashMap<String, Vec<IpAddr>>>,
        txt: Mutex<HashMap<String, Vec<String>>>,
        fail: Mutex<Vec<String>>,
    }

    impl StaticDnsResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_a_aaaa(self, name: &str, addrs: Vec<IpAddr>) -> Self {
            self.a_aaaa.lock().unwrap().insert(name.to_string(), addrs);
            self
        }

        pub fn with_txt(self, name: &str, values: Vec<String>) -> Self {
            self.txt.lock().unwrap().insert(name.to_string(), values);
            self
        }

        pub fn with_lookup_failure(self, name: &str) -> Self {
            self.fail.lock().unwrap().push(name.to_string());
            self
        }
    }

    #[async_trait::async_trait]
    impl DnsResolver for StaticDnsResolver {
        async fn lookup_a_aaaa(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
            if self.fail.lock().unwrap().contains(&name.to_string()) {
                anyhow::bail!("NXDOMAIN");
            }
            Ok(self.a_aaaa.lock().unwrap().get(name).cloned().unwrap_or_default())
        }

        async fn lookup_txt(&self, name: &str) -> anyhow::Result<Vec<String>> {
            if self.fail.lock().unwrap().contains(&name.to_string()) {
                anyhow::bail!("NXDOMAIN");
            }
            match self.txt.lock().unwrap().get(name).cloned() {
                Some(v) => Ok(v),
                None => anyhow::bail!("NXDOMAIN"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::StaticDnsResolver;
    use super::*;
    use chrono::NaiveDate;
    use cloud_core::config::tests_support::sample_config;
    use cloud_core::model::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn instance() -> Instance {
        Instance {
            kind: InstanceKind::Container,
            id: 100,
            fqdn: "web.ocanty.container.cloud.example".into(),
            hostname: "web".into(),
            node: "leela".into(),
            metadata: Metadata {
                owner: "ocanty".into(),
                groups: BTreeSet::new(),
                request_detail: String::new(),
                inactivity: Inactivity { marked_active_at: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() },
                network: NetworkMetadata {
                    nic_allocation: NicAllocation {
                        addresses: vec![IpAllocation { ip: "10.68.0.3".parse().unwrap(), prefix: 16 }],
                        gateway4: "10.68.0.1".parse().unwrap(),
                        mac: "02:00:00:aa:bb:cc".into(),
                        vlan: 68,
                    },
                    vhosts: BTreeMap::new(),
                    ports: BTreeMap::new(),
                },
                root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
                wake_on_request: false,
                permanent: false,
                tos: Tos::default(),
            },
            specs: Specs { cores: 1, memory_mb: 512, swap_mb: 512, disk_space_gb: 8 },
            status: InstanceStatus::Stopped,
            active: true,
            inactivity_shutdown_date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            inactivity_deletion_date: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            remarks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn service_subdomain_single_label_is_valid() {
        let config = sample_config();
        let resolver = StaticDnsResolver::new();
        let (valid, remarks) =
            validate_domain(&config, &instance(), "web-ocanty-container.svc.cloud.example", &resolver).await;
        assert!(valid, "remarks: {remarks:?}");
    }

    #[tokio::test]
    async fn service_subdomain_nested_label_is_invalid() {
        let config = sample_config();
        let resolver = StaticDnsResolver::new();
        let (valid, _) =
            validate_domain(&config, &instance(), "a.b.svc.cloud.example", &resolver).await;
        assert!(!valid);
    }

    #[tokio::test]
    async fn service_subdomain_blacklisted_label_is_invalid() {
        let mut config = sample_config();
        config.service_subdomain_blacklist.insert("admin".to_string());
        let resolver = StaticDnsResolver::new();
        let (valid, _) = validate_domain(&config, &instance(), "admin.svc.cloud.example", &resolver).await;
        assert!(!valid);
    }

    #[tokio::test]
    async fn custom_domain_missing_txt_is_invalid_with_remark() {
        let mut config = sample_config();
        config.user_domain_allowed_addrs.insert("203.0.113.10".to_string());
        let resolver = StaticDnsResolver::new()
            .with_a_aaaa("blog.example.net", vec!["203.0.113.10".parse().unwrap()])
            .with_lookup_failure("_netsoc.example.net");
        let (valid, remarks) = validate_domain(&config, &instance(), "blog.example.net", &resolver).await;
        assert!(!valid);
        assert!(remarks.iter().any(|r| r.contains("_netsoc.example.net")));
    }

    #[tokio::test]
    async fn custom_domain_with_valid_a_and_txt_is_valid() {
        let mut config = sample_config();
        config.user_domain_allowed_addrs.insert("203.0.113.10".to_string());
        let resolver = StaticDnsResolver::new()
            .with_a_aaaa("blog.example.net", vec!["203.0.113.10".parse().unwrap()])
            .with_txt("_netsoc.example.net", vec!["netsoc-owner=ocanty".to_string()]);
        let (valid, remarks) = validate_domain(&config, &instance(), "blog.example.net", &resolver).await;
        assert!(valid, "remarks: {remarks:?}");
    }

    #[tokio::test]
    async fn custom_domain_with_disallowed_address_is_invalid() {
        let mut config = sample_config();
        config.user_domain_allowed_addrs.insert("203.0.113.10".to_string());
        let resolver = StaticDnsResolver::new()
            .with_a_aaaa("blog.example.net", vec!["198.51.100.1".parse().unwrap()])
            .with_txt("_netsoc.example.net", vec!["netsoc-owner=ocanty".to_string()]);
        let (valid, remarks) = validate_domain(&config, &instance(), "blog.example.net", &resolver).await;
        assert!(!valid);
        assert!(remarks.iter().any(|r| r.contains("allow-list")));
    }

    #[test]
    fn registrable_base_takes_last_two_labels() {
        assert_eq!(registrable_base("blog.example.net"), "example.net");
        assert_eq!(registrable_base("a.b.blog.example.net"), "example.net");
        assert_eq!(registrable_base("example.net"), "example.net");
    }
}
