//! Routing config builder: aggregates every instance's vhosts and port
//! forwards into the reverse-proxy/load-balancer document the external
//! proxy consumes.
//!
//! Built as stable `Serialize`/`Deserialize` structs rather than a raw
//! `serde_json::Value` tree, so a malformed instance can be skipped without
//! losing type safety on the rest of the document.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use cloud_core::config::EngineConfig;
use cloud_core::error::EngineResult;
use cloud_engine::allocator;
use cloud_engine::domain::{validate_domain, DnsResolver};
use cloud_transport::rest::ClusterApi;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One `[http] router+service` pair for a valid vhost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRouter {
    pub entrypoints: Vec<String>,
    pub rule: String,
    pub service: String,
    pub cert_resolver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpService {
    pub upstream_url: String,
}

/// One `[tcp]`/`[udp]` router+service pair for a port-forward entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L4Router {
    pub entrypoint: String,
    /// `HostSNI(`*`)` for tcp; absent for udp (traefik's udp routers carry
    /// no `rule` field).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L4Service {
    pub upstream_address: String,
}

/// The full routing document. Sections are omitted entirely when
/// empty — the consuming reverse proxy rejects empty config keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<L4Section<L4Router>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<L4Section<L4Router>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    pub routers: BTreeMap<String, HttpRouter>,
    pub services: BTreeMap<String, HttpService>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct L4Section<R> {
    pub routers: BTreeMap<String, R>,
    pub services: BTreeMap<String, L4Service>,
}

fn dashed(s: &str) -> String {
    s.replace('.', "-")
}

/// Build the routing document from a fresh cluster-wide read. Reads with
/// `ignore_errors = true`: malformed instances are omitted, never abort the
/// whole build.
pub async fn build_routing_config(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    resolver: &dyn DnsResolver,
    today: NaiveDate,
    web_entrypoints: &[String],
) -> EngineResult<RoutingConfig> {
    let instances = cloud_engine::read::read_instances(cluster, config, today, true).await?;

    let mut http = HttpSection::default();
    for instance in &instances {
        let fqdn_prefix = dashed(&instance.fqdn);
        for (vhost, opts) in &instance.metadata.network.vhosts {
            let (valid, remarks) = validate_domain(config, instance, vhost, resolver).await;
            if !valid {
                warn!(fqdn = %instance.fqdn, vhost, ?remarks, "vhost is not valid, omitting from routing config");
                continue;
            }

            let key = format!("{fqdn_prefix}-{}", dashed(vhost));
            let cert_resolver = if vhost.ends_with(&format!(".{}", config.service_base_domain)) {
                config.cert_resolver_service.clone()
            } else {
                config.cert_resolver_user.clone()
            };

            http.routers.insert(
                key.clone(),
                HttpRouter {
                    entrypoints: web_entrypoints.to_vec(),
                    rule: format!("Host(`{vhost}`)"),
                    service: key.clone(),
                    cert_resolver,
                },
            );

            let scheme = if opts.https { "https" } else { "http" };
            http.services.insert(
                key,
                HttpService {
                    upstream_url: format!("{scheme}://{}:{}", instance.metadata.network.nic_allocation.primary_ip(), opts.port),
                },
            );
        }
    }

    let ports = allocator::port_map(cluster, config, today).await?;
    let mut tcp = L4Section::<L4Router>::default();
    let mut udp = L4Section::<L4Router>::default();
    for (&external, (fqdn, ip, internal)) in &ports {
        let fqdn_prefix = dashed(fqdn);

        let tcp_key = format!("{fqdn_prefix}-{external}-tcp");
        tcp.routers.insert(
            tcp_key.clone(),
            L4Router {
                entrypoint: format!("netsoc-cloud-{external}-tcp"),
                rule: Some("HostSNI(`*`)".to_string()),
                service: tcp_key.clone(),
            },
        );
        tcp.services.insert(tcp_key, L4Service { upstream_address: format!("{ip}:{internal}") });

        let udp_key = format!("{fqdn_prefix}-{external}-udp");
        udp.routers.insert(
            udp_key.clone(),
            L4Router { entrypoint: format!("netsoc-cloud-{external}-udp"), rule: None, service: udp_key.clone() },
        );
        udp.services.insert(udp_key, L4Service { upstream_address: format!("{ip}:{internal}") });
    }

    Ok(RoutingConfig {
        http: (!http.routers.is_empty()).then_some(http),
        tcp: (!tcp.routers.is_empty()).then_some(tcp),
        udp: (!udp.routers.is_empty()).then_some(udp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use cloud_core::config::tests_support::sample_config;
    use cloud_core::model::*;
    use cloud_engine::domain::mock::StaticDnsResolver;
    use cloud_transport::mock::MockCluster;
    use std::collections::{BTreeMap, BTreeSet};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
    }

    fn metadata_with(vhosts: BTreeMap<String, VhostOpts>, ports: BTreeMap<u16, u16>) -> Metadata {
        Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: today() },
            network: NetworkMetadata {
                nic_allocation: NicAllocation {
                    addresses: vec![IpAllocation { ip: "10.68.0.3".parse().unwrap(), prefix: 16 }],
                    gateway4: "10.68.0.1".parse().unwrap(),
                    mac: "02:00:00:aa:bb:cc".into(),
                    vlan: 68,
                },
                vhosts,
                ports,
            },
            root_user: RootUser { password_hash: "$6$x".into(), ssh_public_key: "ssh-ed25519 AAA".into() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        }
    }

    async fn seed_container(cluster: &MockCluster, fqdn: &str, metadata: &Metadata) {
        use cloud_core::metadata_codec;
        use std::collections::HashMap;
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "1234".to_string());
        fields.insert("hostname".to_string(), fqdn.to_string());
        fields.insert("description".to_string(), metadata_codec::encode(metadata));
        fields.insert("cores".to_string(), "1".to_string());
        fields.insert("memory".to_string(), "512".to_string());
        fields.insert("rootfs".to_string(), "local:100/vm-100-disk-0,size=8G".to_string());
        cluster.create_lxc("leela", fields).await.unwrap();
    }

    #[tokio::test]
    async fn emits_http_and_tcp_udp_sections_for_one_instance() {
        let cluster = MockCluster::new().with_node("leela", 16_000_000_000, 1_000_000_000, 8);
        let mut vhosts = BTreeMap::new();
        vhosts.insert("a.svc.cloud.example".to_string(), VhostOpts { port: 80, https: false });
        let mut ports = BTreeMap::new();
        ports.insert(20000u16, 22u16);
        let metadata = metadata_with(vhosts, ports);
        seed_container(&cluster, "web.ocanty.container.cloud.example", &metadata).await;

        let config = sample_config();
        let resolver = StaticDnsResolver::new();
        let doc = build_routing_config(&cluster, &config, &resolver, today(), &["web".to_string()])
            .await
            .unwrap();

        let http = doc.http.expect("http section present");
        assert_eq!(http.routers.len(), 1);
        let (key, router) = http.routers.iter().next().unwrap();
        assert!(key.starts_with("web-ocanty-container-cloud-example-"));
        assert_eq!(router.rule, "Host(`a.svc.cloud.example`)");
        assert_eq!(router.cert_resolver, config.cert_resolver_service);
        let service = &http.services[key];
        assert_eq!(service.upstream_url, "http://10.68.0.3:80");

        let tcp = doc.tcp.expect("tcp section present");
        assert_eq!(tcp.routers.len(), 1);
        let (tcp_key, tcp_router) = tcp.routers.iter().next().unwrap();
        assert_eq!(tcp_router.entrypoint, "netsoc-cloud-20000-tcp");
        assert_eq!(tcp_router.rule.as_deref(), Some("HostSNI(`*`)"));
        assert_eq!(tcp.services[tcp_key].upstream_address, "10.68.0.3:22");

        let udp = doc.udp.expect("udp section present");
        assert_eq!(udp.routers.len(), 1);
        let (_udp_key, udp_router) = udp.routers.iter().next().unwrap();
        assert!(udp_router.rule.is_none());
    }

    #[tokio::test]
    async fn empty_cluster_omits_all_sections() {
        let cluster = MockCluster::new().with_node("leela", 16_000_000_000, 1_000_000_000, 8);
        let config = sample_config();
        let resolver = StaticDnsResolver::new();
        let doc = build_routing_config(&cluster, &config, &resolver, today(), &["web".to_string()])
            .await
            .unwrap();
        assert!(doc.http.is_none());
        assert!(doc.tcp.is_none());
        assert!(doc.udp.is_none());
    }

    #[tokio::test]
    async fn invalid_vhost_is_omitted_not_errored() {
        let cluster = MockCluster::new().with_node("leela", 16_000_000_000, 1_000_000_000, 8);
        let mut vhosts = BTreeMap::new();
        // Two labels deep under the service base domain: invalid per the domain validator.
        vhosts.insert("a.b.svc.cloud.example".to_string(), VhostOpts { port: 80, https: false });
        let metadata = metadata_with(vhosts, BTreeMap::new());
        seed_container(&cluster, "web.ocanty.container.cloud.example", &metadata).await;

        let config = sample_config();
        let resolver = StaticDnsResolver::new();
        let doc = build_routing_config(&cluster, &config, &resolver, today(), &["web".to_string()])
            .await
            .unwrap();
        assert!(doc.http.is_none());
    }
}
