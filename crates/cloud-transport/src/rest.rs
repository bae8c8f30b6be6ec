//! Typed client for the hypervisor REST API.
//!
//! Endpoints are addressed as paths under `/nodes/<n>/{lxc,qemu}/<id>/…`
//! with sub-resources `config`, `status/current`, `status/{start,stop,
//! shutdown}`, `firewall/options`, `firewall/ipset/…`, `agent/{ping,exec,
//! set-user-password,file-write}`, and cluster-wide `/cluster/resources`,
//! `/storage/<pool>`. TLS verification is disabled to match clusters that
//! run on a self-signed internal certificate.

use std::collections::HashMap;

use anyhow::{Context, Result};
use cloud_core::config::ClusterRestConfig;
use serde::Deserialize;
use serde_json::Value;

/// Either LXC (Container) or QEMU (VM) — the hypervisor's own vocabulary for
/// the two resource trees this client addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTree {
    Lxc,
    Qemu,
}

impl ResourceTree {
    fn path_segment(self) -> &'static str {
        match self {
            ResourceTree::Lxc => "lxc",
            ResourceTree::Qemu => "qemu",
        }
    }
}

/// One entry from `/cluster/resources?type=vm` — both containers and VMs
/// show up in this listing; `kind` distinguishes them.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub vmid: u64,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxcpu: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeResource {
    pub node: String,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxcpu: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A freeform `key=value,key2=value2` config blob, parsed into a map with
/// defensive defaults for missing keys.
pub type ConfigMap = HashMap<String, String>;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

/// Client for the hypervisor's REST API. Cheap to clone (wraps an
/// `Arc`-backed `reqwest::Client` internally).
#[derive(Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: (String, String),
}

impl ClusterClient {
    pub fn new(cfg: &ClusterRestConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .user_agent(concat!("netsoc-cloud/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build hypervisor HTTP client")?;

        let auth_header = if let (Some(name), Some(value)) = (&cfg.token_name, &cfg.token_value) {
            (
                "Authorization".to_string(),
                format!("PVEAPIToken={}!{}={}", cfg.username, name, value),
            )
        } else {
            let password = cfg
                .password
                .as_deref()
                .context("cluster REST config has neither a token nor a password")?;
            (
                "Authorization".to_string(),
                format!("PVEAPIBasic username={} password={}", cfg.username, password),
            )
        };

        Ok(Self { http, base_url: cfg.base_url.trim_end_matches('/').to_string(), auth_header })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header(self.auth_header.0.clone(), self.auth_header.1.clone())
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("GET {path}: HTTP {status}");
        }
        let parsed: ApiResponse<T> =
            resp.json().await.with_context(|| format!("GET {path}: invalid JSON"))?;
        Ok(parsed.data)
    }

    async fn put_form(&self, path: &str, form: &HashMap<String, String>) -> Result<()> {
        let resp = self
            .http
            .put(self.url(path))
            .header(self.auth_header.0.clone(), self.auth_header.1.clone())
            .form(form)
            .send()
            .await
            .with_context(|| format!("PUT {path} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("PUT {path}: HTTP {status}: {}", truncate(&body, 300));
        }
        Ok(())
    }

    async fn post_form(&self, path: &str, form: &HashMap<String, String>) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(path))
            .header(self.auth_header.0.clone(), self.auth_header.1.clone())
            .form(form)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("POST {path}: HTTP {status}: {}", truncate(&body, 300));
        }
        let parsed: ApiResponse<Value> =
            resp.json().await.with_context(|| format!("POST {path}: invalid JSON"))?;
        Ok(parsed.data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(path))
            .header(self.auth_header.0.clone(), self.auth_header.1.clone())
            .send()
            .await
            .with_context(|| format!("DELETE {path} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("DELETE {path}: HTTP {status}");
        }
        Ok(())
    }
}

/// The typed RPC surface over the hypervisor's REST API. `cloud-engine` is
/// written against this trait rather than `ClusterClient` directly so it
/// can run against [`crate::mock::MockCluster`] in tests.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_cluster_resources(&self) -> Result<Vec<ClusterResource>>;
    async fn list_nodes(&self) -> Result<Vec<NodeResource>>;
    async fn get_config(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<ConfigMap>;
    async fn set_config(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        fields: HashMap<String, String>,
    ) -> Result<()>;
    async fn status_current(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<ConfigMap>;
    async fn start(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()>;
    async fn stop(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()>;
    async fn shutdown(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()>;
    async fn create_lxc(&self, node: &str, fields: HashMap<String, String>) -> Result<()>;
    async fn create_qemu(&self, node: &str, fields: HashMap<String, String>) -> Result<()>;
    async fn delete_instance(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()>;
    async fn resize_disk(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        disk: &str,
        size: &str,
    ) -> Result<()>;
    async fn firewall_options(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        fields: HashMap<String, String>,
    ) -> Result<()>;
    async fn set_ipset(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        name: &str,
        addresses: &[String],
    ) -> Result<()>;
    async fn agent_ping(&self, node: &str, vmid: u64) -> Result<bool>;
    async fn agent_set_user_password(&self, node: &str, vmid: u64, username: &str, password_hash: &str) -> Result<()>;
    async fn agent_file_write(&self, node: &str, vmid: u64, path: &str, content: &str) -> Result<()>;
    /// Run `command` inside the guest via the QEMU guest agent's `exec`
    /// endpoint, waiting for it to complete and returning its stdout.
    async fn agent_exec(&self, node: &str, vmid: u64, command: &[String]) -> Result<String>;
    async fn storage_content(&self, node: &str, pool: &str) -> Result<Value>;
    /// The filesystem path backing a storage pool on a node (e.g. the images
    /// dir's parent).
    async fn storage_path(&self, node: &str, pool: &str) -> Result<String>;
}

#[async_trait::async_trait]
impl ClusterApi for ClusterClient {
    async fn list_cluster_resources(&self) -> Result<Vec<ClusterResource>> {
        self.get_json("/cluster/resources?type=vm").await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeResource>> {
        self.get_json("/nodes").await
    }

    async fn get_config(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<ConfigMap> {
        self.get_json(&format!("/nodes/{node}/{}/{vmid}/config", tree.path_segment())).await
    }

    async fn set_config(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        fields: HashMap<String, String>,
    ) -> Result<()> {
        self.put_form(&format!("/nodes/{node}/{}/{vmid}/config", tree.path_segment()), &fields).await
    }

    async fn status_current(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<ConfigMap> {
        self.get_json(&format!("/nodes/{node}/{}/{vmid}/status/current", tree.path_segment())).await
    }

    async fn start(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        self.post_form(&format!("/nodes/{node}/{}/{vmid}/status/start", tree.path_segment()), &HashMap::new())
            .await
            .map(|_| ())
    }

    async fn stop(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        self.post_form(&format!("/nodes/{node}/{}/{vmid}/status/stop", tree.path_segment()), &HashMap::new())
            .await
            .map(|_| ())
    }

    async fn shutdown(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        self.post_form(&format!("/nodes/{node}/{}/{vmid}/status/shutdown", tree.path_segment()), &HashMap::new())
            .await
            .map(|_| ())
    }

    async fn create_lxc(&self, node: &str, fields: HashMap<String, String>) -> Result<()> {
        self.post_form(&format!("/nodes/{node}/lxc"), &fields).await.map(|_| ())
    }

    async fn create_qemu(&self, node: &str, fields: HashMap<String, String>) -> Result<()> {
        self.post_form(&format!("/nodes/{node}/qemu"), &fields).await.map(|_| ())
    }

    async fn delete_instance(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        self.delete(&format!("/nodes/{node}/{}/{vmid}", tree.path_segment())).await
    }

    async fn resize_disk(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        disk: &str,
        size: &str,
    ) -> Result<()> {
        let mut fields = HashMap::new();
        fields.insert("disk".to_string(), disk.to_string());
        fields.insert("size".to_string(), size.to_string());
        self.put_form(&format!("/nodes/{node}/{}/{vmid}/resize", tree.path_segment()), &fields).await
    }

    async fn firewall_options(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        fields: HashMap<String, String>,
    ) -> Result<()> {
        self.put_form(&format!("/nodes/{node}/{}/{vmid}/firewall/options", tree.path_segment()), &fields).await
    }

    async fn set_ipset(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        name: &str,
        addresses: &[String],
    ) -> Result<()> {
        let base = format!("/nodes/{node}/{}/{vmid}/firewall/ipset", tree.path_segment());
        // Recreate the set: best effort delete then repopulate.
        let _ = self.delete(&format!("{base}/{name}")).await;
        let mut create = HashMap::new();
        create.insert("name".to_string(), name.to_string());
        self.post_form(&base, &create).await?;
        for addr in addresses {
            let mut entry = HashMap::new();
            entry.insert("cidr".to_string(), addr.clone());
            self.post_form(&format!("{base}/{name}"), &entry).await?;
        }
        Ok(())
    }

    async fn agent_ping(&self, node: &str, vmid: u64) -> Result<bool> {
        let path = format!("/nodes/{node}/qemu/{vmid}/agent/ping");
        let resp = self
            .http
            .post(self.url(&path))
            .header(self.auth_header.0.clone(), self.auth_header.1.clone())
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        Ok(resp.status().is_success())
    }

    async fn agent_set_user_password(&self, node: &str, vmid: u64, username: &str, password_hash: &str) -> Result<()> {
        let mut fields = HashMap::new();
        fields.insert("username".to_string(), username.to_string());
        fields.insert("password".to_string(), password_hash.to_string());
        fields.insert("crypted".to_string(), "1".to_string());
        self.post_form(&format!("/nodes/{node}/qemu/{vmid}/agent/set-user-password"), &fields).await.map(|_| ())
    }

    async fn agent_file_write(&self, node: &str, vmid: u64, path: &str, content: &str) -> Result<()> {
        let mut fields = HashMap::new();
        fields.insert("file".to_string(), path.to_string());
        fields.insert("content".to_string(), content.to_string());
        self.post_form(&format!("/nodes/{node}/qemu/{vmid}/agent/file-write"), &fields).await.map(|_| ())
    }

    async fn agent_exec(&self, node: &str, vmid: u64, command: &[String]) -> Result<String> {
        let mut fields = HashMap::new();
        fields.insert("command".to_string(), command.join(" "));
        let data = self.post_form(&format!("/nodes/{node}/qemu/{vmid}/agent/exec"), &fields).await?;
        #[derive(Deserialize)]
        struct ExecStatus {
            #[serde(default)]
            #[serde(rename = "out-data")]
            out_data: String,
        }
        let status: ExecStatus = serde_json::from_value(data).context("agent exec-status: invalid JSON")?;
        Ok(status.out_data)
    }

    async fn storage_content(&self, node: &str, pool: &str) -> Result<Value> {
        self.get_json(&format!("/nodes/{node}/storage/{pool}/content")).await
    }

    async fn storage_path(&self, node: &str, pool: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct StorageInfo {
            path: Option<String>,
        }
        let info: StorageInfo = self.get_json(&format!("/nodes/{node}/storage/{pool}")).await?;
        info.path.context("storage has no filesystem path")
    }
}

/// Parse a `key=value,key2=value2` config string into a map, tolerating
/// missing keys downstream.
pub fn parse_config_string(s: &str) -> ConfigMap {
    s.split(',')
        .filter_map(|part| {
            let mut it = part.splitn(2, '=');
            let key = it.next()?.trim();
            let value = it.next()?.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_volume_field_value_ignoring_the_leading_positional_volume_id() {
        // e.g. the value of `rootfs`/`virtio0` in a disk config entry.
        let cfg = parse_config_string("local:100/vm-100-disk-0,size=30G,ssd=1");
        assert_eq!(cfg.get("size").unwrap(), "30G");
        assert_eq!(cfg.get("ssd").unwrap(), "1");
        assert!(cfg.get("local:100/vm-100-disk-0").is_none());
    }

    #[test]
    fn missing_keys_are_simply_absent() {
        let cfg = parse_config_string("size=30G");
        assert!(cfg.get("swap").is_none());
        assert_eq!(cfg.get("size").unwrap(), "30G");
    }

    #[test]
    fn resource_tree_path_segments() {
        assert_eq!(ResourceTree::Lxc.path_segment(), "lxc");
        assert_eq!(ResourceTree::Qemu.path_segment(), "qemu");
    }
}
