//! In-memory `ClusterApi`/`NodeShell` fixtures for testing `cloud-engine`
//! without live infrastructure.
//!
//! A handler intercepts commands and answers from an in-memory fixture,
//! with a builder for seeding canned state, backed by a shared
//! `Arc<Mutex<_>>` state object since engine operations here are `async`
//! and may run on a multi-threaded executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::node_shell::{ExecOutput, NodeShell};
use crate::rest::{ClusterApi, ClusterResource, ConfigMap, NodeResource, ResourceTree};

#[derive(Debug, Clone)]
pub struct MockObject {
    pub node: String,
    pub tree: ResourceTree,
    pub name: String,
    pub config: ConfigMap,
    pub locked: bool,
    pub running: bool,
}

#[derive(Default)]
struct ClusterState {
    nodes: Vec<NodeResource>,
    objects: HashMap<u64, MockObject>,
    storage_paths: HashMap<String, String>,
    agent_ping_ok: HashMap<u64, bool>,
}

/// Builder/fixture for [`ClusterApi`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, node: &str, maxmem: u64, mem: u64, maxcpu: u64) -> Self {
        self.state.lock().unwrap().nodes.push(NodeResource {
            node: node.to_string(),
            maxmem: Some(maxmem),
            mem: Some(mem),
            maxcpu: Some(maxcpu),
            status: Some("online".to_string()),
        });
        self
    }

    pub fn with_storage_path(self, pool: &str, path: &str) -> Self {
        self.state.lock().unwrap().storage_paths.insert(pool.to_string(), path.to_string());
        self
    }

    /// Seed a pre-existing cluster object (container or VM), as if created by
    /// a prior `create_instance` call.
    pub fn with_object(
        self,
        vmid: u64,
        node: &str,
        tree: ResourceTree,
        name: &str,
        config: ConfigMap,
        running: bool,
    ) -> Self {
        self.state.lock().unwrap().objects.insert(
            vmid,
            MockObject { node: node.to_string(), tree, name: name.to_string(), config, locked: false, running },
        );
        self
    }

    pub fn set_locked(&self, vmid: u64, locked: bool) {
        if let Some(obj) = self.state.lock().unwrap().objects.get_mut(&vmid) {
            obj.locked = locked;
        }
    }

    pub fn set_agent_ping(&self, vmid: u64, ok: bool) {
        self.state.lock().unwrap().agent_ping_ok.insert(vmid, ok);
    }

    pub fn object(&self, vmid: u64) -> Option<MockObject> {
        self.state.lock().unwrap().objects.get(&vmid).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    fn find_by_name(&self, name: &str) -> Option<(u64, MockObject)> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .find(|(_, o)| o.name == name)
            .map(|(id, o)| (*id, o.clone()))
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn list_cluster_resources(&self) -> Result<Vec<ClusterResource>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .map(|(vmid, obj)| ClusterResource {
                id: format!("{}/{vmid}", if obj.tree == ResourceTree::Lxc { "lxc" } else { "qemu" }),
                kind: if obj.tree == ResourceTree::Lxc { "lxc".to_string() } else { "qemu".to_string() },
                vmid: *vmid,
                node: obj.node.clone(),
                name: Some(obj.name.clone()),
                status: Some(if obj.running { "running".to_string() } else { "stopped".to_string() }),
                maxmem: None,
                mem: None,
                maxcpu: None,
            })
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeResource>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn get_config(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<ConfigMap> {
        let state = self.state.lock().unwrap();
        let obj = state.objects.get(&vmid).filter(|o| o.node == node && o.tree == tree);
        let obj = obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?;
        let mut config = obj.config.clone();
        if obj.locked {
            config.insert("lock".to_string(), "backup".to_string());
        }
        Ok(config)
    }

    async fn set_config(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        fields: HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node && o.tree == tree);
        let obj = obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?;
        if let Some(name) = fields.get("name").or_else(|| fields.get("hostname")) {
            obj.name = name.clone();
        }
        obj.config.extend(fields);
        Ok(())
    }

    async fn status_current(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<ConfigMap> {
        let state = self.state.lock().unwrap();
        let obj = state.objects.get(&vmid).filter(|o| o.node == node && o.tree == tree);
        let obj = obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?;
        let mut m = HashMap::new();
        m.insert("status".to_string(), if obj.running { "running".to_string() } else { "stopped".to_string() });
        Ok(m)
    }

    async fn start(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node && o.tree == tree);
        obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?.running = true;
        Ok(())
    }

    async fn stop(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node && o.tree == tree);
        obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?.running = false;
        Ok(())
    }

    async fn shutdown(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        self.stop(node, tree, vmid).await
    }

    async fn create_lxc(&self, node: &str, fields: HashMap<String, String>) -> Result<()> {
        let vmid: u64 = fields.get("vmid").ok_or_else(|| anyhow::anyhow!("missing vmid"))?.parse()?;
        let name = fields.get("hostname").cloned().unwrap_or_default();
        if self.state.lock().unwrap().objects.contains_key(&vmid) {
            anyhow::bail!("vmid {vmid} already in use");
        }
        self.state.lock().unwrap().objects.insert(
            vmid,
            MockObject { node: node.to_string(), tree: ResourceTree::Lxc, name, config: fields, locked: false, running: false },
        );
        Ok(())
    }

    async fn create_qemu(&self, node: &str, fields: HashMap<String, String>) -> Result<()> {
        let vmid: u64 = fields.get("vmid").ok_or_else(|| anyhow::anyhow!("missing vmid"))?.parse()?;
        let name = fields.get("name").cloned().unwrap_or_default();
        if self.state.lock().unwrap().objects.contains_key(&vmid) {
            anyhow::bail!("vmid {vmid} already in use");
        }
        self.state.lock().unwrap().objects.insert(
            vmid,
            MockObject { node: node.to_string(), tree: ResourceTree::Qemu, name, config: fields, locked: false, running: false },
        );
        Ok(())
    }

    async fn delete_instance(&self, node: &str, tree: ResourceTree, vmid: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let matches = state.objects.get(&vmid).is_some_and(|o| o.node == node && o.tree == tree);
        if !matches {
            anyhow::bail!("no such object {vmid} on {node}");
        }
        state.objects.remove(&vmid);
        Ok(())
    }

    async fn resize_disk(&self, node: &str, tree: ResourceTree, vmid: u64, disk: &str, size: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node && o.tree == tree);
        obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?
            .config
            .insert(format!("{disk}_size"), size.to_string());
        Ok(())
    }

    async fn firewall_options(
        &self,
        node: &str,
        tree: ResourceTree,
        vmid: u64,
        fields: HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node && o.tree == tree);
        obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?
            .config
            .extend(fields.into_iter().map(|(k, v)| (format!("firewall_{k}"), v)));
        Ok(())
    }

    async fn set_ipset(&self, node: &str, tree: ResourceTree, vmid: u64, name: &str, addresses: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node && o.tree == tree);
        obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?
            .config
            .insert(format!("ipset_{name}"), addresses.join(","));
        Ok(())
    }

    async fn agent_ping(&self, _node: &str, vmid: u64) -> Result<bool> {
        Ok(*self.state.lock().unwrap().agent_ping_ok.get(&vmid).unwrap_or(&true))
    }

    async fn agent_set_user_password(&self, node: &str, vmid: u64, username: &str, password_hash: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node);
        obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?
            .config
            .insert(format!("agent_password_{username}"), password_hash.to_string());
        Ok(())
    }

    async fn agent_file_write(&self, node: &str, vmid: u64, path: &str, content: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node);
        obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?
            .config
            .insert(format!("agent_file:{path}"), content.to_string());
        Ok(())
    }

    async fn agent_exec(&self, node: &str, vmid: u64, command: &[String]) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let obj = state.objects.get_mut(&vmid).filter(|o| o.node == node);
        let obj = obj.ok_or_else(|| anyhow::anyhow!("no such object {vmid} on {node}"))?;
        let joined = command.join(" ");
        obj.config.insert(format!("agent_exec:{joined}"), "1".to_string());
        Ok(String::new())
    }

    async fn storage_content(&self, _node: &str, _pool: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Array(vec![]))
    }

    async fn storage_path(&self, _node: &str, pool: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .storage_paths
            .get(pool)
            .cloned()
            .unwrap_or_else(|| format!("/mnt/pve/{pool}")))
    }
}

/// Look up a seeded object by FQDN (the object `name` field), mirroring
/// `list_cluster_resources` + filter-by-name the way the real engine does.
impl MockCluster {
    pub fn find_vmid_by_fqdn(&self, fqdn: &str) -> Option<u64> {
        self.find_by_name(fqdn).map(|(id, _)| id)
    }
}

/// In-memory node filesystem + URL payload fixture backing [`NodeShell`].
/// Interprets the small, fixed vocabulary of shell commands `cloud-engine`
/// actually issues — it is not a general shell emulator.
#[derive(Clone, Default)]
pub struct MockNodeShell {
    inner: Arc<Mutex<ShellState>>,
}

#[derive(Default)]
struct ShellState {
    files: HashMap<String, Vec<u8>>,
    urls: HashMap<String, Vec<u8>>,
    fail_substrings: Vec<String>,
    exec_log: Vec<String>,
    unlock_failures_remaining: u32,
}

impl MockNodeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.inner.lock().unwrap().files.insert(path.to_string(), content.to_vec());
        self
    }

    pub fn with_url_payload(self, url: &str, content: &[u8]) -> Self {
        self.inner.lock().unwrap().urls.insert(url.to_string(), content.to_vec());
        self
    }

    /// Make any `exec` whose command contains `substring` fail (exit 1).
    pub fn with_failing_command(self, substring: &str) -> Self {
        self.inner.lock().unwrap().fail_substrings.push(substring.to_string());
        self
    }

    /// Simulate `pct unlock` needing to be retried `n` times before success.
    pub fn with_spurious_unlock_failures(self, n: u32) -> Self {
        self.inner.lock().unwrap().unlock_failures_remaining = n;
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().exec_log.clone()
    }

    fn ok(stdout: impl Into<String>) -> ExecOutput {
        ExecOutput { exit_status: 0, stdout: stdout.into().into_bytes(), stderr: Vec::new() }
    }

    fn err(stderr: impl Into<String>) -> ExecOutput {
        ExecOutput { exit_status: 1, stdout: Vec::new(), stderr: stderr.into().into_bytes() }
    }
}

#[async_trait]
impl NodeShell for MockNodeShell {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput> {
        let mut state = self.inner.lock().unwrap();
        state.exec_log.push(cmd.to_string());

        if state.fail_substrings.iter().any(|s| cmd.contains(s.as_str())) {
            return Ok(Self::err("mock-injected failure"));
        }

        if let Some(dir) = cmd.strip_prefix("mkdir -p ") {
            state.files.entry(format!("{dir}/.dir")).or_insert_with(Vec::new);
            return Ok(Self::ok(""));
        }

        if let Some(path) = cmd.strip_prefix("stat -c%s ") {
            return Ok(match state.files.get(path) {
                Some(bytes) => Self::ok(bytes.len().to_string()),
                None => Self::err("No such file or directory"),
            });
        }

        if cmd.contains("sha256sum ") && cmd.contains("| cut") {
            let path = cmd
                .trim_start_matches("sha256sum ")
                .split_whitespace()
                .next()
                .unwrap_or_default();
            return Ok(match state.files.get(path) {
                Some(bytes) => Self::ok(format!("{:x}\n", Sha256::digest(bytes))),
                None => Self::err("No such file or directory"),
            });
        }

        if let Some(rest) = cmd.strip_prefix("wget -q ") {
            let mut parts = rest.split(" -O ");
            let url = parts.next().unwrap_or_default().to_string();
            let dest = parts.next().unwrap_or_default().to_string();
            return Ok(match state.urls.get(&url).cloned() {
                Some(bytes) => {
                    state.files.insert(dest, bytes);
                    Self::ok("")
                }
                None => Self::err("404 Not Found"),
            });
        }

        if cmd.contains("&& mv ") {
            let mut it = cmd.splitn(2, "&& mv ");
            let rm_part = it.next().unwrap_or_default();
            let mv_args = it.next().unwrap_or_default();
            let target = rm_part.trim_start_matches("rm -f ").trim().to_string();
            let mut mv_it = mv_args.split_whitespace();
            let src = mv_it.next().unwrap_or_default().to_string();
            match state.files.remove(&src) {
                Some(bytes) => {
                    state.files.insert(target, bytes);
                    return Ok(Self::ok(""));
                }
                None => return Ok(Self::err("No such file or directory")),
            }
        }

        if cmd.contains("&& cp ") {
            // "cd <dir> && rm -f <id> && mkdir <id> && cp <src> ./primary.<fmt>"
            let src_and_dst = cmd.split("&& cp ").nth(1).unwrap_or_default();
            let mut it = src_and_dst.split_whitespace();
            let src = it.next().unwrap_or_default().to_string();
            match state.files.get(&src).cloned() {
                Some(bytes) => {
                    state.files.insert(format!("{cmd}::copied"), bytes);
                    return Ok(Self::ok(""));
                }
                None => return Ok(Self::err("No such file or directory")),
            }
        }

        if cmd.contains("qemu-img create") {
            return Ok(Self::ok(""));
        }

        if let Some(rest) = cmd.strip_prefix("pct unlock ") {
            let _ = rest;
            if state.unlock_failures_remaining > 0 {
                state.unlock_failures_remaining -= 1;
                return Ok(Self::err("unlock failed"));
            }
            return Ok(Self::ok(""));
        }

        if cmd.contains("-features fuse=1,keyctl=1,nesting=1") {
            return Ok(Self::ok(""));
        }

        if cmd.starts_with("cat ") && cmd.contains(" | pct ") {
            let staged = cmd.trim_start_matches("cat ").split(" |").next().unwrap_or_default();
            if !state.files.contains_key(staged) {
                return Ok(Self::err("staged file missing"));
            }
            return Ok(Self::ok(""));
        }

        if cmd.contains("pct exec") || cmd.contains("service ssh restart") || cmd.contains("mkdir -p /root/.ssh") {
            return Ok(Self::ok(""));
        }

        Ok(Self::ok(""))
    }

    async fn put_file(&self, path: &str, bytes: &[u8], _mode: u32, _owner: &str, _group: &str) -> Result<()> {
        self.inner.lock().unwrap().files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mkdir_then_stat_roundtrip() {
        let shell = MockNodeShell::new();
        shell.exec("mkdir -p /images").await.unwrap();
        let out = shell.exec("stat -c%s /images/alpine.tar.gz").await.unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn download_and_checksum() {
        let shell = MockNodeShell::new().with_url_payload("https://images.example/a", b"hello");
        let out = shell.exec("wget -q https://images.example/a -O /tmp/worker-123").await.unwrap();
        assert!(out.success());
        let out = shell.exec("sha256sum /tmp/worker-123 | cut -d' ' -f1").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_string().trim(), format!("{:x}", Sha256::digest(b"hello")));
    }

    #[tokio::test]
    async fn atomic_replace_moves_file() {
        let shell = MockNodeShell::new().with_file("/tmp/dl", b"payload");
        let out = shell.exec("rm -f /images/a.qcow2 && mv /tmp/dl /images/a.qcow2").await.unwrap();
        assert!(out.success());
        assert_eq!(shell.file("/images/a.qcow2").unwrap(), b"payload");
    }

    #[tokio::test]
    async fn spurious_unlock_failures_then_success() {
        let shell = MockNodeShell::new().with_spurious_unlock_failures(2);
        assert!(!shell.exec("pct unlock 101").await.unwrap().success());
        assert!(!shell.exec("pct unlock 101").await.unwrap().success());
        assert!(shell.exec("pct unlock 101").await.unwrap().success());
    }

    #[tokio::test]
    async fn mock_cluster_create_read_delete() {
        let cluster = MockCluster::new().with_node("leela", 16_000_000_000, 1_000_000_000, 8);
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "1234".to_string());
        fields.insert("hostname".to_string(), "web.ocanty.container.cloud.example".to_string());
        cluster.create_lxc("leela", fields).await.unwrap();

        let resources = cluster.list_cluster_resources().await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].vmid, 1234);

        cluster.delete_instance("leela", ResourceTree::Lxc, 1234).await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }
}
