//! Instance lifecycle manager: create, delete, start/stop/shutdown,
//! root-user reset, activity marking, and vhost/port mutation, all as
//! methods on [`Engine`].
//!
//! Generated secrets (passwords, SSH keys, sshd config, the login banner)
//! are staged on the node with [`NodeShell::put_file`] and referenced by
//! path in `exec`, rather than interpolated into a shell command string.
//! Same effect, smaller command-injection surface.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use cloud_core::audit::AuditAction;
use cloud_core::config::EngineConfig;
use cloud_core::error::{EngineError, EngineResult};
use cloud_core::model::{
    Inactivity, Instance, InstanceKind, InstanceStatus, Metadata, NetworkMetadata, RootUser, Tos, VhostOpts,
};
use cloud_core::naming::{build_fqdn, candidate_instance_id, default_vhost_label};
use cloud_core::{activity, metadata_codec};
use cloud_transport::node_shell::NodeShell;
use cloud_transport::rest::ResourceTree;

use crate::credentials::{self, GeneratedRootUser};
use crate::domain::DnsResolver;
use crate::engine::Engine;
use crate::{allocator, selector, wait};

fn tree_of(kind: InstanceKind) -> ResourceTree {
    match kind {
        InstanceKind::Container => ResourceTree::Lxc,
        InstanceKind::Vm => ResourceTree::Qemu,
    }
}

fn description_field(metadata: &Metadata) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert("description".to_string(), metadata_codec::encode(metadata));
    fields
}

fn default_banner(fqdn: &str) -> String {
    format!(
        "*** {fqdn} ***\nThis system is provisioned by the cloud platform. Unauthorized access is prohibited.\n",
    )
}

fn render_sshd_config() -> String {
    "Banner /etc/banner\nPermitRootLogin yes\nPasswordAuthentication yes\nPubkeyAuthentication yes\n".to_string()
}

fn render_userdata(fqdn: &str) -> String {
    format!(
        "#cloud-config\npreserve_hostname: false\nmanage_etc_hosts: true\nfqdn: {fqdn}\npackages:\n  - qemu-guest-agent\nchpasswd:\n  expire: false\ndisable_root: false\nssh_pwauth: true\nruncmd:\n  - [ systemctl, enable, qemu-guest-agent ]\n  - [ systemctl, start, qemu-guest-agent, --no-block ]\n",
    )
}

fn render_reinstall_userdata() -> String {
    "#cloud-config\nbootcmd:\n  - rm -f /etc/netplan/50-cloud-init.yaml\n  - cloud-init clean --logs\n  - rm -Rf /var/lib/cloud/*\n  - shutdown now\n".to_string()
}

fn render_networkconfig(instance: &Instance, config: &EngineConfig) -> String {
    let nic = &instance.metadata.network.nic_allocation;
    format!(
        "---\nethernets:\n  net0:\n    match:\n      macaddress: {mac}\n    nameservers:\n      addresses:\n        - 1.1.1.1\n        - 8.8.8.8\n    gateway4: {gw}\n    optional: true\n    link-local: []\n    addresses:\n      - {ip}/{prefix}\n    mtu: {mtu}\nversion: 2\n",
        mac = nic.mac,
        gw = nic.gateway4,
        ip = nic.primary_ip(),
        prefix = nic.addresses[0].prefix,
        mtu = config.mtu,
    )
}

impl Engine {
    /// Provision a new instance.
    #[tracing::instrument(skip(self, request_detail), fields(%kind, %owner, %hostname))]
    pub async fn create(
        &self,
        kind: InstanceKind,
        owner: &str,
        hostname: &str,
        image_id: &str,
        request_detail: &str,
        today: NaiveDate,
    ) -> EngineResult<Instance> {
        let image = self.catalogue.get(kind, image_id)?.clone();
        if !image.matches_kind(kind) {
            return Err(EngineError::ResourceUnavailable(format!(
                "image '{image_id}' is not in the disk format required for {kind:?}"
            )));
        }

        if self.read_instance_by_account(today, kind, owner, hostname).await?.is_some() {
            return Err(EngineError::AlreadyExists(format!(
                "instance '{hostname}' already exists for account '{owner}'"
            )));
        }

        let node = selector::select_node(self.cluster.as_ref(), &self.config, &image.specs).await?;
        let fqdn = build_fqdn(&self.config, kind, owner, hostname);

        let shell = self
            .shells
            .acquire(&node)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not acquire node shell", e))?;

        let images_root = self
            .cluster
            .storage_path(&node, &self.config.pool_images)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not resolve image storage path", e))?;
        let target_folder = format!("{images_root}/{}", self.config.kind_subdomain(kind));
        let disk_path = crate::materializer::materialize(shell.as_ref(), &image, &target_folder).await?;

        let generated = credentials::generate_root_user()?;
        let nic = allocator::allocate_nic(self.cluster.as_ref(), &self.config, kind, today).await?;

        let vhost_label = default_vhost_label(kind, owner, hostname, &self.config);
        let mut vhosts = BTreeMap::new();
        vhosts.insert(format!("{vhost_label}.{}", self.config.service_base_domain), VhostOpts { port: 80, https: false });

        let mut groups = BTreeSet::new();
        groups.insert(format!("cloud_{}", self.config.kind_subdomain(kind)));
        groups.insert("cloud_instance".to_string());

        let metadata = Metadata {
            owner: owner.to_string(),
            groups,
            request_detail: request_detail.to_string(),
            inactivity: Inactivity { marked_active_at: today },
            network: NetworkMetadata { nic_allocation: nic, vhosts, ports: BTreeMap::new() },
            root_user: generated.root_user.clone(),
            wake_on_request: image.wake_on_request,
            permanent: false,
            tos: Tos::default(),
        };

        let candidate_id = candidate_instance_id(&fqdn);

        match kind {
            InstanceKind::Container => {
                self.create_container(&node, candidate_id, &fqdn, &metadata, &image, &disk_path, shell.as_ref())
                    .await?
            }
            InstanceKind::Vm => {
                self.create_vm(&node, candidate_id, &fqdn, &metadata, &image, shell.as_ref()).await?
            }
        }

        tracing::info!(action = %AuditAction::InstanceCreated.as_str(), %fqdn, node = %node, "instance created");

        let tree = tree_of(kind);
        let resources = self
            .cluster
            .list_cluster_resources()
            .await
            .map_err(|e| EngineError::resource_unavailable("could not list cluster resources after create", e))?;
        let vmid = resources
            .iter()
            .find(|r| r.name.as_deref() == Some(fqdn.as_str()))
            .map(|r| r.vmid)
            .ok_or_else(|| EngineError::ResourceUnavailable("instance not found after creation".to_string()))?;

        wait::wait_created(
            self.cluster.as_ref(),
            &node,
            tree,
            vmid,
            &fqdn,
            self.config.creation_wait(),
            self.config.poll_interval(),
        )
        .await?;

        self.read_instance_by_fqdn(today, &fqdn)
            .await?
            .ok_or_else(|| EngineError::ResourceUnavailable("instance vanished immediately after creation".to_string()))
    }

    async fn create_container(
        &self,
        node: &str,
        candidate_id: u64,
        fqdn: &str,
        metadata: &Metadata,
        image: &cloud_core::model::Image,
        disk_path: &str,
        shell: &dyn NodeShell,
    ) -> EngineResult<()> {
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), candidate_id.to_string());
        fields.insert("hostname".to_string(), fqdn.to_string());
        fields.insert("description".to_string(), metadata_codec::encode(metadata));
        fields.insert("ostemplate".to_string(), disk_path.to_string());
        fields.insert("cores".to_string(), image.specs.cores.to_string());
        fields.insert("memory".to_string(), image.specs.memory_mb.to_string());
        fields.insert("swap".to_string(), image.specs.swap_mb.to_string());
        fields.insert("unprivileged".to_string(), "1".to_string());
        fields.insert("nameserver".to_string(), "1.1.1.1".to_string());
        fields.insert(
            "rootfs".to_string(),
            format!("{}:{}", self.config.pool_instances, image.specs.disk_space_gb),
        );

        self.cluster
            .create_lxc(node, fields)
            .await
            .map_err(|e| EngineError::resource_unavailable("container create request failed", e))?;

        wait::wait_created(
            self.cluster.as_ref(),
            node,
            ResourceTree::Lxc,
            candidate_id,
            fqdn,
            self.config.creation_wait(),
            self.config.poll_interval(),
        )
        .await?;
        wait::wait_lock_released(
            self.cluster.as_ref(),
            node,
            ResourceTree::Lxc,
            candidate_id,
            self.config.lock_wait(),
            self.config.poll_interval(),
        )
        .await?;

        // `pct unlock` spuriously fails once or twice before it sticks;
        // retry inline a few times before giving up.
        let mut attempts = 0;
        loop {
            let out = shell
                .exec(&format!("pct unlock {candidate_id}"))
                .await
                .map_err(|e| EngineError::resource_unavailable("force-unlock failed", e))?;
            if out.success() {
                break;
            }
            attempts += 1;
            if attempts > 2 {
                return Err(EngineError::ResourceUnavailable(format!(
                    "pct unlock {candidate_id} failed repeatedly"
                )));
            }
        }

        let features = shell
            .exec(&format!("pct set {candidate_id} -features fuse=1,keyctl=1,nesting=1"))
            .await
            .map_err(|e| EngineError::resource_unavailable("enabling container features failed", e))?;
        if !features.success() {
            return Err(EngineError::ResourceUnavailable(format!(
                "could not enable nesting features on container {candidate_id}"
            )));
        }
        Ok(())
    }

    async fn create_vm(
        &self,
        node: &str,
        candidate_id: u64,
        fqdn: &str,
        metadata: &Metadata,
        image: &cloud_core::model::Image,
        shell: &dyn NodeShell,
    ) -> EngineResult<()> {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let stub_name = format!("stub-{fqdn}-{host}-{}-{time}", std::process::id());

        let mut stub_fields = HashMap::new();
        stub_fields.insert("vmid".to_string(), candidate_id.to_string());
        stub_fields.insert("name".to_string(), stub_name.clone());

        self.cluster
            .create_qemu(node, stub_fields)
            .await
            .map_err(|e| EngineError::resource_unavailable("stub vm create request failed", e))?;

        let resources = self
            .cluster
            .list_cluster_resources()
            .await
            .map_err(|e| EngineError::resource_unavailable("could not list cluster resources after stub create", e))?;
        let vmid = resources
            .iter()
            .find(|r| r.name.as_deref() == Some(stub_name.as_str()))
            .map(|r| r.vmid)
            .ok_or_else(|| EngineError::ResourceUnavailable("stub vm not found after creation".to_string()))?;

        let result = self.provision_vm_disk(node, vmid, fqdn, metadata, image, shell).await;
        if let Err(err) = result {
            let _ = self.cluster.delete_instance(node, ResourceTree::Qemu, vmid).await;
            return Err(err);
        }

        wait::wait_lock_released(
            self.cluster.as_ref(),
            node,
            ResourceTree::Qemu,
            vmid,
            self.config.lock_wait(),
            self.config.poll_interval(),
        )
        .await?;

        self.cluster
            .resize_disk(node, ResourceTree::Qemu, vmid, "virtio0", &format!("{}G", image.specs.disk_space_gb))
            .await
            .map_err(|e| EngineError::resource_unavailable("disk resize failed", e))?;

        wait::wait_lock_released(
            self.cluster.as_ref(),
            node,
            ResourceTree::Qemu,
            vmid,
            self.config.lock_wait(),
            self.config.poll_interval(),
        )
        .await
    }

    async fn provision_vm_disk(
        &self,
        node: &str,
        vmid: u64,
        fqdn: &str,
        metadata: &Metadata,
        image: &cloud_core::model::Image,
        shell: &dyn NodeShell,
    ) -> EngineResult<()> {
        let instances_root = self
            .cluster
            .storage_path(node, &self.config.pool_instances)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not resolve instance storage path", e))?;
        let vm_folder = format!("{instances_root}/images/{vmid}");
        let ext = match image.disk_format {
            cloud_core::model::DiskFormat::Qcow2 => "qcow2",
            cloud_core::model::DiskFormat::TarGz => "tar.gz",
        };

        let images_root = self
            .cluster
            .storage_path(node, &self.config.pool_images)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not resolve image storage path", e))?;
        let source_path = format!("{images_root}/{}/{}", self.config.kind_subdomain(InstanceKind::Vm), image.disk_file);

        let copy = shell
            .exec(&format!(
                "cd {instances_root}/images && rm -f {vmid} && mkdir {vmid} && cd {vmid} && cp {source_path} ./primary.{ext}"
            ))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage instance disk image", e))?;
        if !copy.success() {
            return Err(EngineError::ResourceUnavailable("could not copy materialized disk into vm folder".to_string()));
        }

        let efi = shell
            .exec(&format!("cd {vm_folder} && qemu-img create -f qcow2 efi.qcow2 128K"))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not create efi disk", e))?;
        if !efi.success() {
            return Err(EngineError::ResourceUnavailable("could not create efi disk".to_string()));
        }

        let mut fields = HashMap::new();
        fields.insert("name".to_string(), fqdn.to_string());
        fields.insert("agent".to_string(), "1".to_string());
        fields.insert("description".to_string(), metadata_codec::encode(metadata));
        fields.insert("virtio0".to_string(), format!("{}:{}/primary.{ext}", self.config.pool_instances, vmid));
        fields.insert("cores".to_string(), image.specs.cores.to_string());
        fields.insert("memory".to_string(), image.specs.memory_mb.to_string());
        fields.insert("balloon".to_string(), image.specs.memory_mb.min(256).to_string());
        fields.insert("bios".to_string(), "ovmf".to_string());
        fields.insert("efidisk0".to_string(), format!("{}:{}/efi.qcow2", self.config.pool_instances, vmid));
        fields.insert("scsihw".to_string(), "virtio-scsi-pci".to_string());
        fields.insert("machine".to_string(), "q35".to_string());
        fields.insert("serial0".to_string(), "socket".to_string());
        fields.insert("bootdisk".to_string(), "virtio0".to_string());
        fields.insert("rng0".to_string(), "source=/dev/urandom".to_string());

        self.cluster
            .set_config(node, ResourceTree::Qemu, vmid, fields)
            .await
            .map_err(|e| EngineError::resource_unavailable("vm reconfiguration failed", e))
    }

    async fn snippets_path(&self, node: &str) -> EngineResult<String> {
        let root = self
            .cluster
            .storage_path(node, &self.config.pool_instances)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not resolve snippets storage path", e))?;
        Ok(format!("{root}/snippets"))
    }

    /// Tear down a stopped instance. VM cloud-init snippets are cleaned up
    /// first; they have no counterpart for containers.
    #[tracing::instrument(skip(self), fields(fqdn = %instance.fqdn))]
    pub async fn delete(&self, instance: &Instance) -> EngineResult<()> {
        if instance.status != InstanceStatus::Stopped {
            return Err(EngineError::ResourceUnavailable(format!(
                "cannot delete '{}' while it is running",
                instance.fqdn
            )));
        }

        if instance.kind == InstanceKind::Vm {
            let snippets = self.snippets_path(&instance.node).await?;
            let shell = self
                .shells
                .acquire(&instance.node)
                .await
                .map_err(|e| EngineError::resource_unavailable("could not acquire node shell", e))?;
            let _ = shell
                .exec(&format!(
                    "rm -f '{snippets}/{fqdn}.networkconfig.yml' '{snippets}/{fqdn}.userdata.yml' '{snippets}/{fqdn}.metadata.yml'",
                    fqdn = instance.fqdn
                ))
                .await;
        }

        self.cluster
            .delete_instance(&instance.node, tree_of(instance.kind), instance.id)
            .await
            .map_err(|e| EngineError::resource_unavailable("delete failed", e))?;

        tracing::info!(action = %AuditAction::InstanceDeleted.as_str(), fqdn = %instance.fqdn, "instance deleted");
        Ok(())
    }

    /// Start an instance, pushing network/firewall config first.
    #[tracing::instrument(skip(self), fields(fqdn = %instance.fqdn))]
    pub async fn start(&self, instance: &Instance) -> EngineResult<()> {
        self.start_with_reinstall(instance, false).await
    }

    /// VM-only: clear prior cloud-init state on next boot, then shut down
    /// again (the "VPS re-install" sentinel). The caller is expected
    /// to call [`Engine::start`] again once the guest reports stopped.
    pub async fn reinstall(&self, instance: &Instance) -> EngineResult<()> {
        if instance.kind != InstanceKind::Vm {
            return Err(EngineError::ResourceUnavailable("the re-install sentinel only applies to VMs".to_string()));
        }
        self.start_with_reinstall(instance, true).await
    }

    async fn start_with_reinstall(&self, instance: &Instance, vps_clear_cloudinit: bool) -> EngineResult<()> {
        match instance.kind {
            InstanceKind::Container => self.start_container(instance).await,
            InstanceKind::Vm => self.start_vm(instance, vps_clear_cloudinit).await,
        }
    }

    async fn start_container(&self, instance: &Instance) -> EngineResult<()> {
        let nic = &instance.metadata.network.nic_allocation;
        let network = self.config.network_for(instance.kind);

        let mut fields = HashMap::new();
        fields.insert("nameserver".to_string(), "1.1.1.1".to_string());
        fields.insert(
            "net0".to_string(),
            format!(
                "rate=12.5,name=eth0,bridge={bridge},tag={tag},hwaddr={mac},ip={ip}/{prefix},gw={gw},mtu={mtu}",
                bridge = network.bridge,
                tag = nic.vlan,
                mac = nic.mac,
                ip = nic.primary_ip(),
                prefix = nic.addresses[0].prefix,
                gw = nic.gateway4,
                mtu = self.config.mtu,
            ),
        );
        self.cluster
            .set_config(&instance.node, ResourceTree::Lxc, instance.id, fields)
            .await
            .map_err(|e| EngineError::resource_unavailable("network config push failed", e))?;

        let mut fw = HashMap::new();
        fw.insert("macfilter".to_string(), "1".to_string());
        fw.insert("ipfilter".to_string(), "1".to_string());
        self.cluster
            .firewall_options(&instance.node, ResourceTree::Lxc, instance.id, fw)
            .await
            .map_err(|e| EngineError::resource_unavailable("firewall config failed", e))?;

        self.cluster
            .start(&instance.node, ResourceTree::Lxc, instance.id)
            .await
            .map_err(|e| EngineError::resource_unavailable("start failed", e))?;

        tracing::info!(action = %AuditAction::InstanceStarted.as_str(), fqdn = %instance.fqdn, "instance started");
        Ok(())
    }

    async fn start_vm(&self, instance: &Instance, vps_clear_cloudinit: bool) -> EngineResult<()> {
        let snippets = self.snippets_path(&instance.node).await?;
        let shell = self
            .shells
            .acquire(&instance.node)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not acquire node shell", e))?;

        let _ = shell
            .exec(&format!(
                "rm -f '{snippets}/{fqdn}.networkconfig.yml' '{snippets}/{fqdn}.userdata.yml' '{snippets}/{fqdn}.metadata.yml'",
                fqdn = instance.fqdn
            ))
            .await;

        let mut detach = HashMap::new();
        detach.insert("ide2".to_string(), "none,media=cdrom".to_string());
        detach.insert("cicustom".to_string(), String::new());
        self.cluster
            .set_config(&instance.node, ResourceTree::Qemu, instance.id, detach)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not detach prior cloud-init drive", e))?;

        let userdata = if vps_clear_cloudinit {
            render_reinstall_userdata()
        } else {
            render_userdata(&instance.fqdn)
        };
        let networkconfig = render_networkconfig(instance, &self.config);

        shell
            .put_file(&format!("{snippets}/{}.networkconfig.yml", instance.fqdn), networkconfig.as_bytes(), 0o644, "root", "root")
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage networkconfig snippet", e))?;
        shell
            .put_file(&format!("{snippets}/{}.userdata.yml", instance.fqdn), userdata.as_bytes(), 0o644, "root", "root")
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage userdata snippet", e))?;
        shell
            .put_file(&format!("{snippets}/{}.metadata.yml", instance.fqdn), b"", 0o644, "root", "root")
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage metadata snippet", e))?;

        let mut cloudinit = HashMap::new();
        cloudinit.insert(
            "cicustom".to_string(),
            format!(
                "user={pool}:snippets/{fqdn}.userdata.yml,network={pool}:snippets/{fqdn}.networkconfig.yml,meta={pool}:snippets/{fqdn}.metadata.yml",
                pool = self.config.pool_instances,
                fqdn = instance.fqdn,
            ),
        );
        cloudinit.insert("ide2".to_string(), format!("{}:cloudinit,format=qcow2", self.config.pool_instances));
        self.cluster
            .set_config(&instance.node, ResourceTree::Qemu, instance.id, cloudinit)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not attach cloud-init drive", e))?;

        let nic = &instance.metadata.network.nic_allocation;
        let network = self.config.network_for(instance.kind);
        let mut net0 = HashMap::new();
        net0.insert(
            "net0".to_string(),
            format!("rate=12.5,virtio={mac},bridge={bridge},tag={tag}", mac = nic.mac, bridge = network.bridge, tag = nic.vlan),
        );
        self.cluster
            .set_config(&instance.node, ResourceTree::Qemu, instance.id, net0)
            .await
            .map_err(|e| EngineError::resource_unavailable("network card config failed", e))?;

        let mut fw = HashMap::new();
        fw.insert("macfilter".to_string(), "1".to_string());
        fw.insert("ipfilter".to_string(), "1".to_string());
        self.cluster
            .firewall_options(&instance.node, ResourceTree::Qemu, instance.id, fw)
            .await
            .map_err(|e| EngineError::resource_unavailable("firewall config failed", e))?;

        for (i, address) in nic.addresses.iter().enumerate() {
            self.cluster
                .set_ipset(&instance.node, ResourceTree::Qemu, instance.id, &format!("ipfilter-net{i}"), &[address.ip.to_string()])
                .await
                .map_err(|e| EngineError::resource_unavailable("ipset recreation failed", e))?;
        }

        self.cluster
            .start(&instance.node, ResourceTree::Qemu, instance.id)
            .await
            .map_err(|e| EngineError::resource_unavailable("start failed", e))?;

        tracing::info!(action = %AuditAction::InstanceStarted.as_str(), fqdn = %instance.fqdn, "instance started");
        Ok(())
    }

    /// Stop immediately. Idempotent: a no-op against an already-stopped
    /// instance.
    pub async fn stop(&self, instance: &Instance) -> EngineResult<()> {
        if instance.status == InstanceStatus::Stopped {
            return Ok(());
        }
        self.cluster
            .stop(&instance.node, tree_of(instance.kind), instance.id)
            .await
            .map_err(|e| EngineError::resource_unavailable("stop failed", e))?;
        tracing::info!(action = %AuditAction::InstanceStopped.as_str(), fqdn = %instance.fqdn, "instance stopped");
        Ok(())
    }

    /// Request a graceful shutdown. Idempotent: a no-op against an
    /// already-stopped instance.
    pub async fn shutdown(&self, instance: &Instance) -> EngineResult<()> {
        if instance.status == InstanceStatus::Stopped {
            return Ok(());
        }
        self.cluster
            .shutdown(&instance.node, tree_of(instance.kind), instance.id)
            .await
            .map_err(|e| EngineError::resource_unavailable("shutdown failed", e))?;
        tracing::info!(action = %AuditAction::InstanceShutdown.as_str(), fqdn = %instance.fqdn, "instance shutdown requested");
        Ok(())
    }

    /// Reset an instance's root password and SSH key, persisting the new
    /// `RootUser` into metadata on success. Returns the plaintext password
    /// and private key — the only point in the system either ever exists
    /// outside the guest.
    #[tracing::instrument(skip(self, root_user), fields(fqdn = %instance.fqdn))]
    pub async fn reset_root_user(
        &self,
        instance: &Instance,
        root_user: Option<GeneratedRootUser>,
    ) -> EngineResult<(String, String, RootUser)> {
        if instance.status != InstanceStatus::Running {
            return Err(EngineError::ResourceUnavailable(format!(
                "instance '{}' must be running to reset its root user",
                instance.fqdn
            )));
        }

        let generated = match root_user {
            Some(g) => g,
            None => credentials::generate_root_user()?,
        };

        wait::wait_lock_released(
            self.cluster.as_ref(),
            &instance.node,
            tree_of(instance.kind),
            instance.id,
            self.config.lock_wait(),
            self.config.poll_interval(),
        )
        .await?;

        match instance.kind {
            InstanceKind::Container => self.reset_root_user_container(instance, &generated).await?,
            InstanceKind::Vm => self.reset_root_user_vm(instance, &generated).await?,
        }

        let mut metadata = instance.metadata.clone();
        metadata.root_user = generated.root_user.clone();
        self.cluster
            .set_config(&instance.node, tree_of(instance.kind), instance.id, description_field(&metadata))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not persist reset root user", e))?;

        tracing::info!(action = %AuditAction::RootUserReset.as_str(), fqdn = %instance.fqdn, "root user reset");
        Ok((generated.plaintext_password, generated.ssh_private_key_openssh, generated.root_user))
    }

    async fn reset_root_user_container(&self, instance: &Instance, generated: &GeneratedRootUser) -> EngineResult<()> {
        let shell = self
            .shells
            .acquire(&instance.node)
            .await
            .map_err(|e| EngineError::resource_unavailable("could not acquire node shell", e))?;
        let vmid = instance.id;

        let staged_password = format!("/tmp/cloud-reset-password-{vmid}");
        shell
            .put_file(&staged_password, format!("root:{}\n", generated.root_user.password_hash).as_bytes(), 0o600, "root", "root")
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage password file", e))?;
        let chpasswd = shell
            .exec(&format!("cat {staged_password} | pct exec {vmid} -- chpasswd -e"))
            .await
            .map_err(|e| EngineError::resource_unavailable("chpasswd failed", e))?;
        if !chpasswd.success() {
            return Err(EngineError::ResourceUnavailable(format!("could not set root password in container {vmid}")));
        }

        let mkdir = shell
            .exec(&format!("pct exec {vmid} -- mkdir -p /root/.ssh"))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not create /root/.ssh", e))?;
        if !mkdir.success() {
            return Err(EngineError::ResourceUnavailable(format!("could not create /root/.ssh in container {vmid}")));
        }

        let authorized_keys = format!("# --- BEGIN PVE ---\n{}\n# --- END PVE ---\n", generated.root_user.ssh_public_key);
        let staged_keys = format!("/tmp/cloud-reset-authorized_keys-{vmid}");
        shell
            .put_file(&staged_keys, authorized_keys.as_bytes(), 0o600, "root", "root")
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage authorized_keys", e))?;
        let push_keys = shell
            .exec(&format!(
                "cat {staged_keys} | pct push {vmid} /dev/stdin /root/.ssh/authorized_keys --perms 0600 --user 0 --group 0"
            ))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not push authorized_keys", e))?;
        if !push_keys.success() {
            return Err(EngineError::ResourceUnavailable(format!("could not install authorized_keys in container {vmid}")));
        }

        let banner = credentials::sanitize_banner(&default_banner(&instance.fqdn));
        let staged_banner = format!("/tmp/cloud-reset-banner-{vmid}");
        shell
            .put_file(&staged_banner, banner.as_bytes(), 0o644, "root", "root")
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage banner", e))?;
        let push_banner = shell
            .exec(&format!("cat {staged_banner} | pct push {vmid} /dev/stdin /etc/banner --perms 0644 --user 0 --group 0"))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not push banner", e))?;
        if !push_banner.success() {
            return Err(EngineError::ResourceUnavailable(format!("could not install banner in container {vmid}")));
        }

        let staged_sshd = format!("/tmp/cloud-reset-sshd_config-{vmid}");
        shell
            .put_file(&staged_sshd, render_sshd_config().as_bytes(), 0o600, "root", "root")
            .await
            .map_err(|e| EngineError::resource_unavailable("could not stage sshd_config", e))?;
        let push_sshd = shell
            .exec(&format!("cat {staged_sshd} | pct push {vmid} /dev/stdin /etc/ssh/sshd_config --perms 0644 --user 0 --group 0"))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not push sshd_config", e))?;
        if !push_sshd.success() {
            return Err(EngineError::ResourceUnavailable(format!("could not install sshd_config in container {vmid}")));
        }

        let restart = shell
            .exec(&format!("pct exec {vmid} -- service ssh restart"))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not restart ssh", e))?;
        if !restart.success() {
            return Err(EngineError::ResourceUnavailable(format!("could not restart ssh in container {vmid}")));
        }

        Ok(())
    }

    async fn reset_root_user_vm(&self, instance: &Instance, generated: &GeneratedRootUser) -> EngineResult<()> {
        wait::wait_guest_agent_ping(
            self.cluster.as_ref(),
            &instance.node,
            instance.id,
            self.config.guest_agent_wait(),
            self.config.poll_interval(),
        )
        .await?;

        self.cluster
            .agent_exec(&instance.node, instance.id, &["passwd".to_string(), "-u".to_string(), "root".to_string()])
            .await
            .map_err(|e| EngineError::resource_unavailable("could not unlock root account", e))?;

        self.cluster
            .agent_set_user_password(&instance.node, instance.id, "root", &generated.root_user.password_hash)
            .await
            .map_err(|e| EngineError::resource_unavailable("agent set-user-password failed", e))?;

        self.cluster
            .agent_exec(&instance.node, instance.id, &["mkdir".to_string(), "-p".to_string(), "/root/.ssh".to_string()])
            .await
            .map_err(|e| EngineError::resource_unavailable("could not create /root/.ssh via guest agent", e))?;

        let authorized_keys = format!("# --- BEGIN PVE ---\n{}\n# --- END PVE ---", generated.root_user.ssh_public_key);
        self.cluster
            .agent_file_write(&instance.node, instance.id, "/root/.ssh/authorized_keys", &authorized_keys)
            .await
            .map_err(|e| EngineError::resource_unavailable("agent authorized_keys write failed", e))?;

        self.cluster
            .agent_file_write(&instance.node, instance.id, "/etc/ssh/sshd_config", &render_sshd_config())
            .await
            .map_err(|e| EngineError::resource_unavailable("agent sshd_config write failed", e))?;

        let banner = credentials::sanitize_banner(&default_banner(&instance.fqdn));
        self.cluster
            .agent_file_write(&instance.node, instance.id, "/etc/banner", &banner)
            .await
            .map_err(|e| EngineError::resource_unavailable("agent banner write failed", e))?;

        self.cluster
            .agent_exec(&instance.node, instance.id, &["service".to_string(), "ssh".to_string(), "restart".to_string()])
            .await
            .map_err(|e| EngineError::resource_unavailable("could not restart ssh via guest agent", e))?;

        Ok(())
    }

    /// Reset `inactivity.marked_active_at` to `today`.
    pub async fn mark_active(&self, instance: &Instance, today: NaiveDate) -> EngineResult<()> {
        let mut metadata = instance.metadata.clone();
        activity::mark_active(&mut metadata, today);
        self.cluster
            .set_config(&instance.node, tree_of(instance.kind), instance.id, description_field(&metadata))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not persist activity marker", e))?;
        tracing::info!(action = %AuditAction::MarkedActive.as_str(), fqdn = %instance.fqdn, "instance marked active");
        Ok(())
    }

    /// Add a vhost, rejecting it if another valid, already-claimed vhost on
    /// the cluster resolves to the same domain.
    pub async fn add_vhost(
        &self,
        instance: &Instance,
        domain: &str,
        options: VhostOpts,
        today: NaiveDate,
        resolver: &dyn DnsResolver,
    ) -> EngineResult<()> {
        if !allocator::is_domain_available(self.cluster.as_ref(), &self.config, today, resolver, domain).await? {
            return Err(EngineError::ResourceUnavailable(format!(
                "'{domain}' is currently in use by another instance"
            )));
        }

        let mut metadata = instance.metadata.clone();
        metadata.network.vhosts.insert(domain.to_string(), options);
        self.cluster
            .set_config(&instance.node, tree_of(instance.kind), instance.id, description_field(&metadata))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not persist vhost addition", e))?;
        tracing::info!(action = %AuditAction::VhostAdded.as_str(), fqdn = %instance.fqdn, %domain, "vhost added");
        Ok(())
    }

    pub async fn remove_vhost(&self, instance: &Instance, domain: &str) -> EngineResult<()> {
        let mut metadata = instance.metadata.clone();
        if metadata.network.vhosts.remove(domain).is_none() {
            return Err(EngineError::NotFound(format!("no vhost '{domain}' on instance '{}'", instance.fqdn)));
        }
        self.cluster
            .set_config(&instance.node, tree_of(instance.kind), instance.id, description_field(&metadata))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not persist vhost removal", e))?;
        tracing::info!(action = %AuditAction::VhostRemoved.as_str(), fqdn = %instance.fqdn, %domain, "vhost removed");
        Ok(())
    }

    /// Add a port mapping, rejecting it if the external port is already
    /// claimed on the cluster.
    pub async fn add_port(&self, instance: &Instance, external: u16, internal: u16, today: NaiveDate) -> EngineResult<()> {
        let map = allocator::port_map(self.cluster.as_ref(), &self.config, today).await?;
        if map.contains_key(&external) {
            return Err(EngineError::ResourceUnavailable(format!(
                "external port {external} is already mapped to another instance"
            )));
        }

        let mut metadata = instance.metadata.clone();
        metadata.network.ports.insert(external, internal);
        self.cluster
            .set_config(&instance.node, tree_of(instance.kind), instance.id, description_field(&metadata))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not persist port addition", e))?;
        tracing::info!(action = %AuditAction::PortAdded.as_str(), fqdn = %instance.fqdn, external, internal, "port added");
        Ok(())
    }

    /// A no-op (not an error) when `external` isn't currently mapped.
    pub async fn remove_port(&self, instance: &Instance, external: u16) -> EngineResult<()> {
        let mut metadata = instance.metadata.clone();
        if metadata.network.ports.remove(&external).is_none() {
            return Ok(());
        }
        self.cluster
            .set_config(&instance.node, tree_of(instance.kind), instance.id, description_field(&metadata))
            .await
            .map_err(|e| EngineError::resource_unavailable("could not persist port removal", e))?;
        tracing::info!(action = %AuditAction::PortRemoved.as_str(), fqdn = %instance.fqdn, external, "port removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::mock::StaticDnsResolver;
    use crate::engine::mock::MockNodeShellFactory;
    use cloud_core::config::tests_support::sample_config;
    use cloud_core::model::{DiskFormat, Image, Specs};
    use cloud_transport::mock::{MockCluster, MockNodeShell};
    use std::sync::Arc;

    fn alpine_container() -> Image {
        Image {
            id: "alpine-3.18".into(),
            disk_file: "alpine-3.18.tar.gz".into(),
            disk_format: DiskFormat::TarGz,
            disk_sha256: None,
            fallback_url: None,
            specs: Specs { cores: 1, memory_mb: 512, swap_mb: 512, disk_space_gb: 8 },
            wake_on_request: false,
        }
    }

    fn engine_with(cluster: MockCluster, shell: MockNodeShell) -> Engine {
        let mut catalogue = cloud_core::catalogue::ImageCatalogue::new();
        catalogue.insert(InstanceKind::Container, alpine_container());
        Engine::new(
            sample_config(),
            catalogue,
            Arc::new(cluster),
            Arc::new(MockNodeShellFactory(shell)),
        )
        .with_dns_resolver(Arc::new(StaticDnsResolver::new()))
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn create_container_happy_path() {
        let cluster = MockCluster::new().with_node("leela", 16_000_000_000, 1_000_000_000, 8);
        let shell = MockNodeShell::new().with_file(
            "/mnt/pve/images/container/alpine-3.18.tar.gz",
            b"rootfs-bytes",
        );
        let engine = engine_with(cluster, shell);

        let instance = engine
            .create(InstanceKind::Container, "ocanty", "web", "alpine-3.18", "initial provision", today())
            .await
            .unwrap();

        assert_eq!(instance.hostname, "web");
        assert_eq!(instance.metadata.owner, "ocanty");
        assert!(instance.metadata.groups.contains("cloud_instance"));
        assert_eq!(instance.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn create_rejects_hostname_collision() {
        let cluster = MockCluster::new().with_node("leela", 16_000_000_000, 1_000_000_000, 8);
        let shell = MockNodeShell::new().with_file("/mnt/pve/images/container/alpine-3.18.tar.gz", b"x");
        let engine = engine_with(cluster, shell);

        engine
            .create(InstanceKind::Container, "ocanty", "web", "alpine-3.18", "first", today())
            .await
            .unwrap();

        let err = engine
            .create(InstanceKind::Container, "ocanty", "web", "alpine-3.18", "second", today())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_requires_stopped_status() {
        let cluster = MockCluster::new().with_node("leela", 1, 1, 1);
        let shell = MockNodeShell::new();
        let engine = engine_with(cluster, shell);

        let nic = allocator::allocate_nic(engine.cluster.as_ref(), &engine.config, InstanceKind::Container, today())
            .await
            .unwrap();
        let metadata = Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: today() },
            network: NetworkMetadata { nic_allocation: nic, vhosts: BTreeMap::new(), ports: BTreeMap::new() },
            root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        };
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "100".to_string());
        fields.insert("hostname".to_string(), "web.ocanty.container.cloud.example".to_string());
        fields.insert("description".to_string(), metadata_codec::encode(&metadata));
        engine.cluster.create_lxc("leela", fields).await.unwrap();
        engine.cluster.start("leela", ResourceTree::Lxc, 100).await.unwrap();

        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);

        let err = engine.delete(&instance).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceUnavailable(_)));
    }

    #[tokio::test]
    async fn start_stop_shutdown_are_idempotent_when_already_stopped() {
        let cluster = MockCluster::new().with_node("leela", 1, 1, 1);
        let shell = MockNodeShell::new();
        let engine = engine_with(cluster, shell);

        let nic = allocator::allocate_nic(engine.cluster.as_ref(), &engine.config, InstanceKind::Container, today())
            .await
            .unwrap();
        let metadata = Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: today() },
            network: NetworkMetadata { nic_allocation: nic, vhosts: BTreeMap::new(), ports: BTreeMap::new() },
            root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        };
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "100".to_string());
        fields.insert("hostname".to_string(), "web.ocanty.container.cloud.example".to_string());
        fields.insert("description".to_string(), metadata_codec::encode(&metadata));
        engine.cluster.create_lxc("leela", fields).await.unwrap();

        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        engine.stop(&instance).await.unwrap();
        engine.shutdown(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn reset_root_user_requires_running_instance() {
        let cluster = MockCluster::new().with_node("leela", 1, 1, 1);
        let shell = MockNodeShell::new();
        let engine = engine_with(cluster, shell);

        let nic = allocator::allocate_nic(engine.cluster.as_ref(), &engine.config, InstanceKind::Container, today())
            .await
            .unwrap();
        let metadata = Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: today() },
            network: NetworkMetadata { nic_allocation: nic, vhosts: BTreeMap::new(), ports: BTreeMap::new() },
            root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        };
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "100".to_string());
        fields.insert("hostname".to_string(), "web.ocanty.container.cloud.example".to_string());
        fields.insert("description".to_string(), metadata_codec::encode(&metadata));
        engine.cluster.create_lxc("leela", fields).await.unwrap();

        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        let err = engine.reset_root_user(&instance, None).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceUnavailable(_)));
    }

    #[tokio::test]
    async fn add_port_then_remove_port_round_trips() {
        let cluster = MockCluster::new().with_node("leela", 1, 1, 1);
        let shell = MockNodeShell::new();
        let engine = engine_with(cluster, shell);

        let nic = allocator::allocate_nic(engine.cluster.as_ref(), &engine.config, InstanceKind::Container, today())
            .await
            .unwrap();
        let metadata = Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: today() },
            network: NetworkMetadata { nic_allocation: nic, vhosts: BTreeMap::new(), ports: BTreeMap::new() },
            root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        };
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "100".to_string());
        fields.insert("hostname".to_string(), "web.ocanty.container.cloud.example".to_string());
        fields.insert("description".to_string(), metadata_codec::encode(&metadata));
        engine.cluster.create_lxc("leela", fields).await.unwrap();

        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        engine.add_port(&instance, 20000, 22, today()).await.unwrap();
        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        assert_eq!(instance.metadata.network.ports.get(&20000), Some(&22));

        engine.remove_port(&instance, 20000).await.unwrap();
        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        assert!(instance.metadata.network.ports.is_empty());
    }

    #[tokio::test]
    async fn remove_port_on_absent_port_is_noop() {
        let cluster = MockCluster::new().with_node("leela", 1, 1, 1);
        let shell = MockNodeShell::new();
        let engine = engine_with(cluster, shell);

        let nic = allocator::allocate_nic(engine.cluster.as_ref(), &engine.config, InstanceKind::Container, today())
            .await
            .unwrap();
        let metadata = Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: today() },
            network: NetworkMetadata { nic_allocation: nic, vhosts: BTreeMap::new(), ports: BTreeMap::new() },
            root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        };
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "100".to_string());
        fields.insert("hostname".to_string(), "web.ocanty.container.cloud.example".to_string());
        fields.insert("description".to_string(), metadata_codec::encode(&metadata));
        engine.cluster.create_lxc("leela", fields).await.unwrap();

        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        engine.remove_port(&instance, 20000).await.unwrap();
        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        assert!(instance.metadata.network.ports.is_empty());
    }

    #[tokio::test]
    async fn mark_active_resets_inactivity_clock() {
        let cluster = MockCluster::new().with_node("leela", 1, 1, 1);
        let shell = MockNodeShell::new();
        let engine = engine_with(cluster, shell);

        let nic = allocator::allocate_nic(engine.cluster.as_ref(), &engine.config, InstanceKind::Container, today())
            .await
            .unwrap();
        let old_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let metadata = Metadata {
            owner: "ocanty".into(),
            groups: BTreeSet::new(),
            request_detail: String::new(),
            inactivity: Inactivity { marked_active_at: old_date },
            network: NetworkMetadata { nic_allocation: nic, vhosts: BTreeMap::new(), ports: BTreeMap::new() },
            root_user: RootUser { password_hash: String::new(), ssh_public_key: String::new() },
            wake_on_request: false,
            permanent: false,
            tos: Tos::default(),
        };
        let mut fields = HashMap::new();
        fields.insert("vmid".to_string(), "100".to_string());
        fields.insert("hostname".to_string(), "web.ocanty.container.cloud.example".to_string());
        fields.insert("description".to_string(), metadata_codec::encode(&metadata));
        engine.cluster.create_lxc("leela", fields).await.unwrap();

        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        engine.mark_active(&instance, today()).await.unwrap();
        let instance = engine.read_instance_by_fqdn(today(), "web.ocanty.container.cloud.example").await.unwrap().unwrap();
        assert_eq!(instance.metadata.inactivity.marked_active_at, today());
    }
}
