//! cloud-transport: the cluster transport layer.
//!
//! A typed REST client for the hypervisor's cluster API plus a scoped
//! per-node SSH/SFTP shell. Both are exposed as traits (`ClusterApi`,
//! [`node_shell::NodeShell`]) so `cloud-engine` can be driven against an
//! in-memory mock fixture instead of live infrastructure.

#[cfg(feature = "test-util")]
pub mod mock;
pub mod node_shell;
pub mod rest;

pub use node_shell::{ExecOutput, NodeShell, SshNodeShell};
pub use rest::{ClusterApi, ClusterClient, ClusterResource, ConfigMap, NodeResource, ResourceTree};
