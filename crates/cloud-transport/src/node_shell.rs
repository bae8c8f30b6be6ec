//! Scoped shell access to a cluster node: an SSH+SFTP session reached via a
//! bastion jump host, acquired fresh for the lifetime of a single task.
//!
//! Shells out to system binaries (`ssh`, `scp`) with an explicit argv —
//! never a shell-interpolated string — rather than linking a raw SSH
//! protocol library. OpenSSH's `-J` (`ProxyJump`) performs the
//! bastion-then-node tunnel directly (open a connection to the bastion,
//! open a direct-TCP channel to `<node>:22`, open a second SSH session over
//! it); `scp -J`/`sftp -J` do the same for file transfer. Sessions are not
//! shareable across tasks — each task acquires and tears down its own.

use std::io::Write;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cloud_core::config::BastionConfig;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// The exec/put_file contract exposed over a scoped node shell.
/// `exec` is synchronous in effect: it always waits for the remote exit
/// status, never just channel close.
#[async_trait]
pub trait NodeShell: Send + Sync {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput>;
    async fn put_file(&self, path: &str, bytes: &[u8], mode: u32, owner: &str, group: &str) -> Result<()>;
}

/// Real implementation: one `ssh -J`/`scp -J` invocation per call.
pub struct SshNodeShell {
    node: String,
    bastion: BastionConfig,
}

impl SshNodeShell {
    /// Acquire a scoped shell to `node`. Performs a cheap reachability probe
    /// (`true`) so callers fail fast rather than discovering a dead bastion
    /// mid-lifecycle-operation.
    pub async fn acquire(node: &str, bastion: &BastionConfig) -> Result<Self> {
        let shell = Self { node: node.to_string(), bastion: bastion.clone() };
        let probe = shell.exec("true").await.context("failed to reach node via bastion jump")?;
        if !probe.success() {
            anyhow::bail!("bastion jump reachability probe exited {}", probe.exit_status);
        }
        Ok(shell)
    }

    fn jump_target(&self) -> String {
        format!("{}@{}", self.bastion.bastion_user, self.bastion.bastion_host)
    }

    fn base_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-J".to_string(),
            self.jump_target(),
        ];
        if let Some(identity) = &self.bastion.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args
    }
}

#[async_trait]
impl NodeShell for SshNodeShell {
    async fn exec(&self, cmd: &str) -> Result<ExecOutput> {
        let mut args = self.base_ssh_args();
        args.push(format!("root@{}", self.node));
        args.push(cmd.to_string());

        let output = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn ssh for node {}", self.node))?;

        Ok(ExecOutput {
            exit_status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn put_file(&self, path: &str, bytes: &[u8], mode: u32, owner: &str, group: &str) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new().context("failed to create staging temp file")?;
        tmp.write_all(bytes).context("failed to write staging temp file")?;
        tmp.flush().ok();

        let mut scp_args = self.base_ssh_args();
        scp_args.push(tmp.path().to_string_lossy().to_string());
        scp_args.push(format!("root@{}:{}", self.node, path));

        let output = Command::new("scp")
            .args(&scp_args)
            .output()
            .await
            .with_context(|| format!("failed to scp {path} to node {}", self.node))?;
        if !output.status.success() {
            anyhow::bail!(
                "scp to {path} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let chmod_chown = format!("chmod {mode:o} '{path}' && chown {owner}:{group} '{path}'");
        let result = self.exec(&chmod_chown).await?;
        if !result.success() {
            anyhow::bail!(
                "chmod/chown {path} failed: {}",
                String::from_utf8_lossy(&result.stderr)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_target_format() {
        let bastion = BastionConfig {
            bastion_host: "bastion.example".into(),
            bastion_user: "deploy".into(),
            identity_file: None,
        };
        let shell = SshNodeShell { node: "leela".into(), bastion };
        assert_eq!(shell.jump_target(), "deploy@bastion.example");
    }

    #[test]
    fn base_args_include_identity_when_present() {
        let bastion = BastionConfig {
            bastion_host: "bastion.example".into(),
            bastion_user: "deploy".into(),
            identity_file: Some("/keys/deploy.pem".into()),
        };
        let shell = SshNodeShell { node: "leela".into(), bastion };
        let args = shell.base_ssh_args();
        assert!(args.iter().any(|a| a == "/keys/deploy.pem"));
    }
}
