//! Clap commands for the operator-facing CLI: a top-level
//! `#[derive(Parser)]` with a global `--output` flag and one subcommand enum
//! variant per resource, each carrying its own nested action enum.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cloud_core::model::{Instance, InstanceKind};
use cloud_engine::engine::{Engine, SshNodeShellFactory};
use cloud_transport::rest::ClusterClient;

use crate::config::{self, CliConfig};
use crate::output::{self, OutputFormat};
use crate::ui;

#[derive(Parser)]
#[command(name = "cloudctl", version, about = "Multi-tenant instance orchestration engine CLI")]
struct Cli {
    /// Path to the engine config file (TOML)
    #[arg(long, global = true, default_value = "/etc/netsoc-cloud/config.toml")]
    config: PathBuf,

    /// Output format: table, json
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage instances (containers and VMs)
    Instance {
        #[command(subcommand)]
        action: InstanceCmd,
    },
    /// Manage a single instance's virtual hosts
    Vhost {
        #[command(subcommand)]
        action: VhostCmd,
    },
    /// Manage a single instance's TCP/UDP port forwards
    Port {
        #[command(subcommand)]
        action: PortCmd,
    },
    /// Emit the reverse-proxy routing config document
    Routing {
        /// Print as JSON instead of the default table summary
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum InstanceCmd {
    /// Create a new instance
    Create {
        #[arg(value_enum)]
        kind: CliKind,
        owner: String,
        hostname: String,
        image: String,
        #[arg(long, default_value = "")]
        request_detail: String,
    },
    /// List every instance on the cluster
    List {
        /// Include malformed/unavailable instances rather than aborting
        #[arg(long, default_value_t = true)]
        ignore_errors: bool,
    },
    /// Show one instance by FQDN
    Show { fqdn: String },
    /// Start an instance
    Start { fqdn: String },
    /// Gracefully shut down an instance
    Shutdown { fqdn: String },
    /// Forcibly stop an instance
    Stop { fqdn: String },
    /// Delete a stopped instance
    Delete { fqdn: String },
    /// Reinstall (VM) / clear inactivity state
    MarkActive { fqdn: String },
    /// Reset the instance's root password and SSH key
    ResetRootUser { fqdn: String },
}

#[derive(Subcommand)]
enum VhostCmd {
    Add {
        fqdn: String,
        domain: String,
        port: u16,
        #[arg(long)]
        https: bool,
    },
    Remove { fqdn: String, domain: String },
}

#[derive(Subcommand)]
enum PortCmd {
    Add { fqdn: String, external: u16, internal: u16 },
    Remove { fqdn: String, external: u16 },
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum CliKind {
    Container,
    Vm,
}

impl From<CliKind> for InstanceKind {
    fn from(k: CliKind) -> Self {
        match k {
            CliKind::Container => InstanceKind::Container,
            CliKind::Vm => InstanceKind::Vm,
        }
    }
}

fn build_engine(cfg: CliConfig) -> Result<Engine> {
    let cluster = ClusterClient::new(&cfg.engine.rest).context("building hypervisor REST client")?;
    let shells = SshNodeShellFactory::new(cfg.engine.bastion.clone());
    Ok(Engine::new(cfg.engine, cfg.catalogue, Arc::new(cluster), Arc::new(shells)))
}

fn today() -> chrono::NaiveDate {
    Utc::now().date_naive()
}

fn print_instance_summary(instance: &Instance) {
    output::field("fqdn", &instance.fqdn);
    output::field("kind", format!("{:?}", instance.kind));
    output::field("node", &instance.node);
    output::field("status", format!("{:?}", instance.status));
    output::field("active", instance.active);
    output::field("ip", instance.metadata.network.nic_allocation.primary_ip());
    output::field("shutdown_date", instance.inactivity_shutdown_date);
    output::field("deletion_date", instance.inactivity_deletion_date);
    if !instance.remarks.is_empty() {
        for remark in &instance.remarks {
            ui::warn(remark);
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let out_fmt = OutputFormat::from_str_arg(&cli.output);
    let cli_config = config::load(&cli.config)?;
    let web_entrypoints = cli_config.web_entrypoints.clone();
    let engine = build_engine(cli_config)?;

    match cli.command {
        Commands::Instance { action } => cmd_instance(&engine, action, out_fmt).await,
        Commands::Vhost { action } => cmd_vhost(&engine, action).await,
        Commands::Port { action } => cmd_port(&engine, action).await,
        Commands::Routing { json } => cmd_routing(&engine, &web_entrypoints, json).await,
    }
}

async fn resolve(engine: &Engine, fqdn: &str) -> Result<Instance> {
    engine
        .read_instance_by_fqdn(today(), fqdn)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no instance named '{fqdn}'"))
}

async fn cmd_instance(engine: &Engine, action: InstanceCmd, out_fmt: OutputFormat) -> Result<()> {
    match action {
        InstanceCmd::Create { kind, owner, hostname, image, request_detail } => {
            let instance =
                engine.create(kind.into(), &owner, &hostname, &image, &request_detail, today()).await?;
            ui::success(&format!("created '{}' on node '{}'", instance.fqdn, instance.node));
            print_instance_summary(&instance);
            Ok(())
        }
        InstanceCmd::List { ignore_errors } => {
            let instances = engine.read_instances(today(), ignore_errors).await?;
            if out_fmt == OutputFormat::Json {
                return output::render_json(&instances);
            }
            if instances.is_empty() {
                ui::info("no instances found");
                return Ok(());
            }
            for instance in &instances {
                println!(
                    "{:<45} {:<10} {:<10} {:<9} {}",
                    instance.fqdn,
                    format!("{:?}", instance.kind),
                    instance.node,
                    format!("{:?}", instance.status),
                    instance.metadata.network.nic_allocation.primary_ip(),
                );
            }
            Ok(())
        }
        InstanceCmd::Show { fqdn } => {
            let instance = resolve(engine, &fqdn).await?;
            if out_fmt == OutputFormat::Json {
                return output::render_json(&instance);
            }
            print_instance_summary(&instance);
            Ok(())
        }
        InstanceCmd::Start { fqdn } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.start(&instance).await?;
            ui::success(&format!("started '{fqdn}'"));
            Ok(())
        }
        InstanceCmd::Shutdown { fqdn } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.shutdown(&instance).await?;
            ui::success(&format!("shut down '{fqdn}'"));
            Ok(())
        }
        InstanceCmd::Stop { fqdn } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.stop(&instance).await?;
            ui::success(&format!("stopped '{fqdn}'"));
            Ok(())
        }
        InstanceCmd::Delete { fqdn } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.delete(&instance).await?;
            ui::success(&format!("deleted '{fqdn}'"));
            Ok(())
        }
        InstanceCmd::MarkActive { fqdn } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.mark_active(&instance, today()).await?;
            ui::success(&format!("marked '{fqdn}' active"));
            Ok(())
        }
        InstanceCmd::ResetRootUser { fqdn } => {
            let instance = resolve(engine, &fqdn).await?;
            let (password, private_key, _root_user) = engine.reset_root_user(&instance, None).await?;
            ui::success(&format!("root credentials reset for '{fqdn}'"));
            println!("password: {password}");
            println!("{private_key}");
            Ok(())
        }
    }
}

async fn cmd_vhost(engine: &Engine, action: VhostCmd) -> Result<()> {
    match action {
        VhostCmd::Add { fqdn, domain, port, https } => {
            let instance = resolve(engine, &fqdn).await?;
            let opts = cloud_core::model::VhostOpts { port, https };
            engine.add_vhost(&instance, &domain, opts, today(), engine.dns.as_ref()).await?;
            ui::success(&format!("added vhost '{domain}' -> {fqdn}:{port}"));
            Ok(())
        }
        VhostCmd::Remove { fqdn, domain } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.remove_vhost(&instance, &domain).await?;
            ui::success(&format!("removed vhost '{domain}' from {fqdn}"));
            Ok(())
        }
    }
}

async fn cmd_port(engine: &Engine, action: PortCmd) -> Result<()> {
    match action {
        PortCmd::Add { fqdn, external, internal } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.add_port(&instance, external, internal, today()).await?;
            ui::success(&format!("added port {external} -> {internal} on {fqdn}"));
            Ok(())
        }
        PortCmd::Remove { fqdn, external } => {
            let instance = resolve(engine, &fqdn).await?;
            engine.remove_port(&instance, external).await?;
            ui::success(&format!("removed port {external} from {fqdn}"));
            Ok(())
        }
    }
}

async fn cmd_routing(engine: &Engine, web_entrypoints: &[String], json: bool) -> Result<()> {
    let doc = cloud_routing::build_routing_config(
        engine.cluster.as_ref(),
        &engine.config,
        engine.dns.as_ref(),
        today(),
        web_entrypoints,
    )
    .await?;
    if json {
        return output::render_json(&doc);
    }
    let http_count = doc.http.as_ref().map(|s| s.routers.len()).unwrap_or(0);
    let tcp_count = doc.tcp.as_ref().map(|s| s.routers.len()).unwrap_or(0);
    let udp_count = doc.udp.as_ref().map(|s| s.routers.len()).unwrap_or(0);
    output::field("http routers", http_count);
    output::field("tcp routers", tcp_count);
    output::field("udp routers", udp_count);
    Ok(())
}
