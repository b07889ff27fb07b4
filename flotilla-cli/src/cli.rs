use crate::commands::{check::CheckArgs, launch::LaunchArgs, plan::PlanArgs};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flotilla::storage::StorageStrategy;
use flotilla::{FleetConfig, FlotillaOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "flotilla",
    version,
    about = "Launch and supervise a fleet of Firecracker microVMs on this host"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision and start the fleet, then stay resident until interrupted
    Launch(LaunchArgs),
    /// Report whether this host can run a fleet
    Check(CheckArgs),
    /// Show the VMs a launch would create without touching the host
    Plan(PlanArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Orchestrator state directory (default: ~/.flotilla)
    #[arg(long, global = true, env = "FLOTILLA_HOME")]
    pub home: Option<PathBuf>,

    /// Also print logs to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalFlags {
    pub fn options(&self) -> FlotillaOptions {
        match &self.home {
            Some(home_dir) => FlotillaOptions {
                home_dir: home_dir.clone(),
            },
            None => FlotillaOptions::default(),
        }
    }
}

/// Fleet file plus command-line overrides, shared by `launch` and `plan`.
#[derive(Args, Debug, Clone, Default)]
pub struct FleetArgs {
    /// Fleet file (YAML); every field is optional
    #[arg(short = 'f', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Guest kernel image
    #[arg(long)]
    pub kernel: Option<PathBuf>,

    /// Golden rootfs (block image or directory)
    #[arg(long)]
    pub rootfs: Option<PathBuf>,

    /// Rootfs provisioning strategy: reflink or overlay
    #[arg(long)]
    pub storage: Option<StorageStrategy>,

    /// Guest addresses, one VM each (comma separated or repeated)
    #[arg(long = "ip", value_delimiter = ',', conflicts_with = "count")]
    pub ips: Vec<Ipv4Addr>,

    /// Number of VMs, addressed from .10 of the bridge subnet
    #[arg(long)]
    pub count: Option<usize>,

    /// Memory per VM in MiB
    #[arg(long)]
    pub memory: Option<u32>,

    /// vCPUs per VM
    #[arg(long)]
    pub vcpus: Option<u8>,

    /// Firecracker binary
    #[arg(long)]
    pub firecracker_bin: Option<PathBuf>,

    /// Bound on each VM create/start call, in milliseconds
    #[arg(long)]
    pub setup_timeout_ms: Option<u64>,
}

impl FleetArgs {
    /// Load the fleet file (if any), apply overrides and validate.
    pub fn resolve(&self) -> anyhow::Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => load_fleet_file(path)?,
            None => FleetConfig::default(),
        };

        if let Some(kernel) = &self.kernel {
            config.kernel = kernel.clone();
        }
        if let Some(rootfs) = &self.rootfs {
            config.rootfs = rootfs.clone();
        }
        if let Some(storage) = self.storage {
            config.storage = storage;
        }
        if let Some(memory) = self.memory {
            config.memory_mib = memory;
        }
        if let Some(vcpus) = self.vcpus {
            config.vcpus = vcpus;
        }
        if let Some(bin) = &self.firecracker_bin {
            config.runtime.firecracker_bin = bin.clone();
        }
        if let Some(timeout) = self.setup_timeout_ms {
            config.runtime.setup_timeout_ms = timeout;
        }
        if !self.ips.is_empty() {
            config = config.with_guest_ips(&self.ips);
        } else if let Some(count) = self.count {
            config = config.with_vm_count(count)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn load_fleet_file(path: &Path) -> anyhow::Result<FleetConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fleet file {}", path.display()))?;

    if text.trim().is_empty() {
        return Ok(FleetConfig::default());
    }

    serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse fleet file {}", path.display()))
}
