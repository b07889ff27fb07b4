//! Configuration for flotilla.

use crate::runtime::constants::{
    envs as const_envs, network as net_consts, runtime as runtime_consts, timeouts, vm_defaults,
};
use crate::runtime::layout::dirs as const_dirs;
use crate::runtime::types::{VmSpec, mac_for_index, validate_vm_id};
use crate::storage::StorageStrategy;
use dirs::home_dir;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Orchestrator Options
// ============================================================================

/// Where the orchestrator keeps its state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlotillaOptions {
    pub home_dir: PathBuf,
}

impl Default for FlotillaOptions {
    fn default() -> Self {
        let home_dir = std::env::var(const_envs::FLOTILLA_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(const_dirs::FLOTILLA_DIR);
                path
            });

        Self { home_dir }
    }
}

// ============================================================================
// Fleet Configuration
// ============================================================================

/// Host networking shared by the whole fleet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkOptions {
    pub bridge_name: String,
    /// Bridge address with prefix; the address is the guests' gateway.
    pub bridge_cidr: Ipv4Net,
    /// Source subnet masqueraded on the way out. Defaults to the bridge network.
    pub nat_subnet: Option<Ipv4Net>,
    /// Tap names are `{tap_prefix}{index}`.
    pub tap_prefix: String,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            bridge_name: net_consts::BRIDGE_NAME.to_string(),
            bridge_cidr: Ipv4Net::new(net_consts::BRIDGE_ADDR, net_consts::BRIDGE_PREFIX_LEN)
                .unwrap_or_default(),
            nat_subnet: None,
            tap_prefix: net_consts::TAP_PREFIX.to_string(),
        }
    }
}

impl NetworkOptions {
    pub fn gateway(&self) -> Ipv4Addr {
        self.bridge_cidr.addr()
    }

    pub fn nat_subnet(&self) -> Ipv4Net {
        self.nat_subnet.unwrap_or_else(|| self.bridge_cidr.trunc())
    }
}

/// How the external VM runtime is invoked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeOptions {
    pub firecracker_bin: PathBuf,
    /// Bound on each create/start call.
    pub setup_timeout_ms: u64,
    /// Runtime exiting within this window after spawn counts as a failed start.
    pub boot_grace_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from(runtime_consts::FIRECRACKER_BIN),
            setup_timeout_ms: timeouts::SETUP_TIMEOUT_MS,
            boot_grace_ms: timeouts::BOOT_GRACE_MS,
        }
    }
}

impl RuntimeOptions {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn boot_grace(&self) -> Duration {
        Duration::from_millis(self.boot_grace_ms)
    }
}

/// One fleet member as written in the fleet file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmEntry {
    /// Defaults to `vm{index}`.
    #[serde(default)]
    pub id: Option<String>,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub memory_mib: Option<u32>,
    #[serde(default)]
    pub vcpus: Option<u8>,
}

impl VmEntry {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            id: None,
            ip,
            memory_mib: None,
            vcpus: None,
        }
    }
}

/// Desired fleet.
///
/// Every field has a default, so an empty fleet file launches three
/// 96 MiB guests at 172.16.0.10-12.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub kernel: PathBuf,
    /// Golden rootfs shared by every VM.
    pub rootfs: PathBuf,
    pub boot_args: String,
    pub storage: StorageStrategy,
    pub memory_mib: u32,
    pub vcpus: u8,
    /// Free space demanded on top of the golden image size.
    pub disk_headroom_mib: u64,
    pub network: NetworkOptions,
    pub runtime: RuntimeOptions,
    pub vms: Vec<VmEntry>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let network = NetworkOptions::default();
        let vms = sequential_guest_ips(&network.bridge_cidr, vm_defaults::DEFAULT_VM_COUNT)
            .unwrap_or_default()
            .into_iter()
            .map(VmEntry::new)
            .collect();

        Self {
            kernel: PathBuf::from(vm_defaults::KERNEL_IMAGE),
            rootfs: PathBuf::from(vm_defaults::ROOTFS_IMAGE),
            boot_args: vm_defaults::BOOT_ARGS.to_string(),
            storage: StorageStrategy::default(),
            memory_mib: vm_defaults::DEFAULT_MEMORY_MIB,
            vcpus: vm_defaults::DEFAULT_VCPUS,
            disk_headroom_mib: vm_defaults::DISK_HEADROOM_MIB,
            network,
            runtime: RuntimeOptions::default(),
            vms,
        }
    }
}

impl FleetConfig {
    /// Replace the VM list with `count` guests numbered from `.10`.
    pub fn with_vm_count(mut self, count: usize) -> FlotillaResult<Self> {
        self.vms = sequential_guest_ips(&self.network.bridge_cidr, count)?
            .into_iter()
            .map(VmEntry::new)
            .collect();
        Ok(self)
    }

    /// Replace the VM list with the given guest addresses.
    pub fn with_guest_ips(mut self, ips: &[Ipv4Addr]) -> Self {
        self.vms = ips.iter().copied().map(VmEntry::new).collect();
        self
    }

    /// Check the configuration is self-consistent.
    ///
    /// Files on disk (kernel, rootfs) are not checked here: a missing golden
    /// image is a per-VM storage failure, not a configuration error.
    pub fn validate(&self) -> FlotillaResult<()> {
        if self.vms.is_empty() {
            return Err(FlotillaError::Config("fleet has no VMs".into()));
        }
        if self.memory_mib == 0 || self.vcpus == 0 {
            return Err(FlotillaError::Config(
                "memory_mib and vcpus must be greater than zero".into(),
            ));
        }
        if self.runtime.boot_grace_ms >= self.runtime.setup_timeout_ms {
            return Err(FlotillaError::Config(format!(
                "boot_grace_ms ({}) must be shorter than setup_timeout_ms ({})",
                self.runtime.boot_grace_ms, self.runtime.setup_timeout_ms
            )));
        }
        if self.network.bridge_name.is_empty()
            || self.network.bridge_name.len() > net_consts::MAX_IFNAME_LEN
        {
            return Err(FlotillaError::Config(format!(
                "bridge name '{}' must be 1-{} characters",
                self.network.bridge_name,
                net_consts::MAX_IFNAME_LEN
            )));
        }
        // Leave room for a three-digit suffix
        if self.network.tap_prefix.is_empty()
            || self.network.tap_prefix.len() + 3 > net_consts::MAX_IFNAME_LEN
        {
            return Err(FlotillaError::Config(format!(
                "tap prefix '{}' must be 1-{} characters",
                self.network.tap_prefix,
                net_consts::MAX_IFNAME_LEN - 3
            )));
        }

        let subnet = self.network.bridge_cidr;
        let mut ids = HashSet::new();
        let mut ips = HashSet::new();

        for (index, entry) in self.vms.iter().enumerate() {
            let vm_id = entry_id(entry, index);
            validate_vm_id(&vm_id)?;

            if !ids.insert(vm_id.clone()) {
                return Err(FlotillaError::Config(format!("duplicate VM id '{}'", vm_id)));
            }
            if !ips.insert(entry.ip) {
                return Err(FlotillaError::Config(format!(
                    "duplicate guest IP {} ({})",
                    entry.ip, vm_id
                )));
            }
            if !subnet.contains(&entry.ip) {
                return Err(FlotillaError::Config(format!(
                    "guest IP {} of {} is outside bridge subnet {}",
                    entry.ip,
                    vm_id,
                    subnet.trunc()
                )));
            }
            if entry.ip == subnet.addr() || entry.ip == subnet.network() || entry.ip == subnet.broadcast() {
                return Err(FlotillaError::Config(format!(
                    "guest IP {} of {} collides with the gateway, network or broadcast address",
                    entry.ip, vm_id
                )));
            }
            if entry.memory_mib == Some(0) || entry.vcpus == Some(0) {
                return Err(FlotillaError::Config(format!(
                    "{}: memory_mib and vcpus must be greater than zero",
                    vm_id
                )));
            }
        }

        Ok(())
    }

    /// Expand the configuration into one immutable spec per fleet member.
    pub fn vm_specs(&self) -> FlotillaResult<Vec<VmSpec>> {
        self.validate()?;

        let gateway = self.network.gateway();
        let prefix_len = self.network.bridge_cidr.prefix_len();

        Ok(self
            .vms
            .iter()
            .enumerate()
            .map(|(index, entry)| VmSpec {
                vm_id: entry_id(entry, index),
                index,
                guest_ip: entry.ip,
                prefix_len,
                gateway,
                mac_address: mac_for_index(index),
                memory_mib: entry.memory_mib.unwrap_or(self.memory_mib),
                vcpus: entry.vcpus.unwrap_or(self.vcpus),
                rootfs: self.rootfs.clone(),
                kernel: self.kernel.clone(),
                boot_args: self.boot_args.clone(),
                preferred_tap: format!("{}{}", self.network.tap_prefix, index),
            })
            .collect())
    }
}

fn entry_id(entry: &VmEntry, index: usize) -> String {
    entry.id.clone().unwrap_or_else(|| format!("vm{}", index))
}

/// `count` consecutive host addresses starting at `.10` of the bridge network.
fn sequential_guest_ips(bridge: &Ipv4Net, count: usize) -> FlotillaResult<Vec<Ipv4Addr>> {
    let does_not_fit = || {
        FlotillaError::Config(format!(
            "{} VMs do not fit in subnet {}",
            count,
            bridge.trunc()
        ))
    };

    let count = u32::try_from(count).map_err(|_| does_not_fit())?;
    let broadcast = u32::from(bridge.broadcast());
    let first = u32::from(bridge.network())
        .checked_add(u32::from(net_consts::FIRST_GUEST_HOST))
        .ok_or_else(does_not_fit)?;

    (0..count)
        .map(|offset| {
            first
                .checked_add(offset)
                .filter(|ip| *ip < broadcast)
                .map(Ipv4Addr::from)
                .ok_or_else(does_not_fit)
        })
        .collect()
}
