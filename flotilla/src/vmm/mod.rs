//! VM runtime contract.
//!
//! The supervisor only depends on [`VmRuntime`]: create, start, wait, stop.
//! [`FirecrackerRuntime`] implements it by spawning one Firecracker process
//! per VM from a generated config file.

mod firecracker;

pub use firecracker::FirecrackerRuntime;

use crate::net::NetworkAttachment;
use crate::runtime::constants::network as net_consts;
use crate::runtime::types::VmSpec;
use async_trait::async_trait;
use flotilla_shared::errors::FlotillaResult;
use flotilla_shared::layout::VmDirLayout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root block device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub path: PathBuf,
    pub read_only: bool,
}

/// Guest NIC backed by a host tap device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Guest-side name.
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpus: u8,
    pub memory_mib: u32,
}

/// Everything the runtime needs to boot one VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub vm_id: String,
    pub work_dir: PathBuf,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub metrics_path: PathBuf,
    pub kernel: PathBuf,
    pub boot_args: String,
    pub root_drive: Drive,
    pub network: Option<NetworkInterface>,
    pub machine: MachineConfig,
}

impl VmConfig {
    /// Assemble the config for `spec` inside its working directory.
    ///
    /// Static addressing from the attachment is appended to the boot args.
    pub fn assemble(
        spec: &VmSpec,
        vm_dir: &VmDirLayout,
        rootfs: PathBuf,
        attachment: Option<&NetworkAttachment>,
    ) -> Self {
        let mut boot_args = spec.boot_args.clone();
        if let Some(ip) = attachment.and_then(|a| a.ip.as_ref()) {
            if !boot_args.is_empty() {
                boot_args.push(' ');
            }
            boot_args.push_str(&ip.kernel_ip_arg());
        }

        Self {
            vm_id: spec.vm_id.clone(),
            work_dir: vm_dir.root().to_path_buf(),
            socket_path: vm_dir.socket_path(),
            log_path: vm_dir.log_path(),
            metrics_path: vm_dir.metrics_path(),
            kernel: spec.kernel.clone(),
            boot_args,
            root_drive: Drive {
                path: rootfs,
                read_only: false,
            },
            network: attachment.map(|a| NetworkInterface {
                iface_id: net_consts::GUEST_IFACE.to_string(),
                host_dev_name: a.tap_name.clone(),
                guest_mac: a.mac.clone(),
            }),
            machine: MachineConfig {
                vcpus: spec.vcpus,
                memory_mib: spec.memory_mib,
            },
        }
    }

    /// Point the guest NIC at a different tap.
    pub fn rebind_network(&mut self, attachment: &NetworkAttachment) {
        self.network = Some(NetworkInterface {
            iface_id: net_consts::GUEST_IFACE.to_string(),
            host_dev_name: attachment.tap_name.clone(),
            guest_mac: attachment.mac.clone(),
        });
    }

    pub fn tap_name(&self) -> Option<&str> {
        self.network.as_ref().map(|n| n.host_dev_name.as_str())
    }
}

/// Opaque reference to a created VM.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VmHandle {
    pub vm_id: String,
    pub instance: u64,
}

/// How a VM process ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// External VM runtime.
#[async_trait]
pub trait VmRuntime: Send + Sync {
    /// Register a VM without booting it.
    async fn create(&self, config: &VmConfig) -> FlotillaResult<VmHandle>;

    /// Boot a created VM.
    ///
    /// Fails with `FlotillaError::DeviceBusy` when the tap device cannot be
    /// opened.
    async fn start(&self, handle: &VmHandle) -> FlotillaResult<()>;

    /// Block until the VM exits. Meant to run detached.
    async fn wait(&self, handle: VmHandle) -> FlotillaResult<ExitInfo>;

    /// Tear down a VM in any state. Unknown handles are ignored.
    async fn stop(&self, handle: &VmHandle) -> FlotillaResult<()>;
}
