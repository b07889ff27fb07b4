//! Fleet member description.

use crate::runtime::constants::network as net_consts;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Desired state of one fleet member.
///
/// Built once from [`FleetConfig`](crate::FleetConfig) and never mutated;
/// every pipeline stage borrows it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Unique id, also the name of the VM's working directory.
    pub vm_id: String,
    /// Position in the fleet, drives MAC and tap name derivation.
    pub index: usize,
    pub guest_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub mac_address: String,
    pub memory_mib: u32,
    pub vcpus: u8,
    /// Golden rootfs (block image or directory tree)
    pub rootfs: PathBuf,
    pub kernel: PathBuf,
    pub boot_args: String,
    /// First tap name the allocator tries for this VM.
    pub preferred_tap: String,
}

/// Locally administered MAC for the VM at `index`: `AA:FC:00:00:HH:LL`.
pub fn mac_for_index(index: usize) -> String {
    format!(
        "{}:{:02X}:{:02X}",
        net_consts::MAC_PREFIX,
        (index >> 8) & 0xff,
        index & 0xff
    )
}

pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = match prefix_len {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    Ipv4Addr::from(bits)
}

/// VM ids name directories and show up in logs: keep them path-safe.
pub fn validate_vm_id(vm_id: &str) -> FlotillaResult<()> {
    if vm_id.is_empty() {
        return Err(FlotillaError::Config("VM id must not be empty".into()));
    }

    let valid = vm_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid || vm_id.starts_with('-') {
        return Err(FlotillaError::Config(format!(
            "Invalid VM id '{}': use letters, digits, '-' and '_'",
            vm_id
        )));
    }

    Ok(())
}
