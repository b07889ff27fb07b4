//! Constants for the flotilla orchestrator.
//!
//! Defaults mirror the single-host launcher this tool replaces: one bridge
//! at 172.16.0.1/24, guests from .10 upwards, 96 MiB / 1 vCPU machines.

pub mod envs {
    pub const FLOTILLA_HOME: &str = "FLOTILLA_HOME";
}

/// Host network defaults
pub mod network {
    use std::net::Ipv4Addr;

    /// Bridge joining every tap device
    pub const BRIDGE_NAME: &str = "fcbr0";

    /// Bridge address, doubles as the guests' gateway
    pub const BRIDGE_ADDR: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);

    pub const BRIDGE_PREFIX_LEN: u8 = 24;

    /// Prefix for per-VM tap devices (tap names get a numeric suffix)
    pub const TAP_PREFIX: &str = "fctap";

    /// First guest address handed out when only a VM count is given
    pub const FIRST_GUEST_HOST: u8 = 10;

    /// Guest-side interface name used in the kernel `ip=` argument
    pub const GUEST_IFACE: &str = "eth0";

    /// Locally administered MAC prefix for guest NICs
    pub const MAC_PREFIX: &str = "AA:FC:00:00";

    /// Kernel limit on interface name length (IFNAMSIZ - 1)
    pub const MAX_IFNAME_LEN: usize = 15;

    /// How many suffixes the tap allocator tries before giving up
    pub const MAX_TAP_CANDIDATES: usize = 256;
}

/// Virtual machine resource defaults
pub mod vm_defaults {
    pub const DEFAULT_VCPUS: u8 = 1;

    pub const DEFAULT_MEMORY_MIB: u32 = 96;

    pub const DEFAULT_VM_COUNT: usize = 3;

    pub const KERNEL_IMAGE: &str = "hello-vmlinux.bin";

    pub const ROOTFS_IMAGE: &str = "alpine-rootfs.ext4";

    pub const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda rw quiet";

    /// Extra free space demanded on top of the golden image size
    pub const DISK_HEADROOM_MIB: u64 = 64;
}

/// Timeouts for calls into the VM runtime
pub mod timeouts {
    /// Bound on each create/start call
    pub const SETUP_TIMEOUT_MS: u64 = 5_000;

    /// A runtime process exiting within this window counts as a failed start
    pub const BOOT_GRACE_MS: u64 = 500;
}

/// VM runtime binary
pub mod runtime {
    pub const FIRECRACKER_BIN: &str = "firecracker";
}

pub mod filenames {
    /// Lock file name
    pub const LOCK_FILE: &str = ".lock";

    /// Orchestrator log file inside logs/
    pub const LOG_FILE: &str = "flotilla.log";
}
