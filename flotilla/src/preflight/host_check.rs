//! Startup checks that gate the whole orchestrator.
//!
//! Both run before any host state is touched: without root nothing can
//! create bridges or taps, and without KVM no VM will boot.

use flotilla_shared::{FlotillaError, FlotillaResult};

/// Result of successful virtualization support detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualizationSupport {
    /// Human-readable reason for support status
    pub reason: String,
}

/// Require an effective uid of 0.
///
/// # Errors
///
/// Returns `FlotillaError::Privilege` when not running as root.
pub fn check_privileges() -> FlotillaResult<()> {
    let euid = nix::unistd::geteuid();
    if euid.is_root() {
        return Ok(());
    }

    Err(FlotillaError::Privilege(format!(
        "flotilla manages bridges, tap devices and NAT rules and must run as root (euid {})\n\n\
         Suggestions:\n\
         - Re-run with sudo\n\
         - Or grant CAP_NET_ADMIN and CAP_SYS_ADMIN to the binary",
        euid
    )))
}

const KVM_DEVICE: &str = "/dev/kvm";

/// Check that Firecracker will be able to open `/dev/kvm`.
///
/// # Errors
///
/// Returns `FlotillaError::Unsupported` with diagnostic suggestions if the
/// device is missing or cannot be opened read/write.
pub fn check_virtualization_support() -> FlotillaResult<VirtualizationSupport> {
    #[cfg(target_os = "linux")]
    {
        probe_kvm_device(std::path::Path::new(KVM_DEVICE))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(FlotillaError::Unsupported(format!(
            "Firecracker needs {} and only runs on Linux hosts",
            KVM_DEVICE
        )))
    }
}

#[cfg(target_os = "linux")]
fn probe_kvm_device(device: &std::path::Path) -> FlotillaResult<VirtualizationSupport> {
    use std::io::ErrorKind;

    let opened = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(device);

    match opened {
        Ok(_) => Ok(VirtualizationSupport {
            reason: format!("KVM available at {}", device.display()),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(FlotillaError::Unsupported(format!(
            "{} not found, microVMs cannot boot on this host\n\n\
             Suggestions:\n\
             - Enable VT-x / AMD-V in firmware settings\n\
             - Inside a cloud VM, enable nested virtualization\n\
             - Load the module: modprobe kvm_intel (or kvm_amd)",
            device.display()
        ))),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            Err(FlotillaError::Unsupported(format!(
                "{} is not accessible: {}\n\n\
                 Suggestions:\n\
                 - Check the device mode: ls -l {}\n\
                 - A container runtime may be hiding the device; pass it through with --device",
                device.display(),
                e,
                device.display()
            )))
        }
        Err(e) => Err(FlotillaError::Unsupported(format!(
            "failed to open {}: {}",
            device.display(),
            e
        ))),
    }
}
