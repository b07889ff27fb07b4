//! Host networking: one shared bridge with NAT, one tap device per VM.
//!
//! ```text
//!   guest eth0 ── fctapN ──┐
//!   guest eth0 ── fctapM ──┼── fcbr0 (172.16.0.1/24) ── MASQUERADE ── uplink
//!   guest eth0 ── fctapK ──┘
//! ```
//!
//! Every host mutation goes through [`NetworkTools`]; the provisioner holds
//! the policy (idempotent host setup, tap naming, stale device reclaim).

mod system;
mod tap;

pub use system::SystemNetworkTools;
pub use tap::tap_candidates;

use crate::runtime::constants::network as net_consts;
use crate::runtime::types::VmSpec;
use async_trait::async_trait;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::OnceCell;

// ============================================================================
// Host tools
// ============================================================================

/// Privileged host networking operations.
///
/// Implementations report missing privileges as `FlotillaError::Privilege`
/// so callers can tell them apart from ordinary failures.
#[async_trait]
pub trait NetworkTools: Send + Sync {
    async fn link_exists(&self, name: &str) -> FlotillaResult<bool>;

    async fn create_bridge(&self, name: &str) -> FlotillaResult<()>;

    /// Assign `addr` to `dev`. An address already present is not an error.
    async fn add_address(&self, dev: &str, addr: &Ipv4Net) -> FlotillaResult<()>;

    async fn set_link_up(&self, dev: &str) -> FlotillaResult<()>;

    async fn create_tap(&self, name: &str) -> FlotillaResult<()>;

    /// Delete a link. A link that does not exist is not an error.
    async fn delete_link(&self, name: &str) -> FlotillaResult<()>;

    async fn set_master(&self, dev: &str, bridge: &str) -> FlotillaResult<()>;

    async fn nat_rule_exists(&self, rule: &NatRule) -> FlotillaResult<bool>;

    async fn insert_nat_rule(&self, rule: &NatRule) -> FlotillaResult<()>;

    /// PIDs of processes holding the tun/tap device `name` open.
    async fn device_holders(&self, name: &str) -> FlotillaResult<Vec<u32>>;

    /// Turn on IPv4 forwarding so NATed guest traffic leaves the host.
    async fn enable_forwarding(&self) -> FlotillaResult<()>;
}

/// Source-NAT for guest traffic leaving through anything but the bridge.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NatRule {
    pub subnet: Ipv4Net,
    pub bridge: String,
}

impl NatRule {
    pub fn new(subnet: Ipv4Net, bridge: impl Into<String>) -> Self {
        Self {
            subnet,
            bridge: bridge.into(),
        }
    }

    /// Rule body for the `nat` table `POSTROUTING` chain.
    pub fn rule_args(&self) -> Vec<String> {
        vec![
            "-s".to_string(),
            self.subnet.to_string(),
            "!".to_string(),
            "-o".to_string(),
            self.bridge.clone(),
            "-j".to_string(),
            "MASQUERADE".to_string(),
        ]
    }
}

// ============================================================================
// Shared host state
// ============================================================================

/// Bridge and NAT rule shared by every VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostNetwork {
    pub bridge_name: String,
    pub bridge_cidr: Ipv4Net,
    pub nat_rule: NatRule,
}

impl HostNetwork {
    pub fn gateway(&self) -> Ipv4Addr {
        self.bridge_cidr.addr()
    }
}

/// Process-wide handle on the host network setup.
///
/// Setup runs at most once successfully per handle; clones share the cell.
#[derive(Clone, Debug, Default)]
pub struct HostNetworkState {
    inner: Arc<OnceCell<HostNetwork>>,
}

impl HostNetworkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&HostNetwork> {
        self.inner.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }
}

// ============================================================================
// Attachments
// ============================================================================

/// Static guest addressing passed on the kernel command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticIpConfig {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

impl StaticIpConfig {
    /// `ip=<client>::<gw>:<netmask>::<device>:off`
    pub fn kernel_ip_arg(&self) -> String {
        format!(
            "ip={}::{}:{}::{}:off",
            self.address,
            self.gateway,
            crate::runtime::types::prefix_to_netmask(self.prefix_len),
            net_consts::GUEST_IFACE
        )
    }
}

/// Reservation of a tap name for one VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapLease {
    pub name: String,
    /// An unheld device of this name was left behind and has been deleted.
    pub reclaimed: bool,
}

/// A VM's network identity: its tap on the bridge plus guest addressing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub tap_name: String,
    pub bridge: String,
    pub mac: String,
    pub ip: Option<StaticIpConfig>,
}

// ============================================================================
// Provisioner
// ============================================================================

/// Host network setup and tap allocation.
pub struct NetworkProvisioner {
    tools: Arc<dyn NetworkTools>,
    /// Serializes allocation so two launches never probe-then-take the same name.
    alloc_lock: tokio::sync::Mutex<()>,
    /// Tap names owned by live VMs of this process.
    leases: Mutex<HashSet<String>>,
}

impl NetworkProvisioner {
    pub fn new(tools: Arc<dyn NetworkTools>) -> Self {
        Self {
            tools,
            alloc_lock: tokio::sync::Mutex::new(()),
            leases: Mutex::new(HashSet::new()),
        }
    }

    pub fn tools(&self) -> &Arc<dyn NetworkTools> {
        &self.tools
    }

    /// Bring up the bridge, its address and the NAT rule.
    ///
    /// Safe to call any number of times: concurrent callers share one
    /// execution and later callers get the recorded result. A failed attempt
    /// leaves `state` empty so the next call tries again.
    ///
    /// # Errors
    ///
    /// `Privilege` when the tools lack privileges, `HostState` otherwise.
    pub async fn ensure_host_network(
        &self,
        state: &HostNetworkState,
        bridge_name: &str,
        bridge_cidr: Ipv4Net,
        nat_subnet: Ipv4Net,
    ) -> FlotillaResult<HostNetwork> {
        let network = state
            .inner
            .get_or_try_init(|| async {
                self.setup_host_network(bridge_name, bridge_cidr, nat_subnet)
                    .await
                    .map_err(|e| match e {
                        fatal @ (FlotillaError::Privilege(_) | FlotillaError::HostState(_)) => fatal,
                        other => FlotillaError::HostState(format!(
                            "failed to set up bridge {}: {}",
                            bridge_name, other
                        )),
                    })
            })
            .await?;

        if network.bridge_name != bridge_name || network.bridge_cidr != bridge_cidr {
            tracing::warn!(
                requested = bridge_name,
                active = %network.bridge_name,
                "Host network already initialized with different parameters"
            );
        }

        Ok(network.clone())
    }

    async fn setup_host_network(
        &self,
        bridge_name: &str,
        bridge_cidr: Ipv4Net,
        nat_subnet: Ipv4Net,
    ) -> FlotillaResult<HostNetwork> {
        if self.tools.link_exists(bridge_name).await? {
            tracing::debug!(bridge = bridge_name, "Bridge already present");
        } else {
            tracing::info!(bridge = bridge_name, "Creating bridge");
            self.tools.create_bridge(bridge_name).await?;
        }

        self.tools.add_address(bridge_name, &bridge_cidr).await?;
        self.tools.set_link_up(bridge_name).await?;

        let nat_rule = NatRule::new(nat_subnet, bridge_name);
        if self.tools.nat_rule_exists(&nat_rule).await? {
            tracing::debug!(subnet = %nat_subnet, "NAT rule already present");
        } else {
            tracing::info!(subnet = %nat_subnet, bridge = bridge_name, "Installing NAT rule");
            self.tools.insert_nat_rule(&nat_rule).await?;
        }

        self.tools.enable_forwarding().await?;

        tracing::info!(bridge = bridge_name, cidr = %bridge_cidr, "Host network ready");

        Ok(HostNetwork {
            bridge_name: bridge_name.to_string(),
            bridge_cidr,
            nat_rule,
        })
    }

    /// Reserve a tap name, starting at `preferred`.
    ///
    /// Names leased to live VMs are skipped. An existing device held open by
    /// some process is skipped; an existing device nobody holds is stale and
    /// is deleted so its name can be reused.
    pub async fn allocate_tap(&self, preferred: &str) -> FlotillaResult<TapLease> {
        let _guard = self.alloc_lock.lock().await;
        let candidates = tap_candidates(preferred)?;

        for candidate in &candidates {
            if self.leases.lock().contains(candidate) {
                tracing::debug!(tap = %candidate, "Tap leased to a running VM, skipping");
                continue;
            }

            let mut reclaimed = false;
            if self.tools.link_exists(candidate).await? {
                let holders = self.tools.device_holders(candidate).await?;
                if !holders.is_empty() {
                    tracing::warn!(tap = %candidate, ?holders, "Tap device busy, skipping");
                    continue;
                }

                tracing::info!(tap = %candidate, "Reclaiming stale tap device");
                self.tools.delete_link(candidate).await?;
                reclaimed = true;
            }

            self.leases.lock().insert(candidate.clone());
            tracing::debug!(tap = %candidate, reclaimed, "Allocated tap");

            return Ok(TapLease {
                name: candidate.clone(),
                reclaimed,
            });
        }

        Err(FlotillaError::Network(format!(
            "no free tap device after {} candidates starting at '{}'",
            candidates.len(),
            preferred
        )))
    }

    /// Create the leased tap and join it to `bridge_name`.
    pub async fn attach_tap(&self, lease: &TapLease, bridge_name: &str) -> FlotillaResult<()> {
        // Raced in since allocation, or left by a failed attach
        if self.tools.link_exists(&lease.name).await? {
            self.tools.delete_link(&lease.name).await?;
        }

        self.tools.create_tap(&lease.name).await?;
        self.tools.set_master(&lease.name, bridge_name).await?;
        self.tools.set_link_up(&lease.name).await?;

        tracing::debug!(tap = %lease.name, bridge = bridge_name, "Tap attached");
        Ok(())
    }

    /// Drop the in-process lease on `name`. The device itself is left for
    /// reclaim on the next allocation.
    pub fn release_tap(&self, name: &str) {
        if self.leases.lock().remove(name) {
            tracing::debug!(tap = name, "Released tap lease");
        }
    }

    pub fn is_leased(&self, name: &str) -> bool {
        self.leases.lock().contains(name)
    }

    /// Allocate and attach a tap for `spec`.
    pub async fn provision(
        &self,
        spec: &VmSpec,
        host: &HostNetwork,
    ) -> FlotillaResult<NetworkAttachment> {
        let lease = self.allocate_tap(&spec.preferred_tap).await?;
        let ip = StaticIpConfig {
            address: spec.guest_ip,
            prefix_len: spec.prefix_len,
            gateway: spec.gateway,
        };
        self.attach_leased(
            lease,
            host.bridge_name.clone(),
            spec.mac_address.clone(),
            Some(ip),
        )
        .await
    }

    /// Move `current` onto a freshly allocated tap.
    ///
    /// The old name stays leased until the new one is attached, so it can
    /// never be handed back. Addressing and MAC carry over.
    pub async fn replace_tap(
        &self,
        current: &NetworkAttachment,
    ) -> FlotillaResult<NetworkAttachment> {
        let lease = self.allocate_tap(&current.tap_name).await?;
        let attachment = self
            .attach_leased(
                lease,
                current.bridge.clone(),
                current.mac.clone(),
                current.ip.clone(),
            )
            .await?;
        self.release_tap(&current.tap_name);

        tracing::info!(
            old_tap = %current.tap_name,
            new_tap = %attachment.tap_name,
            "Replaced busy tap"
        );
        Ok(attachment)
    }

    async fn attach_leased(
        &self,
        lease: TapLease,
        bridge: String,
        mac: String,
        ip: Option<StaticIpConfig>,
    ) -> FlotillaResult<NetworkAttachment> {
        if let Err(e) = self.attach_tap(&lease, &bridge).await {
            self.release_tap(&lease.name);
            return Err(e);
        }

        Ok(NetworkAttachment {
            tap_name: lease.name,
            bridge,
            mac,
            ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_ip_arg() {
        let cfg = StaticIpConfig {
            address: Ipv4Addr::new(172, 16, 0, 10),
            prefix_len: 24,
            gateway: Ipv4Addr::new(172, 16, 0, 1),
        };
        assert_eq!(
            cfg.kernel_ip_arg(),
            "ip=172.16.0.10::172.16.0.1:255.255.255.0::eth0:off"
        );
    }

    #[test]
    fn test_nat_rule_args() {
        let rule = NatRule::new("172.16.0.0/24".parse().unwrap(), "fcbr0");
        assert_eq!(
            rule.rule_args().join(" "),
            "-s 172.16.0.0/24 ! -o fcbr0 -j MASQUERADE"
        );
    }

    #[test]
    fn test_state_starts_empty() {
        let state = HostNetworkState::new();
        assert!(!state.is_initialized());
        assert!(state.get().is_none());
        assert!(!state.clone().is_initialized());
    }
}
