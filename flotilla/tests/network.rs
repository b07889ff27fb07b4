//! Integration tests for host network setup and tap allocation.

use flotilla::FlotillaError;
use flotilla::net::{HostNetworkState, NetworkProvisioner};
use flotilla_test_utils::{FakeNetworkTools, LinkKind, TestEnv};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// TEST FIXTURES
// ============================================================================

fn bridge_cidr() -> Ipv4Net {
    "172.16.0.1/24".parse().unwrap()
}

fn nat_subnet() -> Ipv4Net {
    "172.16.0.0/24".parse().unwrap()
}

async fn ensure(
    provisioner: &NetworkProvisioner,
    state: &HostNetworkState,
) -> Result<flotilla::net::HostNetwork, FlotillaError> {
    provisioner
        .ensure_host_network(state, "fcbr0", bridge_cidr(), nat_subnet())
        .await
}

// ============================================================================
// HOST NETWORK
// ============================================================================

#[tokio::test]
async fn ensure_host_network_is_idempotent() {
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = NetworkProvisioner::new(tools.clone());
    let state = HostNetworkState::new();

    let first = ensure(&provisioner, &state).await.unwrap();
    let second = ensure(&provisioner, &state).await.unwrap();
    let third = ensure(&provisioner, &state).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(tools.calls("create_bridge"), 1);
    assert_eq!(tools.calls("insert_nat_rule"), 1);
    assert_eq!(tools.nat_rules().len(), 1);
    assert_eq!(tools.addresses("fcbr0"), vec![bridge_cidr()]);
    assert!(tools.is_up("fcbr0"));
    assert!(tools.forwarding_enabled());
}

#[tokio::test]
async fn concurrent_callers_share_one_setup() {
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = NetworkProvisioner::new(tools.clone());
    let state = HostNetworkState::new();

    let (a, b) = tokio::join!(ensure(&provisioner, &state), ensure(&provisioner, &state));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(tools.calls("link_exists"), 1);
    assert_eq!(tools.calls("create_bridge"), 1);
}

#[tokio::test]
async fn existing_host_state_is_not_duplicated() {
    // A fresh state handle simulates a new orchestrator process on the same host
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = NetworkProvisioner::new(tools.clone());

    ensure(&provisioner, &HostNetworkState::new()).await.unwrap();
    ensure(&provisioner, &HostNetworkState::new()).await.unwrap();

    assert_eq!(tools.calls("create_bridge"), 1);
    assert_eq!(tools.calls("insert_nat_rule"), 1);
    assert_eq!(tools.nat_rules().len(), 1);
    assert_eq!(tools.addresses("fcbr0").len(), 1);
}

#[tokio::test]
async fn failed_setup_is_host_state_error_and_retryable() {
    let tools = Arc::new(FakeNetworkTools::new().fail_bridge_creation("RTNETLINK answers: No buffer space"));
    let provisioner = NetworkProvisioner::new(tools.clone());
    let state = HostNetworkState::new();

    let err = ensure(&provisioner, &state).await.unwrap_err();
    assert!(matches!(err, FlotillaError::HostState(_)), "got {err:?}");
    assert!(err.is_fatal_to_process());
    assert!(!state.is_initialized());

    tools.heal();
    ensure(&provisioner, &state).await.unwrap();
    assert!(state.is_initialized());
}

#[tokio::test]
async fn missing_privileges_surface_as_privilege_error() {
    let tools = Arc::new(FakeNetworkTools::new().deny_privileges());
    let provisioner = NetworkProvisioner::new(tools);

    let err = ensure(&provisioner, &HostNetworkState::new()).await.unwrap_err();
    assert!(matches!(err, FlotillaError::Privilege(_)), "got {err:?}");
}

// ============================================================================
// TAP ALLOCATION
// ============================================================================

#[tokio::test]
async fn stale_tap_is_reclaimed() {
    let tools = Arc::new(FakeNetworkTools::new().with_tap("fctap0", vec![]));
    let provisioner = NetworkProvisioner::new(tools.clone());

    let lease = provisioner.allocate_tap("fctap0").await.unwrap();

    assert_eq!(lease.name, "fctap0");
    assert!(lease.reclaimed);
    assert_eq!(tools.deleted(), vec!["fctap0".to_string()]);
}

#[tokio::test]
async fn held_tap_is_skipped() {
    let tools = Arc::new(FakeNetworkTools::new().with_tap("fctap0", vec![4242]));
    let provisioner = NetworkProvisioner::new(tools.clone());

    let lease = provisioner.allocate_tap("fctap0").await.unwrap();

    assert_eq!(lease.name, "fctap1");
    assert!(!lease.reclaimed);
    // The busy device is left alone
    assert!(tools.has_link("fctap0"));
    assert!(tools.deleted().is_empty());
}

#[tokio::test]
async fn leased_tap_is_skipped_until_released() {
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = NetworkProvisioner::new(tools);

    let first = provisioner.allocate_tap("fctap0").await.unwrap();
    let second = provisioner.allocate_tap("fctap0").await.unwrap();
    assert_eq!(first.name, "fctap0");
    assert_eq!(second.name, "fctap1");

    provisioner.release_tap("fctap0");
    let third = provisioner.allocate_tap("fctap0").await.unwrap();
    assert_eq!(third.name, "fctap0");
}

#[tokio::test]
async fn concurrent_allocations_get_unique_names() {
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = Arc::new(NetworkProvisioner::new(tools));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let provisioner = Arc::clone(&provisioner);
            tokio::spawn(async move { provisioner.allocate_tap("fctap0").await })
        })
        .collect();

    let mut names = HashSet::new();
    for task in tasks {
        let lease = task.await.unwrap().unwrap();
        assert!(names.insert(lease.name), "duplicate tap name handed out");
    }
    assert_eq!(names.len(), 16);
}

#[tokio::test]
async fn provision_attaches_tap_to_bridge() {
    let env = TestEnv::new();
    let spec = env.config(1).vm_specs().unwrap().remove(0);
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = NetworkProvisioner::new(tools.clone());
    let host = ensure(&provisioner, &HostNetworkState::new()).await.unwrap();

    let attachment = provisioner.provision(&spec, &host).await.unwrap();

    assert_eq!(attachment.tap_name, spec.preferred_tap);
    assert_eq!(attachment.mac, spec.mac_address);
    let ip = attachment.ip.as_ref().unwrap();
    assert_eq!(ip.address, spec.guest_ip);
    assert_eq!(ip.gateway, host.gateway());
    assert_eq!(tools.link_kind(&attachment.tap_name), Some(LinkKind::Tap));
    assert_eq!(tools.master_of(&attachment.tap_name).as_deref(), Some("fcbr0"));
    assert!(tools.is_up(&attachment.tap_name));
    assert!(provisioner.is_leased(&attachment.tap_name));
}

#[tokio::test]
async fn replace_tap_moves_to_new_name_and_releases_old() {
    let env = TestEnv::new();
    let spec = env.config(1).vm_specs().unwrap().remove(0);
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = NetworkProvisioner::new(tools.clone());
    let host = ensure(&provisioner, &HostNetworkState::new()).await.unwrap();
    let original = provisioner.provision(&spec, &host).await.unwrap();

    let replacement = provisioner.replace_tap(&original).await.unwrap();

    assert_ne!(replacement.tap_name, original.tap_name);
    assert_eq!(replacement.mac, original.mac);
    assert_eq!(replacement.ip, original.ip);
    assert!(provisioner.is_leased(&replacement.tap_name));
    assert!(!provisioner.is_leased(&original.tap_name));
}

#[tokio::test]
async fn attach_failure_releases_lease() {
    let env = TestEnv::new();
    let spec = env.config(1).vm_specs().unwrap().remove(0);
    let tools = Arc::new(FakeNetworkTools::new());
    let provisioner = NetworkProvisioner::new(tools.clone());

    // No bridge was set up, so joining it fails
    let host = flotilla::net::HostNetwork {
        bridge_name: "missing0".into(),
        bridge_cidr: bridge_cidr(),
        nat_rule: flotilla::net::NatRule::new(nat_subnet(), "missing0"),
    };
    let err = provisioner.provision(&spec, &host).await.unwrap_err();

    assert!(matches!(err, FlotillaError::Network(_)));
    assert!(!provisioner.is_leased(&spec.preferred_tap));
}
