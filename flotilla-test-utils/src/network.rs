use async_trait::async_trait;
use flotilla::net::{NatRule, NetworkTools};
use flotilla::{FlotillaError, FlotillaResult};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Tap,
}

#[derive(Debug, Default)]
struct State {
    links: BTreeMap<String, LinkKind>,
    addresses: Vec<(String, Ipv4Net)>,
    up: HashSet<String>,
    masters: HashMap<String, String>,
    nat_rules: Vec<NatRule>,
    holders: HashMap<String, Vec<u32>>,
    deleted: Vec<String>,
    calls: HashMap<&'static str, usize>,
    forwarding: bool,
    deny_privileges: bool,
    bridge_failure: Option<String>,
    denied_taps: HashSet<String>,
}

/// In-memory host network.
///
/// Tracks links, addresses, NAT rules and per-device holders, and counts
/// every call so tests can assert idempotence.
#[derive(Debug, Default)]
pub struct FakeNetworkTools {
    state: Mutex<State>,
}

impl FakeNetworkTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a tap device already exists, held open by `holders`.
    pub fn with_tap(self, name: &str, holders: Vec<u32>) -> Self {
        {
            let mut state = self.state.lock();
            state.links.insert(name.to_string(), LinkKind::Tap);
            if !holders.is_empty() {
                state.holders.insert(name.to_string(), holders);
            }
        }
        self
    }

    /// Every host mutation fails as if run without root.
    pub fn deny_privileges(self) -> Self {
        self.state.lock().deny_privileges = true;
        self
    }

    /// Creating the tap `name` fails as if run without root.
    pub fn deny_tap(self, name: &str) -> Self {
        self.state.lock().denied_taps.insert(name.to_string());
        self
    }

    /// Bridge creation fails with `message`.
    pub fn fail_bridge_creation(self, message: &str) -> Self {
        self.state.lock().bridge_failure = Some(message.to_string());
        self
    }

    /// Clear a scripted bridge failure.
    pub fn heal(&self) {
        self.state.lock().bridge_failure = None;
    }

    pub fn set_holders(&self, name: &str, holders: Vec<u32>) {
        self.state.lock().holders.insert(name.to_string(), holders);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    pub fn link_kind(&self, name: &str) -> Option<LinkKind> {
        self.state.lock().links.get(name).copied()
    }

    pub fn master_of(&self, name: &str) -> Option<String> {
        self.state.lock().masters.get(name).cloned()
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.state.lock().up.contains(name)
    }

    pub fn addresses(&self, dev: &str) -> Vec<Ipv4Net> {
        self.state
            .lock()
            .addresses
            .iter()
            .filter(|(d, _)| d == dev)
            .map(|(_, a)| *a)
            .collect()
    }

    pub fn nat_rules(&self) -> Vec<NatRule> {
        self.state.lock().nat_rules.clone()
    }

    /// Links deleted so far, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn forwarding_enabled(&self) -> bool {
        self.state.lock().forwarding
    }

    /// Record the call and fail with `Privilege` when privileges are denied.
    fn enter(&self, operation: &'static str, mutating: bool) -> FlotillaResult<()> {
        let mut state = self.state.lock();
        *state.calls.entry(operation).or_default() += 1;
        if mutating && state.deny_privileges {
            return Err(FlotillaError::Privilege(format!(
                "{}: Operation not permitted",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkTools for FakeNetworkTools {
    async fn link_exists(&self, name: &str) -> FlotillaResult<bool> {
        self.enter("link_exists", false)?;
        Ok(self.state.lock().links.contains_key(name))
    }

    async fn create_bridge(&self, name: &str) -> FlotillaResult<()> {
        self.enter("create_bridge", true)?;
        let mut state = self.state.lock();
        if let Some(message) = &state.bridge_failure {
            return Err(FlotillaError::Network(message.clone()));
        }
        state.links.insert(name.to_string(), LinkKind::Bridge);
        Ok(())
    }

    async fn add_address(&self, dev: &str, addr: &Ipv4Net) -> FlotillaResult<()> {
        self.enter("add_address", true)?;
        let mut state = self.state.lock();
        let entry = (dev.to_string(), *addr);
        if !state.addresses.contains(&entry) {
            state.addresses.push(entry);
        }
        Ok(())
    }

    async fn set_link_up(&self, dev: &str) -> FlotillaResult<()> {
        self.enter("set_link_up", true)?;
        let mut state = self.state.lock();
        if !state.links.contains_key(dev) {
            return Err(FlotillaError::Network(format!("Cannot find device \"{}\"", dev)));
        }
        state.up.insert(dev.to_string());
        Ok(())
    }

    async fn create_tap(&self, name: &str) -> FlotillaResult<()> {
        self.enter("create_tap", true)?;
        let mut state = self.state.lock();
        if state.denied_taps.contains(name) {
            return Err(FlotillaError::Privilege(format!(
                "ip tuntap add {}: Operation not permitted",
                name
            )));
        }
        if state.links.contains_key(name) {
            return Err(FlotillaError::Network(format!(
                "ioctl(TUNSETIFF): Device or resource busy ({})",
                name
            )));
        }
        state.links.insert(name.to_string(), LinkKind::Tap);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> FlotillaResult<()> {
        self.enter("delete_link", true)?;
        let mut state = self.state.lock();
        if state.links.remove(name).is_some() {
            state.deleted.push(name.to_string());
        }
        state.up.remove(name);
        state.masters.remove(name);
        state.holders.remove(name);
        Ok(())
    }

    async fn set_master(&self, dev: &str, bridge: &str) -> FlotillaResult<()> {
        self.enter("set_master", true)?;
        let mut state = self.state.lock();
        if !state.links.contains_key(bridge) {
            return Err(FlotillaError::Network(format!("Cannot find device \"{}\"", bridge)));
        }
        state.masters.insert(dev.to_string(), bridge.to_string());
        Ok(())
    }

    async fn nat_rule_exists(&self, rule: &NatRule) -> FlotillaResult<bool> {
        self.enter("nat_rule_exists", false)?;
        Ok(self.state.lock().nat_rules.contains(rule))
    }

    async fn insert_nat_rule(&self, rule: &NatRule) -> FlotillaResult<()> {
        self.enter("insert_nat_rule", true)?;
        self.state.lock().nat_rules.push(rule.clone());
        Ok(())
    }

    async fn device_holders(&self, name: &str) -> FlotillaResult<Vec<u32>> {
        self.enter("device_holders", false)?;
        Ok(self.state.lock().holders.get(name).cloned().unwrap_or_default())
    }

    async fn enable_forwarding(&self) -> FlotillaResult<()> {
        self.enter("enable_forwarding", true)?;
        self.state.lock().forwarding = true;
        Ok(())
    }
}
