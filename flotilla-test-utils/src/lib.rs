//! In-memory stand-ins for flotilla's host collaborators.
//!
//! Integration tests drive the real controller, provisioners and
//! supervisor against these fakes, so no root, bridge or Firecracker
//! binary is needed.

pub mod fixtures;
pub mod network;
pub mod probe;
pub mod runtime;

pub use fixtures::TestEnv;
pub use network::{FakeNetworkTools, LinkKind};
pub use probe::FakeHostProbe;
pub use runtime::{FakeVmRuntime, StartBehavior};
