//! Flotilla provisions and supervises a fleet of microVMs on one host.
//!
//! A fleet pass runs every VM through the same pipeline:
//!
//! ```text
//! preflight ──→ storage ──→ network ──→ supervisor ──→ Running
//!     │            │           │            │
//!     └────────────┴───────────┴────────────┴──→ Failed (that VM only)
//! ```
//!
//! Host bridge and NAT setup happen once per process before the first VM.
//! Failures are collected per VM in a [`FleetOutcome`]; they never stop the
//! remaining fleet members from being attempted.

pub mod fleet;
pub mod metrics;
pub mod net;
pub mod preflight;
pub mod runtime;
pub mod storage;
pub mod supervisor;
pub mod util;
pub mod vmm;

pub use fleet::{
    FleetController, FleetControllerBuilder, FleetOutcome, FleetSummary, Stage, VmFailure, VmOutcome,
};
pub use metrics::FleetMetrics;
pub use runtime::layout::FilesystemLayout;
pub use runtime::lock::RuntimeLock;
pub use runtime::options::{FleetConfig, FlotillaOptions};
pub use runtime::types::VmSpec;
pub use supervisor::{RunningVm, VmStatus};
pub use util::init_logging_for;

pub use flotilla_shared::{FlotillaError, FlotillaResult};
