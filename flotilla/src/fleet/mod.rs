//! Fleet orchestration: one pass over the desired VMs, failures isolated per VM.

mod controller;
mod outcome;

pub use controller::{FleetController, FleetControllerBuilder};
pub use outcome::{FleetOutcome, FleetSummary, Stage, VmFailure, VmOutcome};
