//! VM lifecycle supervision: bounded create/start, one busy-device retry,
//! detached exit tracking.

mod spawn;
mod state;

pub use spawn::{RunningVm, VmSupervisor};
pub use state::{MAX_START_RETRIES, VmState, VmStatus};
