//! Fleet-wide counters.
//!
//! All counters are monotonic. [`FleetMetricsStorage`] is shared by the
//! controller and supervisor; [`FleetMetrics`] is the read-only handle
//! callers query.

mod fleet_metrics;

pub use fleet_metrics::{FleetMetrics, FleetMetricsStorage};
