//! Flotilla shared definitions.
//!
//! Error taxonomy and per-VM directory naming used by both the
//! orchestration library and the command-line front end.

pub mod errors;
pub mod layout;

pub use errors::{FlotillaError, FlotillaResult};
