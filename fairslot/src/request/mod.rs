//! Allocation requests and their lifecycle.

pub mod transitions;
pub mod types;

pub use types::*;
