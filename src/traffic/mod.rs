//! # Traffic Management Module
//!
//! Lifecycle control for in-flight traffic: draining on shutdown, in-flight
//! tracking and the force-close signal.

pub mod shutdown;

pub use shutdown::{DrainController, DrainOutcome, RequestGuard};
