//! Shared data model and configuration for the faultline rule
//! execution engine.
//!
//! Everything persisted or passed between components lives here:
//! rule templates/instances, telemetry samples, insights, commands,
//! execution requests, and actor state.

pub mod config;
pub mod model;

pub use config::Config;
pub use model::*;
