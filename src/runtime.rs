//! Runtime glue that wires configuration, the result sink, telemetry, and
//! runner orchestration.

pub mod config;
pub mod runner;
pub mod sink;
pub mod telemetry;
