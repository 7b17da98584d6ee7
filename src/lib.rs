//! Hardware telemetry, health verdicts and stress diagnostics.

pub mod collectors;
pub mod config;
pub mod session;
pub mod snapshot;
pub mod stress;
pub mod verdict;
