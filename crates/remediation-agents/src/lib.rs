//! Remediation agents: the boundary around the orchestration engine.
//!
//! - `config`: application config (tracker, handler endpoint, intake cadence)
//! - `tracker`: ticket sources (HTTP tracker, JSON file)
//! - `remote`: stage executors backed by an HTTP agent service
//! - `simulated`: scripted executors for demos and tests
//! - `intake`: periodic fetch-and-submit loop
//! - `sinks`: event consumers (structured log, tracker status sync)

pub mod config;
pub mod intake;
pub mod remote;
pub mod simulated;
pub mod sinks;
pub mod tracker;
