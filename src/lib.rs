//! # Glitch Logger Library
//!
//! Event-triggered telemetry capture for process-control environments.
//!
//! This library samples named scalar and array channels on a fixed cadence,
//! buffers per-tick snapshots in circular rings, watches alarm, transition,
//! and glitch trigger sources, and flushes the window around each trigger to
//! a structured tabular sink with pre/post-trigger tagging and per-capture
//! metadata.

pub mod capture;
pub mod config;
pub mod error;
pub mod provider;
pub mod script;
pub mod sink;
