//! # Capture Engine Module
//!
//! The event-triggered circular-buffer capture engine.
//!
//! This module handles:
//! - Rolling baseline tracking for glitch detection
//! - Trigger evaluation (alarm edges, threshold crossings, glitches)
//! - Fixed-depth snapshot rings holding pre-trigger history
//! - The per-dataset capture state machine (arm, fire, count down, flush)

pub mod baseline;
pub mod controller;
pub mod ring;
pub mod trigger;
