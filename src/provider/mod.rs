//! # Telemetry Provider Module
//!
//! Trait abstraction over the external telemetry transport.
//!
//! The capture engine never talks to a transport directly; it consumes this
//! interface: connect a channel by name, check connection state, read scalar
//! or array values with alarm severity attached, and optionally subscribe to
//! asynchronous alarm updates through a single-slot mailbox.
//!
//! A disconnected channel is not an error at this layer: reads report
//! `connected: false` and a defaulted value, and the sampling loop records
//! the failure in the snapshot's error counter instead of aborting the tick.

pub mod mailbox;
pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use mailbox::AlarmMailbox;

/// Alarm severity attached to a channel reading.
///
/// Ordered by badness; `None` means the channel is in its normal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    #[default]
    None,
    Minor,
    Major,
    Invalid,
}

impl AlarmSeverity {
    /// Stable numeric encoding used by the alarm mailbox.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            AlarmSeverity::None => 0,
            AlarmSeverity::Minor => 1,
            AlarmSeverity::Major => 2,
            AlarmSeverity::Invalid => 3,
        }
    }

    /// Inverse of [`AlarmSeverity::as_u8`]. Unknown values decode as `Invalid`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => AlarmSeverity::None,
            1 => AlarmSeverity::Minor,
            2 => AlarmSeverity::Major,
            _ => AlarmSeverity::Invalid,
        }
    }

    /// Severity name as written to page parameters.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AlarmSeverity::None => "none",
            AlarmSeverity::Minor => "minor",
            AlarmSeverity::Major => "major",
            AlarmSeverity::Invalid => "invalid",
        }
    }
}

/// Opaque provider-issued channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub usize);

/// One scalar read: value, alarm severity, connection state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarReading {
    pub value: f64,
    pub severity: AlarmSeverity,
    pub connected: bool,
}

impl ScalarReading {
    /// Reading reported for an unreachable channel: zero value, invalid
    /// severity, disconnected.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            value: 0.0,
            severity: AlarmSeverity::Invalid,
            connected: false,
        }
    }
}

/// One array read.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayReading {
    pub values: Vec<f64>,
    pub connected: bool,
}

impl ArrayReading {
    /// Reading reported for an unreachable channel: empty, disconnected.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            values: Vec::new(),
            connected: false,
        }
    }
}

/// Trait for the external telemetry transport.
///
/// Implementations must be cheap to poll once per channel per tick. Reads
/// on disconnected channels return defaulted readings rather than errors;
/// `Err` is reserved for hard transport faults.
#[async_trait]
pub trait TelemetryProvider: Send {
    /// Resolve a channel name to a handle, initiating the connection.
    async fn connect(&mut self, name: &str) -> Result<ChannelHandle>;

    /// Current connection state of a channel.
    fn is_connected(&self, handle: ChannelHandle) -> bool;

    /// Read a scalar value with its alarm severity.
    async fn read_scalar(&mut self, handle: ChannelHandle) -> Result<ScalarReading>;

    /// Read an array value.
    async fn read_array(&mut self, handle: ChannelHandle) -> Result<ArrayReading>;

    /// Subscribe to asynchronous alarm updates for a channel.
    ///
    /// The provider must only ever call [`AlarmMailbox::post`] on the given
    /// mailbox; all structural state stays on the sampling loop's thread.
    fn subscribe_alarm(&mut self, handle: ChannelHandle, mailbox: Arc<AlarmMailbox>) -> Result<()>;
}
