//! Deterministic simulated provider.
//!
//! Generates a repeatable waveform per channel so the binary can run without
//! a real transport: a slow sine with a per-channel phase derived from the
//! channel name. Channels whose name contains `permit` or `enable` read as a
//! constant 1.0 so they work as gate channels out of the box. Real
//! deployments implement [`TelemetryProvider`] over their own transport.

use std::sync::Arc;

use async_trait::async_trait;

use super::mailbox::AlarmMailbox;
use super::{AlarmSeverity, ArrayReading, ChannelHandle, ScalarReading, TelemetryProvider};
use crate::error::Result;

/// Elements returned for array reads.
const SIM_ARRAY_LEN: usize = 16;

#[derive(Debug)]
struct SimChannel {
    name: String,
    phase: f64,
    step: u64,
}

impl SimChannel {
    fn new(name: &str) -> Self {
        // FNV-1a over the name gives a stable per-channel phase.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Self {
            name: name.to_string(),
            phase: (hash % 628) as f64 / 100.0,
            step: 0,
        }
    }

    fn next_value(&mut self) -> f64 {
        if self.name.contains("permit") || self.name.contains("enable") {
            return 1.0;
        }
        let t = self.step as f64;
        self.step += 1;
        (t / 50.0 * std::f64::consts::TAU + self.phase).sin()
    }
}

/// Simulated telemetry provider with deterministic per-channel waveforms.
#[derive(Debug, Default)]
pub struct SimProvider {
    channels: Vec<SimChannel>,
}

impl SimProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryProvider for SimProvider {
    async fn connect(&mut self, name: &str) -> Result<ChannelHandle> {
        if let Some(idx) = self.channels.iter().position(|c| c.name == name) {
            return Ok(ChannelHandle(idx));
        }
        self.channels.push(SimChannel::new(name));
        Ok(ChannelHandle(self.channels.len() - 1))
    }

    fn is_connected(&self, handle: ChannelHandle) -> bool {
        handle.0 < self.channels.len()
    }

    async fn read_scalar(&mut self, handle: ChannelHandle) -> Result<ScalarReading> {
        let Some(channel) = self.channels.get_mut(handle.0) else {
            return Ok(ScalarReading::disconnected());
        };
        Ok(ScalarReading {
            value: channel.next_value(),
            severity: AlarmSeverity::None,
            connected: true,
        })
    }

    async fn read_array(&mut self, handle: ChannelHandle) -> Result<ArrayReading> {
        let Some(channel) = self.channels.get_mut(handle.0) else {
            return Ok(ArrayReading::disconnected());
        };
        let base = channel.next_value();
        let values = (0..SIM_ARRAY_LEN)
            .map(|i| base + i as f64 * 0.01)
            .collect();
        Ok(ArrayReading {
            values,
            connected: true,
        })
    }

    fn subscribe_alarm(&mut self, _handle: ChannelHandle, _mailbox: Arc<AlarmMailbox>) -> Result<()> {
        // The simulation never raises alarms; the subscription is accepted
        // and simply stays quiet.
        Ok(())
    }
}
