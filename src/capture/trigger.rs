//! # Trigger Evaluator Module
//!
//! The three trigger source variants watched by a dataset:
//!
//! - **Alarm**: fires on a severity edge *into* an enabled severity, never on
//!   merely being in it. Re-arms immediately after every evaluation. May be
//!   fed by an async subscription mailbox instead of the polled severity.
//! - **Transition**: fires once per qualifying threshold crossing between two
//!   consecutive samples; stays disarmed until the value re-crosses the
//!   threshold in the opposite sense, unless auto-rearm is configured.
//! - **Glitch**: fires when the sample deviates from the rolling baseline by
//!   more than the configured threshold; disarms until the capture controller
//!   rearms it after the flush.
//!
//! Evaluators only mutate their own state; the dataset-level servicing guard
//! and holdoff bookkeeping live in the capture controller. Holdoff is still
//! enforced here: a source whose holdoff window is open updates its state but
//! never reports a fire.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::baseline::BaselineTracker;
use crate::provider::mailbox::AlarmMailbox;
use crate::provider::AlarmSeverity;

/// Threshold crossing direction for transition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rising,
    Falling,
    #[default]
    Disabled,
}

/// Which trigger variant fired, for page metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Alarm,
    Transition,
    Glitch,
}

impl TriggerKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TriggerKind::Alarm => "alarm",
            TriggerKind::Transition => "transition",
            TriggerKind::Glitch => "glitch",
        }
    }
}

/// One tick's observation of a trigger source's channel.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput {
    pub value: f64,
    pub severity: AlarmSeverity,
    pub connected: bool,
}

/// Record of one source firing within a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub kind: TriggerKind,
    pub channel: String,
    /// Severity the alarm edge landed on; `None` for other kinds.
    pub severity: Option<AlarmSeverity>,
    pub script: Option<String>,
}

#[derive(Debug)]
enum SourceState {
    Alarm {
        severities: Vec<AlarmSeverity>,
        subscribe: bool,
        mailbox: Option<Arc<AlarmMailbox>>,
        last: AlarmSeverity,
    },
    Transition {
        level: f64,
        direction: Direction,
        auto_rearm: bool,
        prev: Option<f64>,
    },
    Glitch {
        tracker: BaselineTracker,
    },
}

/// A trigger source with its mutable arming and holdoff state.
///
/// Owned by exactly one output dataset.
#[derive(Debug)]
pub struct TriggerSource {
    channel: String,
    script: Option<String>,
    holdoff: Duration,
    holdoff_until: Option<Duration>,
    armed: bool,
    state: SourceState,
}

impl TriggerSource {
    /// Alarm-edge source over the given enabled severity set.
    #[must_use]
    pub fn alarm(
        channel: impl Into<String>,
        severities: Vec<AlarmSeverity>,
        subscribe: bool,
        holdoff: Duration,
        script: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            script,
            holdoff,
            holdoff_until: None,
            armed: true,
            state: SourceState::Alarm {
                severities,
                subscribe,
                mailbox: None,
                last: AlarmSeverity::None,
            },
        }
    }

    /// Threshold-crossing source.
    #[must_use]
    pub fn transition(
        channel: impl Into<String>,
        level: f64,
        direction: Direction,
        auto_rearm: bool,
        holdoff: Duration,
        script: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            script,
            holdoff,
            holdoff_until: None,
            armed: true,
            state: SourceState::Transition {
                level,
                direction,
                auto_rearm,
                prev: None,
            },
        }
    }

    /// Baseline-deviation source.
    #[must_use]
    pub fn glitch(
        channel: impl Into<String>,
        threshold: f64,
        baseline_samples: usize,
        auto_reset: bool,
        holdoff: Duration,
        script: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            script,
            holdoff,
            holdoff_until: None,
            armed: true,
            state: SourceState::Glitch {
                tracker: BaselineTracker::new(threshold, baseline_samples, auto_reset),
            },
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn kind(&self) -> TriggerKind {
        match self.state {
            SourceState::Alarm { .. } => TriggerKind::Alarm,
            SourceState::Transition { .. } => TriggerKind::Transition,
            SourceState::Glitch { .. } => TriggerKind::Glitch,
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Whether this source wants an async alarm subscription and has no
    /// mailbox attached yet.
    #[must_use]
    pub fn needs_subscription(&self) -> bool {
        matches!(
            self.state,
            SourceState::Alarm {
                subscribe: true,
                mailbox: None,
                ..
            }
        )
    }

    /// Attach the subscription mailbox drained by evaluation.
    pub fn attach_mailbox(&mut self, mailbox: Arc<AlarmMailbox>) {
        if let SourceState::Alarm { mailbox: slot, .. } = &mut self.state {
            *slot = Some(mailbox);
        }
    }

    /// Opens the holdoff window after a flush.
    pub fn begin_holdoff(&mut self, now: Duration) {
        if !self.holdoff.is_zero() {
            self.holdoff_until = Some(now + self.holdoff);
        }
    }

    /// Rearm after a flush. Only glitch sources disarm for the duration of a
    /// capture; transitions rearm through their own re-cross rule and alarms
    /// never stay disarmed.
    pub fn rearm_after_flush(&mut self) {
        if matches!(self.state, SourceState::Glitch { .. }) {
            self.armed = true;
        }
    }

    fn in_holdoff(&self, now: Duration) -> bool {
        self.holdoff_until.is_some_and(|until| now < until)
    }

    /// Evaluate this source against the tick's observation.
    ///
    /// Returns the firing record if the source fired. State (previous value,
    /// baseline, last severity) is updated even when the fire is suppressed
    /// by holdoff. Transition and glitch sources skip disconnected readings
    /// entirely so defaulted zero values never pollute their state.
    pub fn evaluate(&mut self, input: &TriggerInput, now: Duration) -> Option<Firing> {
        let suppressed = self.in_holdoff(now);

        match &mut self.state {
            SourceState::Alarm {
                severities,
                subscribe,
                mailbox,
                last,
            } => {
                let observed = if *subscribe {
                    // Pending flag set by the callback thread, consumed here
                    // on the sampling loop. No update means no evaluation.
                    mailbox.as_ref().and_then(|m| m.take())?
                } else {
                    input.severity
                };

                let edge = observed != *last && severities.contains(&observed);
                *last = observed;

                if edge && !suppressed {
                    Some(Firing {
                        kind: TriggerKind::Alarm,
                        channel: self.channel.clone(),
                        severity: Some(observed),
                        script: self.script.clone(),
                    })
                } else {
                    None
                }
            }

            SourceState::Transition {
                level,
                direction,
                auto_rearm,
                prev,
            } => {
                if *direction == Direction::Disabled {
                    return None;
                }
                if !input.connected {
                    return None;
                }

                if *auto_rearm {
                    self.armed = true;
                }

                let current = input.value;
                let previous = prev.replace(current);
                let previous = previous?;

                if !self.armed {
                    let recrossed = match direction {
                        Direction::Rising => current <= *level,
                        Direction::Falling => current >= *level,
                        Direction::Disabled => false,
                    };
                    if recrossed {
                        self.armed = true;
                    }
                    return None;
                }

                let crossed = match direction {
                    Direction::Rising => previous <= *level && *level < current,
                    Direction::Falling => previous >= *level && *level > current,
                    Direction::Disabled => false,
                };

                if crossed && !suppressed {
                    self.armed = false;
                    Some(Firing {
                        kind: TriggerKind::Transition,
                        channel: self.channel.clone(),
                        severity: None,
                        script: self.script.clone(),
                    })
                } else {
                    None
                }
            }

            SourceState::Glitch { tracker } => {
                if !input.connected {
                    return None;
                }

                let value = input.value;

                if !self.armed {
                    // Unserviced glitch window: hold (or auto-reset) the baseline.
                    tracker.update(value, true);
                    return None;
                }

                let glitched = tracker.exceeds(value);
                if glitched && suppressed {
                    tracker.update(value, false);
                    return None;
                }

                tracker.update(value, glitched);
                if glitched {
                    self.armed = false;
                    Some(Firing {
                        kind: TriggerKind::Glitch,
                        channel: self.channel.clone(),
                        severity: None,
                        script: self.script.clone(),
                    })
                } else {
                    None
                }
            }
        }
    }
}
