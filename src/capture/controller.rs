//! # Capture Controller Module
//!
//! The per-dataset capture state machine and the sampling loop's tick body.
//!
//! Each output dataset owns its ring, its trigger sources, and its sink page,
//! and moves through `Idle -> Capturing -> Flushing -> Idle` independently of
//! every other dataset. A tick reads every referenced channel once, stores a
//! snapshot in each ring, and advances each state machine:
//!
//! - `Idle`: evaluate the dataset's sources; the first firing provides the
//!   page's primary trigger metadata, every firing in the tick is recorded.
//! - `Capturing`: count down the post-trigger samples. New fires are ignored
//!   while a capture is in service.
//! - `Flushing`: one-shot; hand the chronological window around the trigger
//!   to the sink, run the attached scripts after the page write, open the
//!   holdoff windows, rearm, and return to `Idle`.
//!
//! Read failures never abort a tick: they become defaulted values and error
//! counts in the snapshot. Sink write failures are fatal and propagate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::ring::{SampleRing, Snapshot};
use super::trigger::{Firing, TriggerInput, TriggerSource};
use crate::config::{ChannelKindConfig, Config, TriggerConfig};
use crate::error::{GlitchLoggerError, Result};
use crate::provider::mailbox::AlarmMailbox;
use crate::provider::{ArrayReading, ChannelHandle, ScalarReading, TelemetryProvider};
use crate::script::ScriptDispatcher;
use crate::sink::{
    resolve_layout, ArrayLayout, ColumnKind, ColumnSpec, ColumnValue, PageSchema, TabularSink,
};

/// Fixed leading columns written before the channel columns in every page.
const META_COLUMNS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Idle,
    Capturing { points_left: usize },
    Flushing,
}

/// One logged channel resolved against the provider.
struct LoggedChannel {
    /// Column base name: the readback alias when configured, else the
    /// channel name.
    column: String,
    handle: ChannelHandle,
    kind: ChannelKindConfig,
    elements: usize,
    scale: f64,
    units: Option<String>,
}

/// Metadata of the capture currently in service.
struct PendingCapture {
    step: u64,
    time: DateTime<Utc>,
    firings: Vec<Firing>,
}

struct Dataset {
    name: String,
    before: usize,
    after: usize,
    channels: Vec<LoggedChannel>,
    /// Evaluated in order: alarms, then transitions, then glitches.
    sources: Vec<TriggerSource>,
    /// Provider handles parallel to `sources`.
    source_handles: Vec<ChannelHandle>,
    layout: ArrayLayout,
    ring: SampleRing,
    sink: Box<dyn TabularSink + Send>,
    state: CaptureState,
    pending: Option<PendingCapture>,
}

impl Dataset {
    /// Discard the capture in service, including the buffered window,
    /// without writing anything.
    fn abort(&mut self) {
        self.pending = None;
        self.state = CaptureState::Idle;
        self.ring.clear();
        for source in &mut self.sources {
            source.rearm_after_flush();
        }
    }

    /// One-shot flush of the windowed region around the trigger.
    ///
    /// Calling this with no capture in service writes nothing. On success
    /// the dataset is back in `Idle` with holdoff windows open and all
    /// sources rearmed.
    async fn flush(&mut self, dispatcher: &ScriptDispatcher, now: Duration) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            self.state = CaptureState::Idle;
            return Ok(());
        };

        let latest_step = match self.ring.latest() {
            Some(snapshot) => snapshot.step,
            None => {
                self.state = CaptureState::Idle;
                return Ok(());
            }
        };

        // Post-trigger rows actually buffered; fewer than `after` when the
        // run ends mid-capture.
        let post = (latest_step - pending.step) as usize;
        let pre = self.before.min(self.ring.len().saturating_sub(1 + post));
        let window = self.ring.window_last(pre + 1 + post);

        self.sink.start_page(window.len());
        for (row, snapshot) in window.iter().enumerate() {
            let values = row_values(&self.channels, self.layout, snapshot, pending.step);
            self.sink.set_row(row, values)?;
        }
        set_trigger_parameters(self.sink.as_mut(), &pending);
        self.sink.write_page().await?;

        info!(
            "Dataset '{}': wrote page of {} rows for trigger at step {}",
            self.name,
            window.len(),
            pending.step
        );

        dispatcher.dispatch(&pending.firings).await;

        for source in &mut self.sources {
            source.begin_holdoff(now);
            source.rearm_after_flush();
        }
        self.state = CaptureState::Idle;
        Ok(())
    }
}

/// Build the cells of one page row in schema column order.
fn row_values(
    channels: &[LoggedChannel],
    layout: ArrayLayout,
    snapshot: &Snapshot,
    trigger_step: u64,
) -> Vec<ColumnValue> {
    let mut values = Vec::with_capacity(META_COLUMNS + channels.len());
    values.push(ColumnValue::I64(snapshot.step as i64));
    values.push(ColumnValue::Str(snapshot.time.to_rfc3339()));
    values.push(ColumnValue::F64(snapshot.time_of_day));
    values.push(ColumnValue::I64(i64::from(snapshot.day_of_month)));
    values.push(ColumnValue::Bool(snapshot.step > trigger_step));
    values.push(ColumnValue::I64(i64::from(snapshot.errors)));

    for (idx, channel) in channels.iter().enumerate() {
        let samples = &snapshot.values[idx];
        match (channel.kind, layout) {
            (ChannelKindConfig::Scalar, _) => {
                values.push(ColumnValue::F64(samples.first().copied().unwrap_or(0.0)));
            }
            (ChannelKindConfig::Array, ArrayLayout::Columns) => {
                // Short reads (disconnects) pad with zeros so the row shape
                // always matches the schema.
                for element in 0..channel.elements {
                    values.push(ColumnValue::F64(
                        samples.get(element).copied().unwrap_or(0.0),
                    ));
                }
            }
            (ChannelKindConfig::Array, _) => {
                values.push(ColumnValue::F64Array(samples.clone()));
            }
        }
    }
    values
}

/// Per-page trigger metadata, written once per flush.
fn set_trigger_parameters(sink: &mut (dyn TabularSink + Send), pending: &PendingCapture) {
    // First firing in evaluation order is the primary trigger.
    let primary = &pending.firings[0];

    sink.set_parameter(
        "trigger_kind",
        ColumnValue::Str(primary.kind.name().to_string()),
    );
    sink.set_parameter(
        "trigger_channel",
        ColumnValue::Str(primary.channel.clone()),
    );
    if let Some(severity) = primary.severity {
        sink.set_parameter(
            "trigger_severity",
            ColumnValue::Str(severity.name().to_string()),
        );
    }
    sink.set_parameter("trigger_step", ColumnValue::I64(pending.step as i64));
    sink.set_parameter("trigger_time", ColumnValue::Str(pending.time.to_rfc3339()));

    let fired = pending
        .firings
        .iter()
        .map(|f| format!("{}:{}", f.kind.name(), f.channel))
        .collect::<Vec<_>>()
        .join(",");
    sink.set_parameter("fired_sources", ColumnValue::Str(fired));
}

fn build_schema(name: &str, channels: &[LoggedChannel], layout: ArrayLayout) -> PageSchema {
    let mut columns = Vec::with_capacity(META_COLUMNS + channels.len());
    columns.push(ColumnSpec::new("step", ColumnKind::I64));
    columns.push(ColumnSpec::new("time", ColumnKind::Str));
    columns.push(ColumnSpec::new("time_of_day", ColumnKind::F64).with_units(Some("h".to_string())));
    columns.push(ColumnSpec::new("day_of_month", ColumnKind::I64));
    columns.push(ColumnSpec::new("post_trigger", ColumnKind::Bool));
    columns.push(ColumnSpec::new("errors", ColumnKind::I64));

    for channel in channels {
        match (channel.kind, layout) {
            (ChannelKindConfig::Scalar, _) => {
                columns.push(
                    ColumnSpec::new(channel.column.clone(), ColumnKind::F64)
                        .with_units(channel.units.clone()),
                );
            }
            (ChannelKindConfig::Array, ArrayLayout::Columns) => {
                for element in 0..channel.elements {
                    columns.push(
                        ColumnSpec::new(format!("{}[{}]", channel.column, element), ColumnKind::F64)
                            .with_units(channel.units.clone()),
                    );
                }
            }
            (ChannelKindConfig::Array, _) => {
                columns.push(
                    ColumnSpec::new(channel.column.clone(), ColumnKind::F64Array)
                        .with_units(channel.units.clone()),
                );
            }
        }
    }

    PageSchema {
        dataset: name.to_string(),
        columns,
    }
}

/// Alarm sources first, then transitions, then glitches.
fn ordered_triggers(triggers: &[TriggerConfig]) -> Vec<&TriggerConfig> {
    let mut ordered = Vec::with_capacity(triggers.len());
    ordered.extend(triggers.iter().filter(|t| matches!(t, TriggerConfig::Alarm { .. })));
    ordered.extend(triggers.iter().filter(|t| matches!(t, TriggerConfig::Transition { .. })));
    ordered.extend(triggers.iter().filter(|t| matches!(t, TriggerConfig::Glitch { .. })));
    ordered
}

async fn connect<P: TelemetryProvider>(
    provider: &mut P,
    cache: &mut HashMap<String, ChannelHandle>,
    name: &str,
) -> Result<ChannelHandle> {
    if let Some(&handle) = cache.get(name) {
        return Ok(handle);
    }
    let handle = provider.connect(name).await?;
    cache.insert(name.to_string(), handle);
    Ok(handle)
}

/// Outcome of one bounded channel read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStatus {
    Ok,
    /// Channel unreachable: recorded in the snapshot's error count, never
    /// fatal no matter how long it lasts.
    Disconnected,
    /// Deadline miss or hard transport fault: recorded in the snapshot and
    /// counted against the error budget.
    Failed,
}

impl ReadStatus {
    fn is_error(self) -> bool {
        self != ReadStatus::Ok
    }

    fn counts_against_budget(self) -> bool {
        self == ReadStatus::Failed
    }
}

/// One cached read with its status.
type CachedScalar = (ScalarReading, ReadStatus);
type CachedArray = (ArrayReading, ReadStatus);

async fn bounded_scalar<P: TelemetryProvider>(
    provider: &mut P,
    deadline: Duration,
    handle: ChannelHandle,
) -> CachedScalar {
    match tokio::time::timeout(deadline, provider.read_scalar(handle)).await {
        Ok(Ok(reading)) => {
            let status = if reading.connected {
                ReadStatus::Ok
            } else {
                ReadStatus::Disconnected
            };
            (reading, status)
        }
        Ok(Err(e)) => {
            debug!("Scalar read failed: {}", e);
            (ScalarReading::disconnected(), ReadStatus::Failed)
        }
        Err(_) => {
            debug!(
                "{}",
                GlitchLoggerError::Timeout(format!("scalar read exceeded {:?}", deadline))
            );
            (ScalarReading::disconnected(), ReadStatus::Failed)
        }
    }
}

async fn bounded_array<P: TelemetryProvider>(
    provider: &mut P,
    deadline: Duration,
    handle: ChannelHandle,
) -> CachedArray {
    match tokio::time::timeout(deadline, provider.read_array(handle)).await {
        Ok(Ok(reading)) => {
            let status = if reading.connected {
                ReadStatus::Ok
            } else {
                ReadStatus::Disconnected
            };
            (reading, status)
        }
        Ok(Err(e)) => {
            debug!("Array read failed: {}", e);
            (ArrayReading::disconnected(), ReadStatus::Failed)
        }
        Err(_) => {
            debug!(
                "{}",
                GlitchLoggerError::Timeout(format!("array read exceeded {:?}", deadline))
            );
            (ArrayReading::disconnected(), ReadStatus::Failed)
        }
    }
}

struct GateState {
    handle: ChannelHandle,
    touch_on_abort: bool,
    /// Last observed gate state, for edge logging.
    open: bool,
}

/// Drives every dataset's capture state machine from the sampling loop.
///
/// `tick` takes the logical elapsed time since the run started, so holdoff
/// arithmetic is deterministic under test.
pub struct CaptureController<P: TelemetryProvider> {
    provider: P,
    interval: Duration,
    io_timeout: Duration,
    error_budget: u64,
    errors_seen: u64,
    gate: Option<GateState>,
    datasets: Vec<Dataset>,
    dispatcher: ScriptDispatcher,
    step: u64,
}

impl<P: TelemetryProvider> CaptureController<P> {
    /// Connect every referenced channel, wire the alarm subscriptions,
    /// resolve each dataset's array layout, and open its sink.
    ///
    /// `sinks` must hold one sink per configured dataset, in order.
    ///
    /// # Errors
    ///
    /// Returns an error when a channel cannot be connected or a sink fails
    /// to open. Startup failures are fatal.
    pub async fn new(
        config: &Config,
        mut provider: P,
        sinks: Vec<Box<dyn TabularSink + Send>>,
    ) -> Result<Self> {
        if sinks.len() != config.datasets.len() {
            return Err(GlitchLoggerError::Sink(format!(
                "expected {} sinks, got {}",
                config.datasets.len(),
                sinks.len()
            )));
        }

        let interval = Duration::from_millis(config.sampling.interval_ms);
        let mut handles: HashMap<String, ChannelHandle> = HashMap::new();
        let mut datasets = Vec::with_capacity(config.datasets.len());

        for (dataset_config, mut sink) in config.datasets.iter().zip(sinks) {
            let mut channels = Vec::with_capacity(dataset_config.channels.len());
            for channel in &dataset_config.channels {
                let handle = connect(&mut provider, &mut handles, &channel.name).await?;
                channels.push(LoggedChannel {
                    column: channel
                        .readback
                        .clone()
                        .unwrap_or_else(|| channel.name.clone()),
                    handle,
                    kind: channel.kind,
                    elements: channel.elements,
                    scale: channel.scale.unwrap_or(1.0),
                    units: channel.units.clone(),
                });
            }

            // Auto holdoff outlasts the capture window by one interval so
            // captures can never overlap; otherwise each source keeps its
            // configured fixed holdoff.
            let auto_holdoff = interval * (dataset_config.after as u32 + 2);

            let mut sources = Vec::with_capacity(dataset_config.triggers.len());
            let mut source_handles = Vec::with_capacity(dataset_config.triggers.len());
            for trigger in ordered_triggers(&dataset_config.triggers) {
                let handle = connect(&mut provider, &mut handles, trigger.channel()).await?;
                let holdoff = if dataset_config.auto_holdoff {
                    auto_holdoff
                } else {
                    Duration::from_millis(trigger.holdoff_ms())
                };
                let script = trigger.script().map(str::to_string);

                let mut source = match trigger {
                    TriggerConfig::Alarm {
                        channel,
                        severities,
                        subscribe,
                        ..
                    } => TriggerSource::alarm(
                        channel.clone(),
                        severities.clone(),
                        *subscribe,
                        holdoff,
                        script,
                    ),
                    TriggerConfig::Transition {
                        channel,
                        level,
                        direction,
                        auto_rearm,
                        ..
                    } => TriggerSource::transition(
                        channel.clone(),
                        *level,
                        *direction,
                        *auto_rearm,
                        holdoff,
                        script,
                    ),
                    TriggerConfig::Glitch {
                        channel,
                        threshold,
                        baseline_samples,
                        auto_reset,
                        ..
                    } => TriggerSource::glitch(
                        channel.clone(),
                        *threshold,
                        *baseline_samples,
                        *auto_reset,
                        holdoff,
                        script,
                    ),
                };

                if source.needs_subscription() {
                    let mailbox = Arc::new(AlarmMailbox::new());
                    provider.subscribe_alarm(handle, Arc::clone(&mailbox))?;
                    source.attach_mailbox(mailbox);
                }

                sources.push(source);
                source_handles.push(handle);
            }

            let array_counts: Vec<usize> = dataset_config
                .channels
                .iter()
                .filter(|c| c.kind == ChannelKindConfig::Array)
                .map(|c| c.elements)
                .collect();
            let layout = resolve_layout(config.sink.array_layout, &array_counts);

            sink.open(build_schema(&dataset_config.name, &channels, layout))
                .await?;
            debug!(
                "Dataset '{}': {} channels, {} sources, ring depth {}",
                dataset_config.name,
                channels.len(),
                sources.len(),
                dataset_config.before + 1 + dataset_config.after
            );

            datasets.push(Dataset {
                name: dataset_config.name.clone(),
                before: dataset_config.before,
                after: dataset_config.after,
                channels,
                sources,
                source_handles,
                layout,
                ring: SampleRing::new(dataset_config.before + 1 + dataset_config.after),
                sink,
                state: CaptureState::Idle,
                pending: None,
            });
        }

        let gate = match &config.gate {
            Some(gate_config) => Some(GateState {
                handle: connect(&mut provider, &mut handles, &gate_config.channel).await?,
                touch_on_abort: gate_config.touch_on_abort,
                open: true,
            }),
            None => None,
        };

        Ok(Self {
            provider,
            interval,
            io_timeout: Duration::from_millis(config.sampling.io_timeout_ms),
            error_budget: config.sampling.error_budget,
            errors_seen: 0,
            gate,
            datasets,
            dispatcher: ScriptDispatcher::new(),
            step: 0,
        })
    }

    /// Configured sampling interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Next tick's step index.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// One sampling tick at logical time `now` (elapsed since run start).
    ///
    /// # Errors
    ///
    /// Returns an error on a sink write failure or when timed-out and
    /// faulted reads exhaust the error budget; both are fatal to the run.
    /// Disconnected channels only ever show up as error counts in the
    /// snapshots, no matter how long the disconnect lasts.
    pub async fn tick(&mut self, now: Duration) -> Result<()> {
        if !self.check_gate().await? {
            return Ok(());
        }

        let mut scalars: HashMap<usize, CachedScalar> = HashMap::new();
        let mut arrays: HashMap<usize, CachedArray> = HashMap::new();
        let mut tick_failures: u64 = 0;

        // Read every referenced channel exactly once.
        for dataset in &self.datasets {
            for channel in &dataset.channels {
                match channel.kind {
                    ChannelKindConfig::Scalar => {
                        if !scalars.contains_key(&channel.handle.0) {
                            let read =
                                bounded_scalar(&mut self.provider, self.io_timeout, channel.handle)
                                    .await;
                            tick_failures += u64::from(read.1.counts_against_budget());
                            scalars.insert(channel.handle.0, read);
                        }
                    }
                    ChannelKindConfig::Array => {
                        if !arrays.contains_key(&channel.handle.0) {
                            let read =
                                bounded_array(&mut self.provider, self.io_timeout, channel.handle)
                                    .await;
                            tick_failures += u64::from(read.1.counts_against_budget());
                            arrays.insert(channel.handle.0, read);
                        }
                    }
                }
            }
            for handle in &dataset.source_handles {
                if !scalars.contains_key(&handle.0) {
                    let read = bounded_scalar(&mut self.provider, self.io_timeout, *handle).await;
                    tick_failures += u64::from(read.1.counts_against_budget());
                    scalars.insert(handle.0, read);
                }
            }
        }

        let time = Utc::now();
        let step = self.step;
        self.step += 1;

        for i in 0..self.datasets.len() {
            let dataset = &mut self.datasets[i];

            // Snapshot first, fully built before insertion.
            let mut values = Vec::with_capacity(dataset.channels.len());
            let mut errors: u32 = 0;
            for channel in &dataset.channels {
                match channel.kind {
                    ChannelKindConfig::Scalar => {
                        let (reading, status) = scalars
                            .get(&channel.handle.0)
                            .copied()
                            .unwrap_or((ScalarReading::disconnected(), ReadStatus::Failed));
                        errors += u32::from(status.is_error());
                        values.push(vec![reading.value * channel.scale]);
                    }
                    ChannelKindConfig::Array => match arrays.get(&channel.handle.0) {
                        Some((reading, status)) => {
                            errors += u32::from(status.is_error());
                            values.push(reading.values.iter().map(|v| v * channel.scale).collect());
                        }
                        None => {
                            errors += 1;
                            values.push(Vec::new());
                        }
                    },
                }
            }
            dataset.ring.push(Snapshot::new(step, time, values, errors));

            // Sources are evaluated every tick so baselines and previous
            // values track the stream even while a capture is in service.
            let mut firings = Vec::new();
            for (source, handle) in dataset.sources.iter_mut().zip(&dataset.source_handles) {
                let (reading, _) = scalars
                    .get(&handle.0)
                    .copied()
                    .unwrap_or((ScalarReading::disconnected(), ReadStatus::Failed));
                let input = TriggerInput {
                    value: reading.value,
                    severity: reading.severity,
                    connected: reading.connected,
                };
                if let Some(firing) = source.evaluate(&input, now) {
                    firings.push(firing);
                }
            }

            match dataset.state {
                CaptureState::Idle => {
                    if !firings.is_empty() {
                        let primary = &firings[0];
                        info!(
                            "Dataset '{}': {} trigger on '{}' at step {}",
                            dataset.name,
                            primary.kind.name(),
                            primary.channel,
                            step
                        );
                        dataset.pending = Some(PendingCapture {
                            step,
                            time,
                            firings,
                        });
                        dataset.state = if dataset.after == 0 {
                            CaptureState::Flushing
                        } else {
                            CaptureState::Capturing {
                                points_left: dataset.after,
                            }
                        };
                    }
                }
                CaptureState::Capturing { points_left } => {
                    if !firings.is_empty() {
                        debug!(
                            "Dataset '{}': {} source(s) fired while capturing, ignored",
                            dataset.name,
                            firings.len()
                        );
                    }
                    let left = points_left - 1;
                    dataset.state = if left == 0 {
                        CaptureState::Flushing
                    } else {
                        CaptureState::Capturing { points_left: left }
                    };
                }
                CaptureState::Flushing => {}
            }

            if self.datasets[i].state == CaptureState::Flushing {
                let dataset = &mut self.datasets[i];
                dataset.flush(&self.dispatcher, now).await?;
            }
        }

        self.errors_seen += tick_failures;
        if self.error_budget > 0 && self.errors_seen > self.error_budget {
            return Err(GlitchLoggerError::ErrorBudgetExceeded {
                count: self.errors_seen,
                budget: self.error_budget,
            });
        }
        Ok(())
    }

    /// Read the gate channel; `true` means sampling proceeds.
    ///
    /// A closed gate aborts every capture in service (discarding it without
    /// a page) and pauses sampling until the gate reads nonzero again.
    async fn check_gate(&mut self) -> Result<bool> {
        let Some((handle, was_open, touch_on_abort)) = self
            .gate
            .as_ref()
            .map(|g| (g.handle, g.open, g.touch_on_abort))
        else {
            return Ok(true);
        };

        let (reading, _) = bounded_scalar(&mut self.provider, self.io_timeout, handle).await;
        let open = reading.connected && reading.value != 0.0;
        if let Some(gate) = self.gate.as_mut() {
            gate.open = open;
        }

        if open {
            if !was_open {
                info!("Gate open, sampling resumed");
            }
            return Ok(true);
        }

        if was_open {
            warn!("Gate closed, sampling paused");
        }
        for dataset in &mut self.datasets {
            if dataset.state != CaptureState::Idle {
                warn!(
                    "Dataset '{}': capture in service aborted, gate closed",
                    dataset.name
                );
                dataset.abort();
                if touch_on_abort {
                    if let Err(e) = dataset.sink.touch().await {
                        warn!("Dataset '{}': marker touch failed: {}", dataset.name, e);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Run-ending shutdown: flush whatever is in service, then close every
    /// sink.
    ///
    /// A capture still counting down its post-trigger samples is flushed
    /// with the rows buffered so far, never truncated mid-row.
    ///
    /// # Errors
    ///
    /// Propagates sink write and close failures.
    pub async fn finish(&mut self, now: Duration) -> Result<()> {
        for i in 0..self.datasets.len() {
            if self.datasets[i].pending.is_some() {
                info!(
                    "Dataset '{}': run ending, flushing capture in service",
                    self.datasets[i].name
                );
                let dataset = &mut self.datasets[i];
                dataset.flush(&self.dispatcher, now).await?;
            }
        }
        for dataset in &mut self.datasets {
            dataset.sink.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mocks::MockProvider;
    use crate::sink::mocks::MockSink;

    fn parse_config(toml_text: &str) -> Config {
        let config: Config = toml::from_str(toml_text).unwrap();
        config.validate().unwrap();
        config
    }

    async fn build(toml_text: &str) -> (CaptureController<MockProvider>, MockProvider, Vec<MockSink>) {
        let config = parse_config(toml_text);
        let provider = MockProvider::new();
        let remote = provider.clone();
        let sinks: Vec<MockSink> = config.datasets.iter().map(|_| MockSink::new()).collect();
        let boxed = sinks
            .iter()
            .map(|s| Box::new(s.clone()) as Box<dyn TabularSink + Send>)
            .collect();
        let controller = CaptureController::new(&config, provider, boxed).await.unwrap();
        (controller, remote, sinks)
    }

    fn at(step: u64) -> Duration {
        Duration::from_millis(step * 100)
    }

    fn step_of(row: &[ColumnValue]) -> i64 {
        match row[0] {
            ColumnValue::I64(step) => step,
            ref other => panic!("step column is {:?}", other),
        }
    }

    fn post_trigger_of(row: &[ColumnValue]) -> bool {
        match row[4] {
            ColumnValue::Bool(post) => post,
            ref other => panic!("post_trigger column is {:?}", other),
        }
    }

    const RISING_TOML: &str = r#"
[sampling]
interval_ms = 100

[sink]

[[dataset]]
name = "beam"
before = 3
after = 2
auto_holdoff = false

[[dataset.channels]]
name = "bpm:x"

[[dataset.trigger]]
kind = "transition"
channel = "bpm:x"
level = 5.0
direction = "rising"
"#;

    // ==================== Capture Window Tests ====================

    #[tokio::test]
    async fn test_full_history_window_and_post_trigger_tagging() {
        let (mut controller, remote, sinks) = build(RISING_TOML).await;
        remote.set_value("bpm:x", 1.0);

        // Steps 0..=9 below the level, step 10 crosses, flush after step 12.
        for step in 0..=12u64 {
            if step == 10 {
                remote.set_value("bpm:x", 10.0);
            }
            controller.tick(at(step)).await.unwrap();
        }

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        let page = &pages[0];

        // min(before=3, 10) + 1 + after=2 rows, chronological steps 7..=12.
        assert_eq!(page.rows.len(), 6);
        for (i, row) in page.rows.iter().enumerate() {
            assert_eq!(step_of(row), 7 + i as i64);
            assert_eq!(post_trigger_of(row), step_of(row) > 10);
        }

        // The trigger row carries the crossing value.
        assert_eq!(page.rows[3][6], ColumnValue::F64(10.0));

        assert_eq!(
            page.parameters.get("trigger_kind"),
            Some(&ColumnValue::Str("transition".to_string()))
        );
        assert_eq!(
            page.parameters.get("trigger_step"),
            Some(&ColumnValue::I64(10))
        );
        assert_eq!(
            page.parameters.get("fired_sources"),
            Some(&ColumnValue::Str("transition:bpm:x".to_string()))
        );
        assert_eq!(page.parameters.get("trigger_severity"), None);
    }

    #[tokio::test]
    async fn test_window_clamped_at_stream_start() {
        let toml_text = RISING_TOML.replace("after = 2", "after = 1");
        let (mut controller, remote, sinks) = build(&toml_text).await;

        remote.set_value("bpm:x", 1.0);
        controller.tick(at(0)).await.unwrap();
        remote.set_value("bpm:x", 10.0);
        controller.tick(at(1)).await.unwrap(); // trigger at step 1
        controller.tick(at(2)).await.unwrap(); // flush

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        // Only one pre-trigger step exists: min(3, 1) + 1 + 1 = 3 rows.
        assert_eq!(pages[0].rows.len(), 3);
        assert_eq!(step_of(&pages[0].rows[0]), 0);
    }

    // ==================== Servicing Guard Tests ====================

    #[tokio::test]
    async fn test_single_capture_in_service() {
        let toml_text = RISING_TOML
            .replace("after = 2", "after = 3")
            .replace("direction = \"rising\"", "direction = \"rising\"\nauto_rearm = true");
        let (mut controller, remote, sinks) = build(&toml_text).await;

        // Alternate below/above the level every tick: crossings keep firing
        // but only the capture from the first fire is serviced.
        for step in 0..=4u64 {
            remote.set_value("bpm:x", if step % 2 == 0 { 1.0 } else { 10.0 });
            controller.tick(at(step)).await.unwrap();
        }

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(
            pages[0].parameters.get("trigger_step"),
            Some(&ColumnValue::I64(1))
        );

        // After the flush the dataset rearms and captures again.
        for step in 5..=8u64 {
            remote.set_value("bpm:x", if step % 2 == 0 { 1.0 } else { 10.0 });
            controller.tick(at(step)).await.unwrap();
        }
        assert_eq!(sinks[0].pages().len(), 2);
    }

    #[tokio::test]
    async fn test_flush_is_one_shot() {
        let (mut controller, remote, sinks) = build(RISING_TOML).await;

        remote.set_value("bpm:x", 1.0);
        controller.tick(at(0)).await.unwrap();
        remote.set_value("bpm:x", 10.0);
        for step in 1..=3u64 {
            controller.tick(at(step)).await.unwrap();
        }
        assert_eq!(sinks[0].pages().len(), 1);

        // Value stays above the level: no new crossing, no new page.
        for step in 4..=10u64 {
            controller.tick(at(step)).await.unwrap();
        }
        assert_eq!(sinks[0].pages().len(), 1);
    }

    // ==================== Multi-Source and Script Tests ====================

    #[tokio::test]
    async fn test_two_sources_same_tick_share_page_and_script_runs_once() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hits");
        let script = format!("echo hit >> {}", out.display());

        let toml_text = format!(
            r#"
[sampling]
interval_ms = 100

[sink]

[[dataset]]
name = "beam"
before = 1
after = 0
auto_holdoff = false

[[dataset.channels]]
name = "bpm:x"

[[dataset.trigger]]
kind = "transition"
channel = "bpm:x"
level = 5.0
direction = "rising"
script = "{script}"

[[dataset.trigger]]
kind = "glitch"
channel = "bpm:x"
threshold = 0.5
baseline_samples = 8
script = "{script}"
"#
        );
        let (mut controller, remote, sinks) = build(&toml_text).await;

        remote.set_value("bpm:x", 1.0);
        controller.tick(at(0)).await.unwrap();
        remote.set_value("bpm:x", 10.0);
        controller.tick(at(1)).await.unwrap(); // after = 0: flush same tick

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(
            pages[0].parameters.get("fired_sources"),
            Some(&ColumnValue::Str(
                "transition:bpm:x,glitch:bpm:x".to_string()
            ))
        );
        assert_eq!(
            pages[0].parameters.get("trigger_kind"),
            Some(&ColumnValue::Str("transition".to_string()))
        );

        // Both sources carry the same script string: run exactly once.
        let mut contents = String::new();
        std::fs::File::open(&out)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_alarm_trigger_records_severity() {
        let toml_text = r#"
[sampling]
interval_ms = 100

[sink]

[[dataset]]
name = "beam"
before = 1
after = 0
auto_holdoff = false

[[dataset.channels]]
name = "bpm:x"

[[dataset.trigger]]
kind = "alarm"
channel = "bpm:x"
severities = ["major"]
"#;
        let (mut controller, remote, sinks) = build(toml_text).await;

        controller.tick(at(0)).await.unwrap();
        remote.set_severity("bpm:x", crate::provider::AlarmSeverity::Major);
        controller.tick(at(1)).await.unwrap();

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(
            pages[0].parameters.get("trigger_severity"),
            Some(&ColumnValue::Str("major".to_string()))
        );
        assert_eq!(
            pages[0].parameters.get("trigger_kind"),
            Some(&ColumnValue::Str("alarm".to_string()))
        );
    }

    // ==================== Error Accounting Tests ====================

    #[tokio::test]
    async fn test_disconnected_channel_counts_errors_without_breaking_capture() {
        let toml_text = r#"
[sampling]
interval_ms = 100

[sink]

[[dataset]]
name = "beam"
before = 5
after = 1
auto_holdoff = false

[[dataset.channels]]
name = "sig"

[[dataset.trigger]]
kind = "transition"
channel = "trig"
level = 5.0
direction = "rising"
"#;
        let (mut controller, remote, sinks) = build(toml_text).await;
        remote.set_value("sig", 2.5);
        remote.set_value("trig", 1.0);

        for step in 0..=7u64 {
            if step == 2 {
                remote.set_connected("sig", false);
            }
            if step == 5 {
                remote.set_connected("sig", true);
            }
            if step == 6 {
                remote.set_value("trig", 10.0);
            }
            controller.tick(at(step)).await.unwrap();
        }

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        // Rows cover steps 1..=7.
        assert_eq!(pages[0].rows.len(), 7);
        for row in &pages[0].rows {
            let step = step_of(row);
            let disconnected = (2..=4).contains(&step);
            assert_eq!(row[5], ColumnValue::I64(i64::from(disconnected)));
            let expected = if disconnected { 0.0 } else { 2.5 };
            assert_eq!(row[6], ColumnValue::F64(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_budget_exceeded_is_fatal() {
        let toml_text = RISING_TOML.replace(
            "interval_ms = 100",
            "interval_ms = 100\nerror_budget = 2",
        );
        let (mut controller, remote, _sinks) = build(&toml_text).await;
        // Every read stalls past the 100ms I/O deadline.
        remote.set_read_delay("bpm:x", Duration::from_millis(250));

        controller.tick(at(0)).await.unwrap();
        controller.tick(at(1)).await.unwrap();
        let err = controller.tick(at(2)).await.unwrap_err();
        assert!(matches!(
            err,
            GlitchLoggerError::ErrorBudgetExceeded {
                count: 3,
                budget: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_persistent_disconnect_spares_error_budget() {
        let toml_text = RISING_TOML.replace(
            "interval_ms = 100",
            "interval_ms = 100\nerror_budget = 2",
        );
        let (mut controller, remote, _sinks) = build(&toml_text).await;
        remote.set_connected("bpm:x", false);

        // Far past the budget: disconnects land in the snapshot error
        // counts but never end the run.
        for step in 0..10u64 {
            controller.tick(at(step)).await.unwrap();
        }
    }

    // ==================== Gate Tests ====================

    #[tokio::test]
    async fn test_gate_abort_discards_capture_and_touches_marker() {
        let toml_text = r#"
[sampling]
interval_ms = 100

[sink]

[gate]
channel = "permit"

[[dataset]]
name = "beam"
before = 2
after = 5
auto_holdoff = false

[[dataset.channels]]
name = "bpm:x"

[[dataset.trigger]]
kind = "transition"
channel = "bpm:x"
level = 5.0
direction = "rising"
"#;
        let (mut controller, remote, sinks) = build(toml_text).await;
        remote.set_value("permit", 1.0);
        remote.set_value("bpm:x", 1.0);

        controller.tick(at(0)).await.unwrap();
        remote.set_value("bpm:x", 10.0);
        controller.tick(at(1)).await.unwrap(); // trigger
        controller.tick(at(2)).await.unwrap(); // capturing

        // Gate drops mid-capture: abort, no page, marker touched.
        remote.set_value("permit", 0.0);
        controller.tick(at(3)).await.unwrap();
        assert!(sinks[0].pages().is_empty());
        assert_eq!(sinks[0].touches(), 1);

        // Gate returns; a fresh crossing is captured and flushed normally.
        remote.set_value("permit", 1.0);
        remote.set_value("bpm:x", 1.0);
        controller.tick(at(4)).await.unwrap(); // re-cross rearms
        remote.set_value("bpm:x", 10.0);
        for step in 5..=10u64 {
            controller.tick(at(step)).await.unwrap();
        }

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        // History buffered before the abort went with it; the page starts
        // at the first post-reopen step.
        assert_eq!(pages[0].rows.len(), 7);
        assert_eq!(step_of(&pages[0].rows[0]), 3);
        assert_eq!(sinks[0].touches(), 1);
    }

    // ==================== Holdoff Tests ====================

    #[tokio::test]
    async fn test_auto_holdoff_prevents_overlapping_captures() {
        let toml_text = RISING_TOML
            .replace("auto_holdoff = false", "auto_holdoff = true")
            .replace("direction = \"rising\"", "direction = \"rising\"\nauto_rearm = true");
        let (mut controller, remote, sinks) = build(&toml_text).await;

        // Crossings every other tick. First fire at step 1 (now = 100ms),
        // flush at step 3 (300ms), auto holdoff (after + 2) * interval =
        // 400ms keeps the dataset quiet until 700ms: the crossing at step 5
        // is suppressed, the one at step 7 fires.
        for step in 0..=8u64 {
            remote.set_value("bpm:x", if step % 2 == 0 { 1.0 } else { 10.0 });
            controller.tick(at(step)).await.unwrap();
        }
        // Had step 5 fired, its capture would have flushed by step 7.
        assert_eq!(sinks[0].pages().len(), 1);

        for step in 9..=11u64 {
            remote.set_value("bpm:x", if step % 2 == 0 { 1.0 } else { 10.0 });
            controller.tick(at(step)).await.unwrap();
        }
        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(
            pages[1].parameters.get("trigger_step"),
            Some(&ColumnValue::I64(7))
        );
    }

    // ==================== Shutdown Tests ====================

    #[tokio::test]
    async fn test_finish_flushes_partial_capture_and_closes_sink() {
        let toml_text = RISING_TOML.replace("after = 2", "after = 5");
        let (mut controller, remote, sinks) = build(&toml_text).await;

        remote.set_value("bpm:x", 1.0);
        controller.tick(at(0)).await.unwrap();
        controller.tick(at(1)).await.unwrap();
        remote.set_value("bpm:x", 10.0);
        controller.tick(at(2)).await.unwrap(); // trigger
        controller.tick(at(3)).await.unwrap(); // one post-trigger sample

        controller.finish(at(4)).await.unwrap();

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        // min(before=3, 2) + 1 + 1 buffered post-trigger row.
        assert_eq!(pages[0].rows.len(), 4);
        assert_eq!(step_of(&pages[0].rows[0]), 0);
        assert_eq!(step_of(&pages[0].rows[3]), 3);
        assert!(sinks[0].state().lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_finish_with_nothing_in_service_writes_nothing() {
        let (mut controller, remote, sinks) = build(RISING_TOML).await;
        remote.set_value("bpm:x", 1.0);
        controller.tick(at(0)).await.unwrap();
        controller.finish(at(1)).await.unwrap();

        assert!(sinks[0].pages().is_empty());
        assert!(sinks[0].state().lock().unwrap().closed);
    }

    // ==================== Layout and Schema Tests ====================

    #[tokio::test]
    async fn test_array_channel_native_layout_rows() {
        let toml_text = r#"
[sampling]
interval_ms = 100

[sink]
array_layout = "native"

[[dataset]]
name = "beam"
before = 1
after = 0
auto_holdoff = false

[[dataset.channels]]
name = "profile"
kind = "array"
elements = 3

[[dataset.trigger]]
kind = "transition"
channel = "trig"
level = 5.0
direction = "rising"
"#;
        let (mut controller, remote, sinks) = build(toml_text).await;
        remote.set_array("profile", vec![1.0, 2.0, 3.0]);
        remote.set_value("trig", 1.0);

        controller.tick(at(0)).await.unwrap();
        remote.set_value("trig", 10.0);
        controller.tick(at(1)).await.unwrap();

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        let schema = sinks[0].state().lock().unwrap().schema.clone().unwrap();
        assert_eq!(schema.columns.len(), META_COLUMNS + 1);
        assert_eq!(
            pages[0].rows[0][6],
            ColumnValue::F64Array(vec![1.0, 2.0, 3.0])
        );
    }

    #[tokio::test]
    async fn test_array_channel_columns_layout_expands_elements() {
        let toml_text = r#"
[sampling]
interval_ms = 100

[sink]

[[dataset]]
name = "beam"
before = 1
after = 0
auto_holdoff = false

[[dataset.channels]]
name = "profile"
kind = "array"
elements = 3

[[dataset.trigger]]
kind = "transition"
channel = "trig"
level = 5.0
direction = "rising"
"#;
        let (mut controller, remote, sinks) = build(toml_text).await;
        remote.set_array("profile", vec![1.0, 2.0, 3.0]);
        remote.set_value("trig", 1.0);

        controller.tick(at(0)).await.unwrap();
        remote.set_value("trig", 10.0);
        controller.tick(at(1)).await.unwrap();

        // Auto layout with uniform element counts resolves to columns.
        let schema = sinks[0].state().lock().unwrap().schema.clone().unwrap();
        assert_eq!(schema.columns.len(), META_COLUMNS + 3);
        assert_eq!(schema.columns[6].name, "profile[0]");

        let pages = sinks[0].pages();
        assert_eq!(pages[0].rows[0][6], ColumnValue::F64(1.0));
        assert_eq!(pages[0].rows[0][8], ColumnValue::F64(3.0));
    }

    #[tokio::test]
    async fn test_scale_applied_to_logged_values() {
        let toml_text = RISING_TOML.replace(
            "name = \"bpm:x\"",
            "name = \"bpm:x\"\nscale = 2.0",
        );
        let (mut controller, remote, sinks) = build(&toml_text).await;

        remote.set_value("bpm:x", 1.0);
        controller.tick(at(0)).await.unwrap();
        remote.set_value("bpm:x", 10.0);
        for step in 1..=3u64 {
            controller.tick(at(step)).await.unwrap();
        }

        let pages = sinks[0].pages();
        assert_eq!(pages.len(), 1);
        // Logged value is scaled; the trigger compares the raw reading.
        let last = pages[0].rows.last().unwrap();
        assert_eq!(last[6], ColumnValue::F64(20.0));
    }
}
