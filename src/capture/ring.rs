//! # Circular Sample Buffer Module
//!
//! Fixed-depth snapshot ring retaining pre-trigger history for one output
//! dataset.
//!
//! The ring holds `before + 1 + after` slots and a single write cursor that
//! always points at the next slot to overwrite. Capacity is fixed at startup
//! and never resized. Each dataset owns exactly one ring; rings are never
//! shared. Snapshots are written strictly in tick order, and windows are read
//! back in the same FIFO order regardless of wraparound.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// One per-tick sample of every logged channel in a dataset.
///
/// A snapshot is fully built before it is stored, so a ring slot is never
/// partially written. Disconnected channels contribute zero/empty values and
/// bump `errors` instead of aborting the tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Monotonic tick index.
    pub step: u64,
    /// Wall-clock sample time.
    pub time: DateTime<Utc>,
    /// Hours since local-day midnight (UTC), fractional.
    pub time_of_day: f64,
    /// Day of month at sample time.
    pub day_of_month: u32,
    /// Per-logged-channel value vectors; scalars hold one element.
    pub values: Vec<Vec<f64>>,
    /// Count of channel read failures (disconnects, timeouts) in this tick.
    pub errors: u32,
}

impl Snapshot {
    /// Builds a snapshot, deriving time-of-day and day-of-month from `time`.
    #[must_use]
    pub fn new(step: u64, time: DateTime<Utc>, values: Vec<Vec<f64>>, errors: u32) -> Self {
        let time_of_day = f64::from(time.hour())
            + f64::from(time.minute()) / 60.0
            + f64::from(time.second()) / 3600.0;
        Self {
            step,
            time,
            time_of_day,
            day_of_month: time.day(),
            values,
            errors,
        }
    }
}

/// Fixed-capacity ring of snapshots with one write cursor.
#[derive(Debug)]
pub struct SampleRing {
    slots: Vec<Option<Snapshot>>,
    /// Next slot to be overwritten.
    cursor: usize,
    /// Number of valid slots, saturating at capacity.
    filled: usize,
}

impl SampleRing {
    /// Creates a ring with `capacity` slots. Capacity must be at least 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            cursor: 0,
            filled: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of snapshots currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filled
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Stores a snapshot at the cursor, overwriting the oldest slot once the
    /// ring has wrapped.
    pub fn push(&mut self, snapshot: Snapshot) {
        self.slots[self.cursor] = Some(snapshot);
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    /// Most recently stored snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        if self.filled == 0 {
            return None;
        }
        let idx = (self.cursor + self.slots.len() - 1) % self.slots.len();
        self.slots[idx].as_ref()
    }

    /// The last `count` snapshots in chronological (FIFO) order.
    ///
    /// Asks for more than is held get everything held.
    #[must_use]
    pub fn window_last(&self, count: usize) -> Vec<&Snapshot> {
        let count = count.min(self.filled);
        let oldest = (self.cursor + self.slots.len() - count) % self.slots.len();
        (0..count)
            .filter_map(|i| {
                let idx = (oldest + i) % self.slots.len();
                self.slots[idx].as_ref()
            })
            .collect()
    }

    /// Drops all held snapshots without changing capacity.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.cursor = 0;
        self.filled = 0;
    }
}
