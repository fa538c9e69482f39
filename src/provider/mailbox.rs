//! Single-slot alarm mailbox bridging subscription callbacks to the
//! sampling loop.
//!
//! The transport's callback thread is the only writer; the sampling loop is
//! the only reader and drains every mailbox at the start of a tick, before
//! trigger evaluation. A later post overwrites an unconsumed one, which is
//! the intended semantics: only the most recent severity matters.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use super::AlarmSeverity;

/// Lock-free single-writer/single-reader severity slot.
#[derive(Debug, Default)]
pub struct AlarmMailbox {
    severity: AtomicU8,
    pending: AtomicBool,
}

impl AlarmMailbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a severity and mark the slot pending.
    ///
    /// Safe to call from the transport's callback thread concurrently with
    /// the sampling tick.
    pub fn post(&self, severity: AlarmSeverity) {
        self.severity.store(severity.as_u8(), Ordering::Release);
        self.pending.store(true, Ordering::Release);
    }

    /// Consume the pending severity, if any.
    ///
    /// Called once per tick by the sampling loop.
    pub fn take(&self) -> Option<AlarmSeverity> {
        if self.pending.swap(false, Ordering::AcqRel) {
            Some(AlarmSeverity::from_u8(self.severity.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Whether an unconsumed severity is waiting.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_mailbox_yields_nothing() {
        let mailbox = AlarmMailbox::new();
        assert!(!mailbox.is_pending());
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_post_then_take() {
        let mailbox = AlarmMailbox::new();
        mailbox.post(AlarmSeverity::Major);

        assert!(mailbox.is_pending());
        assert_eq!(mailbox.take(), Some(AlarmSeverity::Major));

        // The slot is consumed exactly once.
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_later_post_overwrites_unconsumed() {
        let mailbox = AlarmMailbox::new();
        mailbox.post(AlarmSeverity::Minor);
        mailbox.post(AlarmSeverity::Invalid);

        assert_eq!(mailbox.take(), Some(AlarmSeverity::Invalid));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_cross_thread_post() {
        let mailbox = Arc::new(AlarmMailbox::new());
        let writer = Arc::clone(&mailbox);

        let handle = std::thread::spawn(move || {
            writer.post(AlarmSeverity::Major);
        });
        handle.join().unwrap();

        assert_eq!(mailbox.take(), Some(AlarmSeverity::Major));
    }
}
