//! Counter-based flush policy.

/// Decides when the session must reconcile.
///
/// A flush falls due each time the reconcilable count reaches a multiple of
/// the threshold. A due flush may be held back (while a transaction owns the
/// connection) and runs at the next opportunity. Teardown is granted once.
#[derive(Debug, Clone)]
pub struct FlushTrigger {
    threshold: usize,
    pending: bool,
    closed: bool,
}

impl FlushTrigger {
    /// `threshold` must be at least 1; the session validates this.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: false,
            closed: false,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Note an append. `reconcilable_count` is the log's count afterwards;
    /// `reconcilable` tells whether the appended event counted.
    pub fn record_append(&mut self, reconcilable: bool, reconcilable_count: usize) {
        if reconcilable && reconcilable_count % self.threshold == 0 {
            self.pending = true;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Take the pending flush, if any.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    /// Claim the teardown flush. Returns `true` only on the first call.
    pub fn begin_teardown(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.pending = false;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(trigger: &mut FlushTrigger, appends: usize) -> usize {
        let mut flushes = 0;
        for count in 1..=appends {
            trigger.record_append(true, count);
            if trigger.take() {
                flushes += 1;
            }
        }
        flushes
    }

    #[test]
    fn test_threshold_minus_one_does_not_flush() {
        let mut trigger = FlushTrigger::new(100);
        assert_eq!(run(&mut trigger, 99), 0);
    }

    #[test]
    fn test_threshold_flushes_once() {
        let mut trigger = FlushTrigger::new(100);
        assert_eq!(run(&mut trigger, 100), 1);

        let mut trigger = FlushTrigger::new(3);
        assert_eq!(run(&mut trigger, 10), 3);
    }

    #[test]
    fn test_non_reconcilable_append_never_flushes() {
        let mut trigger = FlushTrigger::new(2);
        trigger.record_append(false, 2);
        assert!(!trigger.is_pending());
    }

    #[test]
    fn test_held_flush_survives_until_taken() {
        let mut trigger = FlushTrigger::new(2);
        trigger.record_append(true, 2);
        trigger.record_append(true, 3);
        assert!(trigger.is_pending());
        assert!(trigger.take());
        assert!(!trigger.take());
    }

    #[test]
    fn test_teardown_granted_once() {
        let mut trigger = FlushTrigger::new(10);
        assert!(trigger.begin_teardown());
        assert!(!trigger.begin_teardown());
        assert!(trigger.is_closed());
    }
}
