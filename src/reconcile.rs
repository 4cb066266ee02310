//! Positional reconciliation of profiling samples onto the event log.
//!
//! The server numbers every statement it profiles, including the setup
//! statements issued before user instrumentation begins. A sample with
//! sequence id `n` therefore belongs to the `(n - offset)`-th reconcilable
//! event, where `offset` is the number of those setup statements.
//!
//! Correlation is by position only. Statement text is never used as a join
//! key, except to refuse samples that echo a reserved bookkeeping statement.

use std::time::Duration;

use serde::Serialize;

use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::log::EventLog;
use crate::parser::normalize_statement;

/// A sample as read from the profiling source, before validation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawSample {
    pub server_sequence_id: Option<i64>,
    pub duration_micros: Option<f64>,
    pub echoed_statement_text: Option<String>,
}

impl RawSample {
    pub fn new(server_sequence_id: i64, duration_micros: f64) -> Self {
        Self {
            server_sequence_id: Some(server_sequence_id),
            duration_micros: Some(duration_micros),
            echoed_statement_text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.echoed_statement_text = Some(text.into());
        self
    }
}

/// A validated profiling sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilingSample {
    pub server_sequence_id: u64,
    pub duration_micros: u64,
    pub echoed_statement_text: Option<String>,
}

impl TryFrom<RawSample> for ProfilingSample {
    type Error = ProfilerError;

    fn try_from(raw: RawSample) -> Result<Self, Self::Error> {
        let id = raw
            .server_sequence_id
            .ok_or_else(|| ProfilerError::malformed("missing sequence id"))?;
        let server_sequence_id = u64::try_from(id)
            .map_err(|_| ProfilerError::malformed(format!("negative sequence id {}", id)))?;

        let duration = raw
            .duration_micros
            .ok_or_else(|| ProfilerError::malformed(format!("sample {} has no duration", id)))?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(ProfilerError::malformed(format!(
                "sample {} has invalid duration {}",
                id, duration
            )));
        }

        Ok(Self {
            server_sequence_id,
            duration_micros: duration.round() as u64,
            echoed_statement_text: raw.echoed_statement_text,
        })
    }
}

/// Outcome counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Durations written onto events that had none.
    pub applied: usize,
    /// Samples repeating a duration already recorded.
    pub unchanged: usize,
    /// Statement texts filled in from the sample echo.
    pub backfilled: usize,
    /// Samples echoing a reserved bookkeeping statement.
    pub bookkeeping: usize,
    /// Samples whose target lies outside the log.
    pub skewed: usize,
    /// Samples discarded for missing or invalid fields.
    pub malformed: usize,
    /// Samples disagreeing with an already recorded duration.
    pub conflicts: usize,
    /// The server numbered a different number of statements than the log
    /// holds reconcilable events, so later durations may be attributed to
    /// the wrong events.
    pub misaligned: bool,
}

/// Maps samples onto events by server sequence id.
#[derive(Debug, Clone)]
pub struct Reconciler {
    offset: u64,
    reserved: Vec<String>,
    slow_query_threshold: Option<Duration>,
}

impl Reconciler {
    /// `reserved` holds statement texts that are never attributed; they are
    /// normalized here.
    pub fn new<I, S>(offset: u64, reserved: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            offset,
            reserved: reserved
                .into_iter()
                .map(|s| normalize_statement(s.as_ref()))
                .collect(),
            slow_query_threshold: None,
        }
    }

    pub fn from_config(config: &ProfilerConfig) -> Self {
        Self {
            offset: config.bookkeeping_offset(),
            reserved: config.reserved_signatures(),
            slow_query_threshold: Some(config.slow_query_threshold),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn is_bookkeeping(&self, echoed: Option<&str>) -> bool {
        match echoed {
            Some(text) => {
                let normalized = normalize_statement(text);
                self.reserved.iter().any(|r| *r == normalized)
            }
            None => false,
        }
    }

    /// Apply samples to the log. Safe to repeat with overlapping batches.
    pub fn apply<I>(&self, log: &mut EventLog, samples: I) -> ReconcileSummary
    where
        I: IntoIterator<Item = RawSample>,
    {
        let mut summary = ReconcileSummary::default();
        let expected = log.reconcilable_count() as u64;
        let mut highest: Option<u64> = None;

        for raw in samples {
            let sample = match ProfilingSample::try_from(raw) {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding profiling sample");
                    summary.malformed += 1;
                    continue;
                }
            };

            if self.is_bookkeeping(sample.echoed_statement_text.as_deref()) {
                summary.bookkeeping += 1;
                continue;
            }

            let ordinal = sample.server_sequence_id.checked_sub(self.offset);
            if let Some(ordinal) = ordinal {
                highest = highest.max(Some(ordinal));
            }

            let event = match ordinal.and_then(|ordinal| log.by_ordinal_mut(ordinal)) {
                Some(event) => event,
                None => {
                    summary.skewed += 1;
                    continue;
                }
            };

            match event.duration_micros {
                None => {
                    event.duration_micros = Some(sample.duration_micros);
                    summary.applied += 1;

                    if let Some(threshold) = self.slow_query_threshold {
                        if Duration::from_micros(sample.duration_micros) > threshold {
                            tracing::warn!(
                                db.sequence_index = event.sequence_index,
                                duration_us = sample.duration_micros,
                                threshold_ms = saturating_millis(threshold),
                                "Slow query detected"
                            );
                        }
                    }
                }
                Some(existing) if existing == sample.duration_micros => {
                    summary.unchanged += 1;
                }
                Some(existing) => {
                    tracing::warn!(
                        db.sequence_index = event.sequence_index,
                        recorded_us = existing,
                        sampled_us = sample.duration_micros,
                        "Profiling sample disagrees with recorded duration; keeping recorded value"
                    );
                    summary.conflicts += 1;
                }
            }

            if event.statement_text.is_empty() {
                if let Some(echoed) = &sample.echoed_statement_text {
                    let text = normalize_statement(echoed);
                    if !text.is_empty() {
                        event.statement_text = text;
                        summary.backfilled += 1;
                    }
                }
            }
        }

        let observed = highest.unwrap_or(0);
        if observed != expected {
            summary.misaligned = true;
            tracing::warn!(
                expected,
                observed,
                offset = self.offset,
                "Profiling samples out of step with the event log; durations may be misattributed"
            );
        }

        tracing::debug!(
            applied = summary.applied,
            unchanged = summary.unchanged,
            backfilled = summary.backfilled,
            bookkeeping = summary.bookkeeping,
            skewed = summary.skewed,
            malformed = summary.malformed,
            conflicts = summary.conflicts,
            misaligned = summary.misaligned,
            "Reconciled profiling samples"
        );

        summary
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActionKind, Origin};

    const SETUP: &str = "SET profiling_history_size = 100";

    fn log_of(kinds: &[ActionKind]) -> EventLog {
        let mut log = EventLog::new();
        for (i, kind) in kinds.iter().enumerate() {
            let text = format!("SELECT {}", i + 1);
            log.append(*kind, Some(&text), None, Origin::unknown());
        }
        log
    }

    fn durations(log: &EventLog) -> Vec<Option<u64>> {
        log.entries().map(|e| e.duration_micros).collect()
    }

    #[test]
    fn test_every_event_reconciled() {
        let mut log = log_of(&[ActionKind::Execute; 5]);
        let reconciler = Reconciler::new(1, [SETUP]);
        let samples = (1..=5).map(|i| RawSample::new(i + 1, (i * 10) as f64));

        let summary = reconciler.apply(&mut log, samples);

        assert_eq!(summary.applied, 5);
        assert!(!summary.misaligned);
        assert_eq!(
            durations(&log),
            vec![Some(10), Some(20), Some(30), Some(40), Some(50)]
        );
    }

    #[test]
    fn test_repeated_batch_is_idempotent() {
        let mut log = log_of(&[ActionKind::Query; 3]);
        let reconciler = Reconciler::new(1, [SETUP]);
        let batch: Vec<_> = (2..=4).map(|id| RawSample::new(id, 7.0)).collect();

        reconciler.apply(&mut log, batch.clone());
        let once = log.to_vec();
        let summary = reconciler.apply(&mut log, batch);

        assert_eq!(log.to_vec(), once);
        assert_eq!(summary.applied, 0);
        assert_eq!(summary.unchanged, 3);
    }

    #[test]
    fn test_conflicting_duration_keeps_first() {
        let mut log = log_of(&[ActionKind::Query]);
        let reconciler = Reconciler::new(0, Vec::<String>::new());

        reconciler.apply(&mut log, [RawSample::new(1, 100.0)]);
        let summary = reconciler.apply(&mut log, [RawSample::new(1, 900.0)]);

        assert_eq!(summary.conflicts, 1);
        assert_eq!(durations(&log), vec![Some(100)]);
    }

    #[test]
    fn test_bookkeeping_sample_never_attributed() {
        let mut log = log_of(&[ActionKind::Execute; 2]);
        let reconciler = Reconciler::new(1, [SETUP]);

        // id 2 would map onto the first user event if text were ignored
        let samples = [
            RawSample::new(1, 5.0).with_text(SETUP),
            RawSample::new(2, 999.0).with_text("SET  profiling_history_size\n= 100"),
        ];
        let summary = reconciler.apply(&mut log, samples);

        assert_eq!(summary.bookkeeping, 2);
        assert_eq!(durations(&log), vec![None, None]);
    }

    #[test]
    fn test_out_of_bounds_samples_are_ignored() {
        let mut log = log_of(&[ActionKind::Execute; 2]);
        let before = log.to_vec();
        let reconciler = Reconciler::new(1, [SETUP]);

        // id 1 is the offset itself, ids 4+ are not logged yet
        let summary = reconciler.apply(
            &mut log,
            [RawSample::new(1, 1.0), RawSample::new(4, 1.0), RawSample::new(50, 1.0)],
        );

        assert_eq!(summary.skewed, 3);
        assert!(summary.misaligned);
        assert_eq!(log.to_vec(), before);
    }

    #[test]
    fn test_unlogged_statement_flags_misalignment() {
        let mut log = log_of(&[ActionKind::Query; 2]);
        let reconciler = Reconciler::new(1, [SETUP]);

        // the server numbered three statements, the log holds two
        let summary = reconciler.apply(
            &mut log,
            [RawSample::new(2, 10.0), RawSample::new(3, 20.0), RawSample::new(4, 30.0)],
        );

        assert!(summary.misaligned);
        assert_eq!(summary.skewed, 1);
    }

    #[test]
    fn test_missing_samples_flag_misalignment() {
        let mut log = log_of(&[ActionKind::Query; 3]);
        let reconciler = Reconciler::new(1, [SETUP]);

        let summary = reconciler.apply(&mut log, [RawSample::new(2, 10.0)]);

        assert!(summary.misaligned);
        assert_eq!(durations(&log), vec![Some(10), None, None]);
    }

    #[test]
    fn test_empty_log_and_no_samples_is_aligned() {
        let mut log = EventLog::new();
        let reconciler = Reconciler::new(1, [SETUP]);

        let summary = reconciler.apply(&mut log, [RawSample::new(1, 5.0).with_text(SETUP)]);

        assert!(!summary.misaligned);
        assert_eq!(summary.bookkeeping, 1);
    }

    #[test]
    fn test_threshold_millis_saturate() {
        assert_eq!(saturating_millis(Duration::from_millis(500)), 500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_malformed_sample_isolated() {
        let mut log = log_of(&[ActionKind::Execute; 2]);
        let reconciler = Reconciler::new(0, Vec::<String>::new());
        let samples = [
            RawSample {
                server_sequence_id: None,
                duration_micros: Some(3.0),
                echoed_statement_text: None,
            },
            RawSample::new(1, f64::NAN),
            RawSample::new(-4, 1.0),
            RawSample::new(2, 42.4),
        ];

        let summary = reconciler.apply(&mut log, samples);

        assert_eq!(summary.malformed, 3);
        assert_eq!(summary.applied, 1);
        assert_eq!(durations(&log), vec![None, Some(42)]);
    }

    #[test]
    fn test_prepare_excluded_from_correlation() {
        let mut log = log_of(&[ActionKind::Execute, ActionKind::Prepare, ActionKind::Execute]);
        let reconciler = Reconciler::new(1, [SETUP]);

        let summary = reconciler.apply(&mut log, [RawSample::new(2, 100.0), RawSample::new(3, 200.0)]);

        assert_eq!(summary.applied, 2);
        assert_eq!(durations(&log), vec![Some(100), None, Some(200)]);
    }

    #[test]
    fn test_duplicate_statements_correlate_by_position() {
        let mut log = EventLog::new();
        for _ in 0..2 {
            log.append(ActionKind::Query, Some("SELECT * FROM t"), None, Origin::unknown());
        }
        let reconciler = Reconciler::new(0, Vec::<String>::new());

        reconciler.apply(
            &mut log,
            [
                RawSample::new(2, 20.0).with_text("SELECT * FROM t"),
                RawSample::new(1, 10.0).with_text("SELECT * FROM t"),
            ],
        );

        assert_eq!(durations(&log), vec![Some(10), Some(20)]);
    }

    #[test]
    fn test_backfills_missing_text_only() {
        let mut log = EventLog::new();
        log.append(ActionKind::BeginTransaction, None, None, Origin::unknown());
        log.append(ActionKind::Query, Some("SELECT 1"), None, Origin::unknown());
        let reconciler = Reconciler::new(0, Vec::<String>::new());

        let summary = reconciler.apply(
            &mut log,
            [
                RawSample::new(1, 3.0).with_text("BEGIN"),
                RawSample::new(2, 4.0).with_text("select   1"),
            ],
        );

        assert_eq!(summary.backfilled, 1);
        let texts: Vec<_> = log.entries().map(|e| e.statement_text.clone()).collect();
        assert_eq!(texts, vec!["BEGIN".to_string(), "SELECT 1".to_string()]);
    }
}
