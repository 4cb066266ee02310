//! Append-only event log.

use crate::event::{ActionKind, BindValue, Origin, QueryEvent};
use crate::parser::normalize_statement;
use crate::reconcile::{RawSample, ReconcileSummary, Reconciler};

/// Ordered record of every instrumented action in one session.
///
/// Insertion order is execution order. Events are never reordered, removed
/// or deduplicated; only their duration and (missing) text are written back
/// by reconciliation.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<QueryEvent>,
    /// `reconcilable[k]` is the position in `events` of the (k + 1)-th
    /// event the server profiles.
    reconcilable: Vec<usize>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action and return its one-based sequence index.
    pub fn append(
        &mut self,
        action_kind: ActionKind,
        raw_text: Option<&str>,
        parameters: Option<Vec<BindValue>>,
        origin: Origin,
    ) -> usize {
        let statement_text = match raw_text {
            Some(text) if action_kind.carries_text() => normalize_statement(text),
            _ => String::new(),
        };

        let position = self.events.len();
        let sequence_index = position + 1;
        self.events.push(QueryEvent {
            sequence_index,
            action_kind,
            statement_text,
            parameters,
            origin,
            duration_micros: None,
        });

        if action_kind.is_reconcilable() {
            self.reconcilable.push(position);
        }

        sequence_index
    }

    /// Apply a batch of profiling samples.
    pub fn reconcile<I>(&mut self, reconciler: &Reconciler, samples: I) -> ReconcileSummary
    where
        I: IntoIterator<Item = RawSample>,
    {
        reconciler.apply(self, samples)
    }

    /// Sum of every known duration; unreconciled events count as zero.
    pub fn total_duration(&self) -> u64 {
        self.events
            .iter()
            .filter_map(|event| event.duration_micros)
            .sum()
    }

    /// Events in log order.
    pub fn entries(&self) -> std::slice::Iter<'_, QueryEvent> {
        self.events.iter()
    }

    /// Look up an event by its one-based sequence index.
    pub fn get(&self, sequence_index: usize) -> Option<&QueryEvent> {
        sequence_index
            .checked_sub(1)
            .and_then(|position| self.events.get(position))
    }

    /// Event holding the given one-based reconcilable ordinal.
    pub(crate) fn by_ordinal_mut(&mut self, ordinal: u64) -> Option<&mut QueryEvent> {
        let slot = usize::try_from(ordinal.checked_sub(1)?).ok()?;
        let position = *self.reconcilable.get(slot)?;
        self.events.get_mut(position)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events the server is expected to profile.
    pub fn reconcilable_count(&self) -> usize {
        self.reconcilable.len()
    }

    /// Number of reconcilable events still waiting for a duration.
    pub fn pending_count(&self) -> usize {
        self.reconcilable
            .iter()
            .filter(|&&position| self.events[position].duration_micros.is_none())
            .count()
    }

    pub fn to_vec(&self) -> Vec<QueryEvent> {
        self.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_assigns_one_based_indices() {
        let mut log = EventLog::new();
        let first = log.append(ActionKind::Execute, Some("SELECT 1"), None, Origin::unknown());
        let second = log.append(ActionKind::Query, Some("SELECT 2"), None, Origin::unknown());

        assert_eq!((first, second), (1, 2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(2).map(|e| e.statement_text.as_str()), Some("SELECT 2"));
        assert!(log.get(0).is_none());
    }

    #[test]
    fn test_append_normalizes_text() {
        let mut log = EventLog::new();
        log.append(
            ActionKind::Execute,
            Some("UPDATE users\n   SET name = ?\n WHERE id = ?"),
            Some(vec![json!("ann"), json!(7)]),
            Origin::new("src/users.rs", 12),
        );

        let event = log.get(1).unwrap();
        assert_eq!(event.statement_text, "UPDATE users SET name = ? WHERE id = ?");
        assert_eq!(event.parameters, Some(vec![json!("ann"), json!(7)]));
        assert_eq!(event.origin, Origin::new("src/users.rs", 12));
        assert_eq!(event.duration_micros, None);
    }

    #[test]
    fn test_transaction_control_has_no_text() {
        let mut log = EventLog::new();
        log.append(ActionKind::BeginTransaction, Some("BEGIN"), None, Origin::unknown());
        assert_eq!(log.get(1).unwrap().statement_text, "");
    }

    #[test]
    fn test_prepare_takes_no_ordinal() {
        let mut log = EventLog::new();
        log.append(ActionKind::Execute, Some("SELECT 1"), None, Origin::unknown());
        log.append(ActionKind::Prepare, Some("SELECT ?"), None, Origin::unknown());
        log.append(ActionKind::Execute, Some("SELECT 3"), None, Origin::unknown());

        assert_eq!(log.reconcilable_count(), 2);
        assert_eq!(log.by_ordinal_mut(2).map(|e| e.sequence_index), Some(3));
        assert!(log.by_ordinal_mut(0).is_none());
        assert!(log.by_ordinal_mut(3).is_none());
    }

    #[test]
    fn test_total_duration_treats_unset_as_zero() {
        let mut log = EventLog::new();
        assert_eq!(log.total_duration(), 0);

        for _ in 0..3 {
            log.append(ActionKind::Query, Some("SELECT 1"), None, Origin::unknown());
        }
        log.by_ordinal_mut(1).unwrap().duration_micros = Some(250);
        log.by_ordinal_mut(3).unwrap().duration_micros = Some(1_000);

        assert_eq!(log.total_duration(), 1_250);
        assert_eq!(log.pending_count(), 1);
    }

    #[test]
    fn test_entries_are_restartable() {
        let mut log = EventLog::new();
        log.append(ActionKind::Query, Some("SELECT 1"), None, Origin::unknown());
        log.append(ActionKind::Commit, None, None, Origin::unknown());

        let entries = log.entries();
        let kinds: Vec<_> = entries.clone().map(|e| e.action_kind).collect();
        assert_eq!(kinds, vec![ActionKind::Query, ActionKind::Commit]);
        assert_eq!(entries.count(), 2);
    }
}
