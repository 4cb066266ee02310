//! Recorded query events.

use serde::Serialize;

/// A single bind value as it is stored and dumped in reports.
pub type BindValue = serde_json::Value;

/// Kind of driver action that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Execute,
    Query,
    /// Statement prepared but not yet executed. Kept for traceability only.
    Prepare,
    BeginTransaction,
    Commit,
    Rollback,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Execute => "EXECUTE",
            ActionKind::Query => "QUERY",
            ActionKind::Prepare => "PREPARE",
            ActionKind::BeginTransaction => "BEGIN_TRANSACTION",
            ActionKind::Commit => "COMMIT",
            ActionKind::Rollback => "ROLLBACK",
        }
    }

    /// Whether the server produces a profiling sample for this action.
    pub fn is_reconcilable(&self) -> bool {
        !matches!(self, ActionKind::Prepare)
    }

    /// Transaction control actions carry no statement text of their own; the
    /// text is back-filled from the profiling echo.
    pub fn carries_text(&self) -> bool {
        matches!(
            self,
            ActionKind::Execute | ActionKind::Query | ActionKind::Prepare
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Call site of an instrumented action.
///
/// The core never inspects the stack. Callers pass an origin explicitly, or
/// capture one at the boundary with [`Origin::caller`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Origin {
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Origin {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: Some(file.into()),
            line: Some(line),
        }
    }

    /// An origin that was not captured.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Capture the location of the function calling this one.
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self::new(location.file(), location.line())
    }

    pub fn is_known(&self) -> bool {
        self.file.is_some()
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{} ({})", file, line),
            (Some(file), None) => write!(f, "{}", file),
            _ => write!(f, "unknown"),
        }
    }
}

/// One instrumented action in the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEvent {
    /// One-based position in the log.
    pub sequence_index: usize,
    pub action_kind: ActionKind,
    /// Normalized text. Empty until back-filled for actions without text.
    pub statement_text: String,
    pub parameters: Option<Vec<BindValue>>,
    pub origin: Origin,
    pub duration_micros: Option<u64>,
}

impl QueryEvent {
    pub fn is_reconciled(&self) -> bool {
        self.duration_micros.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_is_not_reconcilable() {
        assert!(!ActionKind::Prepare.is_reconcilable());
        assert!(ActionKind::Execute.is_reconcilable());
        assert!(ActionKind::Commit.is_reconcilable());
    }

    #[test]
    fn test_transaction_control_carries_no_text() {
        assert!(!ActionKind::BeginTransaction.carries_text());
        assert!(!ActionKind::Rollback.carries_text());
        assert!(ActionKind::Query.carries_text());
    }

    #[test]
    fn test_origin_caller_points_here() {
        let origin = Origin::caller();
        assert_eq!(origin.file.as_deref(), Some(file!()));
        assert_eq!(origin.line, Some(line!() - 2));
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(Origin::new("src/app.rs", 42).to_string(), "src/app.rs (42)");
        assert_eq!(Origin::unknown().to_string(), "unknown");
    }
}
