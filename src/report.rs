//! Tabular projection of a reconciled event log.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::duration::{format_micros, FormattedDuration};
use crate::event::{ActionKind, QueryEvent};
use crate::log::EventLog;

/// Shown in place of a parameter dump when an event has no parameters.
pub const NO_PARAMETERS: &str = "N/A";

// Text table column widths; continuation lines start under the QUERY column.
const ID_WIDTH: usize = 5;
const ACTION_WIDTH: usize = 18;
const DURATION_WIDTH: usize = 12;
const COLUMN_GAP: &str = "  ";
const QUERY_INDENT: usize = ID_WIDTH + ACTION_WIDTH + DURATION_WIDTH + 3 * COLUMN_GAP.len();

/// Pretty-printer for statement text.
pub trait StatementFormatter: Send + Sync {
    fn pretty_print(&self, text: &str) -> String;
}

/// Leaves statement text untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

impl StatementFormatter for PlainFormatter {
    fn pretty_print(&self, text: &str) -> String {
        text.to_string()
    }
}

static CLAUSE_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\s+((?:INNER|LEFT|RIGHT|CROSS)\s+JOIN|JOIN|FROM|WHERE|GROUP\s+BY|ORDER\s+BY|HAVING|LIMIT|VALUES|SET|UNION)\b",
    )
    .unwrap()
});

/// Starts each major clause on its own line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClauseFormatter;

impl StatementFormatter for ClauseFormatter {
    fn pretty_print(&self, text: &str) -> String {
        CLAUSE_BREAK.replace_all(text, "\n${1}").into_owned()
    }
}

/// One rendered event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub index: usize,
    pub action: ActionKind,
    pub statement: String,
    pub formatted_statement: String,
    /// Pretty JSON dump, or [`NO_PARAMETERS`].
    pub parameters: String,
    pub origin: String,
    pub duration_micros: Option<u64>,
    pub duration: Option<FormattedDuration>,
}

impl ReportRow {
    fn from_event(event: &QueryEvent, formatter: &dyn StatementFormatter) -> Self {
        Self {
            index: event.sequence_index,
            action: event.action_kind,
            statement: event.statement_text.clone(),
            formatted_statement: formatter.pretty_print(&event.statement_text),
            parameters: dump_parameters(event.parameters.as_deref()),
            origin: event.origin.to_string(),
            duration_micros: event.duration_micros,
            duration: event.duration_micros.map(format_micros),
        }
    }
}

fn dump_parameters(parameters: Option<&[serde_json::Value]>) -> String {
    match parameters {
        Some(values) if !values.is_empty() => serde_json::to_string_pretty(values)
            .unwrap_or_else(|_| NO_PARAMETERS.to_string()),
        _ => NO_PARAMETERS.to_string(),
    }
}

/// Rendered event log with an aggregate footer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub rows: Vec<ReportRow>,
    pub total_micros: u64,
    pub total: FormattedDuration,
}

impl Report {
    /// Render the log exactly as it stands, in log order.
    ///
    /// With `omit_pending_prepares`, PREPARE events that never received a
    /// duration are left out.
    pub fn build(
        log: &EventLog,
        formatter: &dyn StatementFormatter,
        omit_pending_prepares: bool,
    ) -> Self {
        let rows = log
            .entries()
            .filter(|event| {
                !(omit_pending_prepares
                    && event.action_kind == ActionKind::Prepare
                    && event.duration_micros.is_none())
            })
            .map(|event| ReportRow::from_event(event, formatter))
            .collect();

        let total_micros = log.total_duration();
        Self {
            rows,
            total_micros,
            total: format_micros(total_micros),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:>iw$}{gap}{:<aw$}{gap}{:<dw$}{gap}QUERY",
            "ID",
            "ACTION",
            "DURATION",
            iw = ID_WIDTH,
            aw = ACTION_WIDTH,
            dw = DURATION_WIDTH,
            gap = COLUMN_GAP,
        )?;
        let pad = " ".repeat(QUERY_INDENT);

        for row in &self.rows {
            let duration = row
                .duration
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:>iw$}{gap}{:<aw$}{gap}{:<dw$}{gap}{}",
                row.index,
                row.action.as_str(),
                duration,
                row.statement,
                iw = ID_WIDTH,
                aw = ACTION_WIDTH,
                dw = DURATION_WIDTH,
                gap = COLUMN_GAP,
            )?;

            if row.parameters != NO_PARAMETERS {
                for line in row.parameters.lines() {
                    writeln!(f, "{}{}", pad, line)?;
                }
            }
            writeln!(f, "{}at {}", pad, row.origin)?;
        }

        writeln!(
            f,
            "{:>iw$}{gap}{:<aw$}{gap}{}",
            "",
            "TOTAL",
            self.total,
            iw = ID_WIDTH,
            aw = ACTION_WIDTH,
            gap = COLUMN_GAP,
        )
    }
}
