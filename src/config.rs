//! Configuration for profiling sessions.

use std::time::Duration;

use crate::error::{ProfilerError, Result};
use crate::parser::normalize_statement;

const DEFAULT_FLUSH_THRESHOLD: usize = 100;
const DEFAULT_HISTORY_SIZE: u32 = 100;

/// Configuration options for a profiling session.
///
/// # Example
///
/// ```rust
/// use sea_orm_profiler::ProfilerConfig;
/// use std::time::Duration;
///
/// let config = ProfilerConfig::default()
///     .with_flush_threshold(50)
///     .with_slow_query_threshold(Duration::from_millis(100));
///
/// assert_eq!(config.bookkeeping_offset(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Reconcile after every N reconcilable events.
    /// Default: 100 (the largest profiling history MySQL keeps)
    pub flush_threshold: usize,

    /// Server-side history size requested by the bootstrap.
    /// Default: 100
    pub profiling_history_size: u32,

    /// Setup statements issued through the raw connection after profiling is
    /// switched on. Each one takes a server sequence id before the first user
    /// statement, and samples echoing one of them are never attributed.
    bookkeeping_statements: Vec<String>,

    /// Explicit offset, overriding the count of bookkeeping statements.
    bookkeeping_offset: Option<u64>,

    /// Leave PREPARE-only events without a duration out of reports.
    /// Default: `true`
    pub omit_pending_prepares: bool,

    /// Whether to include the SQL statement in spans.
    /// Default: `false`
    pub log_statements: bool,

    /// Whether to include bind parameters in spans.
    /// Default: `false`
    pub log_parameters: bool,

    /// Reconciled durations above this are logged at WARN.
    /// Default: 500ms
    pub slow_query_threshold: Duration,

    /// Database name recorded on spans.
    pub database_name: Option<String>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            profiling_history_size: DEFAULT_HISTORY_SIZE,
            bookkeeping_statements: vec![history_size_statement(DEFAULT_HISTORY_SIZE)],
            bookkeeping_offset: None,
            omit_pending_prepares: true,
            log_statements: false,
            log_parameters: false,
            slow_query_threshold: Duration::from_millis(500),
            database_name: None,
        }
    }
}

fn history_size_statement(size: u32) -> String {
    format!("SET profiling_history_size = {}", size)
}

impl ProfilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many reconcilable events trigger an automatic reconciliation.
    ///
    /// Keep this at or below the profiling history size, otherwise samples
    /// roll out of the server history before they are fetched.
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Set the server-side profiling history size. This rewrites the
    /// history-size bookkeeping statement to match.
    pub fn with_profiling_history_size(mut self, size: u32) -> Self {
        let old = history_size_statement(self.profiling_history_size);
        let new = history_size_statement(size);
        for statement in &mut self.bookkeeping_statements {
            if *statement == old {
                *statement = new.clone();
            }
        }
        self.profiling_history_size = size;
        self
    }

    /// Replace the bookkeeping statements issued before user instrumentation.
    pub fn with_bookkeeping_statements<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bookkeeping_statements = statements.into_iter().map(Into::into).collect();
        self
    }

    /// Override the derived offset between server sequence ids and event
    /// ordinals.
    pub fn with_bookkeeping_offset(mut self, offset: u64) -> Self {
        self.bookkeeping_offset = Some(offset);
        self
    }

    /// Include (or omit) pending PREPARE events in reports.
    pub fn with_omit_pending_prepares(mut self, omit: bool) -> Self {
        self.omit_pending_prepares = omit;
        self
    }

    /// Enable or disable SQL statement logging in spans.
    ///
    /// **Security Warning**: statement text may carry sensitive literals.
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    /// Enable or disable parameter logging in spans.
    ///
    /// **Security Warning**: parameters often contain user input.
    pub fn with_parameter_logging(mut self, enabled: bool) -> Self {
        self.log_parameters = enabled;
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    pub fn bookkeeping_statements(&self) -> &[String] {
        &self.bookkeeping_statements
    }

    /// Number of server sequence ids consumed before the first user event.
    ///
    /// Derived from the bookkeeping statements unless overridden.
    pub fn bookkeeping_offset(&self) -> u64 {
        self.bookkeeping_offset
            .unwrap_or(self.bookkeeping_statements.len() as u64)
    }

    /// Normalized bookkeeping texts, the reserved signatures the reconciler
    /// refuses to attribute.
    pub fn reserved_signatures(&self) -> Vec<String> {
        self.bookkeeping_statements
            .iter()
            .map(|s| normalize_statement(s))
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold == 0 {
            return Err(ProfilerError::invalid_config(
                "flush_threshold must be at least 1",
            ));
        }
        if self.profiling_history_size == 0 {
            return Err(ProfilerError::invalid_config(
                "profiling_history_size must be at least 1",
            ));
        }
        Ok(())
    }

    /// Full logging, short slow-query threshold.
    ///
    /// **Warning**: Do not use in production as it logs all SQL and parameters.
    pub fn development() -> Self {
        Self {
            log_statements: true,
            log_parameters: true,
            slow_query_threshold: Duration::from_millis(100),
            omit_pending_prepares: false,
            ..Self::default()
        }
    }

    pub fn production() -> Self {
        Self {
            log_statements: false,
            log_parameters: false,
            slow_query_threshold: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_offset_is_derived() {
        let config = ProfilerConfig::default();
        assert_eq!(config.flush_threshold, 100);
        assert_eq!(config.bookkeeping_offset(), 1);
        assert_eq!(
            config.reserved_signatures(),
            vec!["SET profiling_history_size = 100".to_string()]
        );
    }

    #[test]
    fn test_offset_follows_statements() {
        let config = ProfilerConfig::default()
            .with_bookkeeping_statements(["SET a = 1", "SET b = 2"]);
        assert_eq!(config.bookkeeping_offset(), 2);

        let config = config.with_bookkeeping_offset(0);
        assert_eq!(config.bookkeeping_offset(), 0);
    }

    #[test]
    fn test_history_size_rewrites_statement() {
        let config = ProfilerConfig::default().with_profiling_history_size(50);
        assert_eq!(
            config.bookkeeping_statements(),
            &["SET profiling_history_size = 50".to_string()]
        );
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = ProfilerConfig::default()
            .with_flush_threshold(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ProfilerError::InvalidConfig { .. }));
    }

    #[test]
    fn test_presets() {
        let dev = ProfilerConfig::development();
        assert!(dev.log_statements);
        assert!(dev.log_parameters);
        assert!(!dev.omit_pending_prepares);

        let prod = ProfilerConfig::production();
        assert!(!prod.log_statements);
        assert_eq!(prod.slow_query_threshold, Duration::from_secs(1));
    }
}
