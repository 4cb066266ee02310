//! MySQL profiling over SeaORM: bootstrap and `SHOW PROFILES` sample source.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, QueryResult, Statement};

use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result};
use crate::reconcile::RawSample;
use crate::session::ProfilingSource;

/// Switches profiling on for the current server session. Not itself profiled.
pub const ENABLE_PROFILING: &str = "SET profiling = 1";

pub const SHOW_PROFILES: &str = "SHOW PROFILES";

/// Switch profiling on and issue the bookkeeping statements.
///
/// Must run on the raw connection before any instrumented statement: every
/// bookkeeping statement consumes one server sequence id, which is exactly
/// the offset the reconciler subtracts.
pub async fn enable_profiling<C>(conn: &C, config: &ProfilerConfig) -> Result<()>
where
    C: ConnectionTrait,
{
    conn.execute_unprepared(ENABLE_PROFILING).await?;
    for statement in config.bookkeeping_statements() {
        conn.execute_unprepared(statement).await?;
    }

    tracing::debug!(
        bookkeeping = config.bookkeeping_statements().len(),
        "MySQL profiling enabled"
    );
    Ok(())
}

/// Reads `SHOW PROFILES` from the raw, uninstrumented connection.
///
/// The connection must reach the same server session the profiled statements
/// run on; share the single-connection pool the profiled connection uses.
#[derive(Debug, Clone)]
pub struct ShowProfiles {
    conn: Arc<DatabaseConnection>,
}

impl ShowProfiles {
    pub fn new(conn: Arc<DatabaseConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProfilingSource for ShowProfiles {
    async fn fetch_samples(&self) -> Result<Vec<RawSample>> {
        let stmt = Statement::from_string(self.conn.get_database_backend(), SHOW_PROFILES);
        let rows = self
            .conn
            .query_all(stmt)
            .await
            .map_err(|e| ProfilerError::source_unavailable(e.to_string()))?;

        Ok(rows.iter().map(sample_from_row).collect())
    }
}

/// Missing or undecodable columns are left empty; the reconciler discards
/// such samples individually.
fn sample_from_row(row: &QueryResult) -> RawSample {
    RawSample {
        server_sequence_id: read_query_id(row),
        duration_micros: read_duration_seconds(row).map(|secs| secs * 1_000_000.0),
        echoed_statement_text: row.try_get::<String>("", "Query").ok(),
    }
}

fn read_query_id(row: &QueryResult) -> Option<i64> {
    row.try_get::<i64>("", "Query_ID")
        .ok()
        .or_else(|| row.try_get::<i32>("", "Query_ID").ok().map(i64::from))
        .or_else(|| row.try_get::<u32>("", "Query_ID").ok().map(i64::from))
}

fn read_duration_seconds(row: &QueryResult) -> Option<f64> {
    row.try_get::<f64>("", "Duration").ok().or_else(|| {
        row.try_get::<String>("", "Duration")
            .ok()
            .and_then(|s| s.trim().parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DbBackend, MockDatabase, MockExecResult, Value};
    use std::collections::BTreeMap;

    fn profile_row(id: i64, seconds: f64, query: &str) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("Query_ID", Value::from(id)),
            ("Duration", Value::from(seconds)),
            ("Query", Value::from(query.to_string())),
        ])
    }

    #[tokio::test]
    async fn test_fetch_converts_seconds_to_micros() {
        let conn = MockDatabase::new(DbBackend::MySql)
            .append_query_results([vec![
                profile_row(1, 0.000_05, "SET profiling_history_size = 100"),
                profile_row(2, 0.0015, "SELECT 1"),
            ]])
            .into_connection();

        let samples = ShowProfiles::new(Arc::new(conn)).fetch_samples().await.unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].server_sequence_id, Some(2));
        assert_eq!(samples[1].duration_micros.map(f64::round), Some(1_500.0));
        assert_eq!(samples[1].echoed_statement_text.as_deref(), Some("SELECT 1"));
    }

    #[tokio::test]
    async fn test_row_missing_columns_yields_empty_fields() {
        let row = BTreeMap::from([("Query", Value::from("SELECT 1".to_string()))]);
        let conn = MockDatabase::new(DbBackend::MySql)
            .append_query_results([vec![row]])
            .into_connection();

        let samples = ShowProfiles::new(Arc::new(conn)).fetch_samples().await.unwrap();

        assert_eq!(samples[0].server_sequence_id, None);
        assert_eq!(samples[0].duration_micros, None);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_source_unavailable() {
        // no query results queued: the mock reports an error
        let conn = MockDatabase::new(DbBackend::MySql).into_connection();

        let err = ShowProfiles::new(Arc::new(conn)).fetch_samples().await.unwrap_err();

        assert!(matches!(err, ProfilerError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_enable_profiling_issues_bookkeeping() {
        let conn = MockDatabase::new(DbBackend::MySql)
            .append_exec_results([
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
            ])
            .into_connection();
        let config = ProfilerConfig::default();

        enable_profiling(&conn, &config).await.unwrap();

        let log = conn.into_transaction_log();
        assert_eq!(log.len(), 2);
    }
}
