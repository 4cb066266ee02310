//! Profiled database connection wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, TransactionError, TransactionTrait, Value,
};
use serde_json::json;
use tracing::{field, Instrument, Span};

use crate::config::ProfilerConfig;
use crate::error::Result;
use crate::event::{ActionKind, BindValue, Origin, QueryEvent};
use crate::log::EventLog;
use crate::mysql::{enable_profiling, ShowProfiles};
use crate::parser::SqlOperation;
use crate::report::{Report, StatementFormatter};
use crate::session::{Call, ProfilingSession};

type Session = ProfilingSession<ShowProfiles>;

/// A SeaORM connection whose statements are logged and timed by the server.
///
/// Implements `ConnectionTrait`, so entities and raw statements run through
/// it as through a `DatabaseConnection`. Every call that reaches the server
/// is appended to the session's event log, failed ones included; durations
/// arrive later from `SHOW PROFILES`.
///
/// Correlation is positional, so everything must run on one server session:
/// connect with a pool of exactly one connection, and do not use the
/// connection from other tasks while a transaction is open.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::{ConnectOptions, Database};
/// use sea_orm_profiler::{Origin, ProfiledConnection, ProfilerConfig};
///
/// let mut options = ConnectOptions::new("mysql://localhost/app");
/// options.max_connections(1);
/// let db = ProfiledConnection::connect(Database::connect(options).await?, ProfilerConfig::default()).await?;
///
/// let users = Users::find().all(&db.at(Origin::caller())).await?;
///
/// let log = db.close().await;
/// ```
#[derive(Debug, Clone)]
pub struct ProfiledConnection {
    inner: Arc<DatabaseConnection>,
    session: Arc<Session>,
    origin: Option<Origin>,
}

impl ProfiledConnection {
    /// Enable server-side profiling on `connection` and start a session.
    pub async fn connect(connection: DatabaseConnection, config: ProfilerConfig) -> Result<Self> {
        config.validate()?;
        enable_profiling(&connection, &config).await?;

        let connection = Arc::new(connection);
        let session = ProfilingSession::new(ShowProfiles::new(connection.clone()), config)?;
        Ok(Self {
            inner: connection,
            session: Arc::new(session),
            origin: None,
        })
    }

    /// A handle that attributes its calls to `origin`.
    ///
    /// Shares the session with `self`.
    pub fn at(&self, origin: Origin) -> Self {
        Self {
            inner: self.inner.clone(),
            session: self.session.clone(),
            origin: Some(origin),
        }
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    pub fn session(&self) -> &ProfilingSession<ShowProfiles> {
        &self.session
    }

    pub fn config(&self) -> &ProfilerConfig {
        self.session.config()
    }

    /// Reconcile and return every recorded event.
    ///
    /// Fails with `TransactionOpen` while a [`ProfiledTransaction`] is alive.
    pub async fn get_log(&self) -> Result<Vec<QueryEvent>> {
        self.session.get_log().await
    }

    /// Reconcile and render the log.
    pub async fn render_report(&self, formatter: &dyn StatementFormatter) -> Result<Report> {
        self.session.render_report(formatter).await
    }

    /// Run the final reconciliation. Safe to call from every clone; only the
    /// first call reconciles.
    pub async fn close(&self) -> EventLog {
        self.session.close().await
    }

    /// Begin a profiled transaction.
    pub async fn begin(&self) -> std::result::Result<ProfiledTransaction, DbErr> {
        self.begin_with_config(None, None).await
    }

    pub async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> std::result::Result<ProfiledTransaction, DbErr> {
        let span = tracing::info_span!(
            "db.transaction",
            otel.name = "BEGIN",
            db.system = %db_system(self.inner.get_database_backend()),
            db.operation = "BEGIN",
            db.transaction.isolation_level = ?isolation_level,
            db.transaction.access_mode = ?access_mode,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        );

        // the transaction owns the connection from here on
        let scope = OpenTransaction::new(self.session.clone(), self.origin());
        let result = self
            .begin_recorded(isolation_level, access_mode)
            .instrument(span.clone())
            .await;
        record_status(&span, &result);

        match result {
            Ok(inner) => Ok(ProfiledTransaction {
                inner,
                scope,
                config: self.session.config().clone(),
                origin: self.origin.clone(),
            }),
            Err(e) => {
                scope.finish();
                Err(e)
            }
        }
    }

    /// MySQL numbers `SET TRANSACTION` separately from `BEGIN`, so on MySQL
    /// the characteristics are set through the recorder first and `BEGIN`
    /// is issued without them.
    async fn begin_recorded(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> std::result::Result<DatabaseTransaction, DbErr> {
        let backend = self.inner.get_database_backend();
        let (isolation_level, access_mode) = match set_transaction_sql(isolation_level, access_mode)
        {
            Some(sql) if backend == DbBackend::MySql => {
                let stmt = Statement::from_string(backend, sql);
                let op = self.inner.execute(stmt.clone());
                self.recorder()
                    .run(ActionKind::Execute, &stmt, op, ExecResult::rows_affected)
                    .await?;
                (None, None)
            }
            _ => (isolation_level, access_mode),
        };

        let call = Call::begin().at(self.origin());
        let begin = self.inner.begin_with_config(isolation_level, access_mode);
        self.session
            .instrument_filtered(call, begin, reached_server)
            .await
    }

    /// Run `callback` in a profiled transaction, committing on `Ok` and
    /// rolling back on `Err`.
    pub async fn transaction<F, T, E>(
        &self,
        callback: F,
    ) -> std::result::Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c ProfiledTransaction,
            ) -> Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let txn = self.begin().await.map_err(TransactionError::Connection)?;
        match callback(&txn).await {
            Ok(value) => {
                txn.commit().await.map_err(TransactionError::Connection)?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback().await.map_err(TransactionError::Connection)?;
                Err(TransactionError::Transaction(e))
            }
        }
    }

    fn origin(&self) -> Origin {
        self.origin.clone().unwrap_or_default()
    }

    fn recorder(&self) -> Recorder<'_> {
        Recorder {
            session: &self.session,
            config: self.session.config(),
            backend: self.inner.get_database_backend(),
            origin: self.origin(),
        }
    }
}

fn set_transaction_sql(
    isolation_level: Option<IsolationLevel>,
    access_mode: Option<AccessMode>,
) -> Option<String> {
    let settings: Vec<String> = isolation_level
        .map(|level| format!("ISOLATION LEVEL {level}"))
        .into_iter()
        .chain(access_mode.map(|mode| mode.to_string()))
        .collect();

    if settings.is_empty() {
        None
    } else {
        Some(format!("SET TRANSACTION {}", settings.join(", ")))
    }
}

/// A transaction opened through a [`ProfiledConnection`].
///
/// The session counts it as open from before `BEGIN` until `commit`,
/// `rollback` or drop. Flushes falling due meanwhile are held, since
/// the sample fetch needs the connection the transaction owns. Dropping it
/// without `commit` or `rollback` records the ROLLBACK the server runs.
pub struct ProfiledTransaction {
    inner: DatabaseTransaction,
    scope: OpenTransaction,
    config: ProfilerConfig,
    origin: Option<Origin>,
}

impl ProfiledTransaction {
    fn recorder(&self) -> Recorder<'_> {
        Recorder {
            session: &self.scope.session,
            config: &self.config,
            backend: self.inner.get_database_backend(),
            origin: self.origin.clone().unwrap_or_default(),
        }
    }

    pub async fn commit(self) -> std::result::Result<(), DbErr> {
        let backend = self.inner.get_database_backend();
        let call = Call::commit().at(self.origin.unwrap_or_default());
        let session = self.scope.finish();
        let span = transaction_end_span("COMMIT", backend);
        let result = session
            .instrument_filtered(call, self.inner.commit(), reached_server)
            .instrument(span.clone())
            .await;
        record_status(&span, &result);
        result
    }

    pub async fn rollback(self) -> std::result::Result<(), DbErr> {
        let backend = self.inner.get_database_backend();
        let call = Call::rollback().at(self.origin.unwrap_or_default());
        let session = self.scope.finish();
        let span = transaction_end_span("ROLLBACK", backend);
        let result = session
            .instrument_filtered(call, self.inner.rollback(), reached_server)
            .instrument(span.clone())
            .await;
        record_status(&span, &result);
        result
    }
}

/// Keeps the session's open-transaction count for one transaction.
struct OpenTransaction {
    session: Arc<Session>,
    origin: Origin,
    finished: bool,
}

impl OpenTransaction {
    fn new(session: Arc<Session>, origin: Origin) -> Self {
        session.transaction_opened();
        Self {
            session,
            origin,
            finished: false,
        }
    }

    fn finish(mut self) -> Arc<Session> {
        self.finished = true;
        self.session.transaction_closed();
        self.session.clone()
    }
}

impl Drop for OpenTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Profiled transaction dropped without commit or rollback");
            self.session
                .record_detached(Call::rollback().at(self.origin.clone()));
            self.session.transaction_closed();
        }
    }
}

impl std::fmt::Debug for ProfiledTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfiledTransaction")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

fn transaction_end_span(operation: &'static str, backend: DbBackend) -> Span {
    tracing::info_span!(
        "db.transaction",
        otel.name = operation,
        db.system = %db_system(backend),
        db.operation = operation,
        otel.status_code = field::Empty,
        error.message = field::Empty,
    )
}

/// Shared instrumentation for the connection and the transaction.
struct Recorder<'a> {
    session: &'a Session,
    config: &'a ProfilerConfig,
    backend: DbBackend,
    origin: Origin,
}

impl Recorder<'_> {
    fn call(&self, kind: ActionKind, stmt: &Statement) -> Call {
        let mut call = Call::new(kind, Some(stmt.sql.clone())).at(self.origin.clone());
        if let Some(values) = &stmt.values {
            call = call.with_parameters(values.0.iter().map(bind_value).collect());
        }
        call
    }

    fn create_span(&self, call: &Call) -> Span {
        let text = call.text.as_deref().unwrap_or_default();
        let operation = SqlOperation::parse(text);

        let span = tracing::info_span!(
            "db.query",
            otel.name = %operation,
            db.system = %db_system(self.backend),
            db.operation = %operation.as_str(),
            db.action = %call.kind,
            db.statement = field::Empty,
            db.parameters = field::Empty,
            db.rows_affected = field::Empty,
            db.client_duration_ms = field::Empty,
            db.name = field::Empty,
            code.filepath = field::Empty,
            code.lineno = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        );

        if let Some(db_name) = &self.config.database_name {
            span.record("db.name", db_name.as_str());
        }
        if self.config.log_statements {
            span.record("db.statement", text);
        }
        if self.config.log_parameters {
            if let Some(parameters) = &call.parameters {
                span.record("db.parameters", json!(parameters).to_string().as_str());
            }
        }
        if let (Some(file), Some(line)) = (&call.origin.file, call.origin.line) {
            span.record("code.filepath", file.as_str());
            span.record("code.lineno", line);
        }

        span
    }

    async fn run<F, T>(
        &self,
        kind: ActionKind,
        stmt: &Statement,
        op: F,
        row_count: impl FnOnce(&T) -> u64,
    ) -> std::result::Result<T, DbErr>
    where
        F: Future<Output = std::result::Result<T, DbErr>>,
    {
        let call = self.call(kind, stmt);
        let span = self.create_span(&call);
        let start = Instant::now();

        let result = self
            .session
            .instrument_filtered(call, op, reached_server)
            .instrument(span.clone())
            .await;

        span.record("db.client_duration_ms", start.elapsed().as_millis() as i64);
        if let Ok(value) = &result {
            span.record("db.rows_affected", row_count(value));
        }
        record_status(&span, &result);

        result
    }
}

fn record_status<T>(span: &Span, result: &std::result::Result<T, DbErr>) {
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(e) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", e.to_string().as_str());
            tracing::error!(parent: span, error = %e, "Database query failed");
        }
    }
}

/// Errors raised before a statement could be sent; the server never
/// numbered it.
fn reached_server(err: &DbErr) -> bool {
    !matches!(err, DbErr::ConnectionAcquire(_) | DbErr::Conn(_))
}

fn db_system(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Postgres => "postgresql",
        DbBackend::MySql => "mysql",
        DbBackend::Sqlite => "sqlite",
    }
}

/// Convert a SeaORM bind value for the log and the parameter dump.
pub(crate) fn bind_value(value: &Value) -> BindValue {
    match value {
        Value::Bool(v) => json!(v),
        Value::TinyInt(v) => json!(v),
        Value::SmallInt(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::BigInt(v) => json!(v),
        Value::TinyUnsigned(v) => json!(v),
        Value::SmallUnsigned(v) => json!(v),
        Value::Unsigned(v) => json!(v),
        Value::BigUnsigned(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(Some(s)) => json!(s.as_str()),
        Value::String(None) => BindValue::Null,
        Value::Char(v) => json!(v),
        Value::Bytes(Some(bytes)) => json!(String::from_utf8_lossy(bytes)),
        Value::Bytes(None) => BindValue::Null,
        other => json!(format!("{:?}", other)),
    }
}

#[async_trait]
impl ConnectionTrait for ProfiledConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> std::result::Result<ExecResult, DbErr> {
        let op = self.inner.execute(stmt.clone());
        self.recorder()
            .run(ActionKind::Execute, &stmt, op, ExecResult::rows_affected)
            .await
    }

    async fn execute_unprepared(&self, sql: &str) -> std::result::Result<ExecResult, DbErr> {
        let stmt = Statement::from_string(self.get_database_backend(), sql);
        let op = self.inner.execute_unprepared(sql);
        self.recorder()
            .run(ActionKind::Execute, &stmt, op, ExecResult::rows_affected)
            .await
    }

    async fn query_one(&self, stmt: Statement) -> std::result::Result<Option<QueryResult>, DbErr> {
        let op = self.inner.query_one(stmt.clone());
        self.recorder()
            .run(ActionKind::Query, &stmt, op, |row: &Option<QueryResult>| {
                u64::from(row.is_some())
            })
            .await
    }

    async fn query_all(&self, stmt: Statement) -> std::result::Result<Vec<QueryResult>, DbErr> {
        let op = self.inner.query_all(stmt.clone());
        self.recorder()
            .run(ActionKind::Query, &stmt, op, |rows: &Vec<QueryResult>| rows.len() as u64)
            .await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl ConnectionTrait for ProfiledTransaction {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> std::result::Result<ExecResult, DbErr> {
        let op = self.inner.execute(stmt.clone());
        self.recorder()
            .run(ActionKind::Execute, &stmt, op, ExecResult::rows_affected)
            .await
    }

    async fn execute_unprepared(&self, sql: &str) -> std::result::Result<ExecResult, DbErr> {
        let stmt = Statement::from_string(self.get_database_backend(), sql);
        let op = self.inner.execute_unprepared(sql);
        self.recorder()
            .run(ActionKind::Execute, &stmt, op, ExecResult::rows_affected)
            .await
    }

    async fn query_one(&self, stmt: Statement) -> std::result::Result<Option<QueryResult>, DbErr> {
        let op = self.inner.query_one(stmt.clone());
        self.recorder()
            .run(ActionKind::Query, &stmt, op, |row: &Option<QueryResult>| {
                u64::from(row.is_some())
            })
            .await
    }

    async fn query_all(&self, stmt: Statement) -> std::result::Result<Vec<QueryResult>, DbErr> {
        let op = self.inner.query_all(stmt.clone());
        self.recorder()
            .run(ActionKind::Query, &stmt, op, |rows: &Vec<QueryResult>| rows.len() as u64)
            .await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

/// Extension trait for wrapping a connection in a profiling session.
#[async_trait]
pub trait ProfilingExt {
    /// Enable profiling with the default configuration.
    async fn with_profiling(self) -> Result<ProfiledConnection>;

    async fn with_profiling_config(self, config: ProfilerConfig) -> Result<ProfiledConnection>;
}

#[async_trait]
impl ProfilingExt for DatabaseConnection {
    async fn with_profiling(self) -> Result<ProfiledConnection> {
        ProfiledConnection::connect(self, ProfilerConfig::default()).await
    }

    async fn with_profiling_config(self, config: ProfilerConfig) -> Result<ProfiledConnection> {
        ProfiledConnection::connect(self, config).await
    }
}
