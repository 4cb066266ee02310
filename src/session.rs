//! Profiling session: the serialized owner of one event log.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result};
use crate::event::{ActionKind, BindValue, Origin, QueryEvent};
use crate::flush::FlushTrigger;
use crate::log::EventLog;
use crate::reconcile::{RawSample, ReconcileSummary, Reconciler};
use crate::report::{Report, StatementFormatter};

/// Source of server-side profiling samples.
///
/// Fetches are cumulative: every call returns the samples the server still
/// holds, including those returned before.
#[async_trait]
pub trait ProfilingSource: Send + Sync {
    async fn fetch_samples(&self) -> Result<Vec<RawSample>>;
}

#[async_trait]
impl<T: ProfilingSource + ?Sized> ProfilingSource for Arc<T> {
    async fn fetch_samples(&self) -> Result<Vec<RawSample>> {
        (**self).fetch_samples().await
    }
}

/// Something that runs statements. The session only observes it.
#[async_trait]
pub trait Transport: Send + Sync {
    type Output: Send;
    type Error: Send;

    async fn execute(
        &self,
        kind: ActionKind,
        text: Option<&str>,
        parameters: Option<&[BindValue]>,
    ) -> std::result::Result<Self::Output, Self::Error>;
}

/// Description of one action about to be instrumented.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: ActionKind,
    pub text: Option<String>,
    pub parameters: Option<Vec<BindValue>>,
    pub origin: Origin,
}

impl Call {
    pub fn new(kind: ActionKind, text: Option<String>) -> Self {
        Self {
            kind,
            text,
            parameters: None,
            origin: Origin::unknown(),
        }
    }

    pub fn execute(text: impl Into<String>) -> Self {
        Self::new(ActionKind::Execute, Some(text.into()))
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self::new(ActionKind::Query, Some(text.into()))
    }

    pub fn prepare(text: impl Into<String>) -> Self {
        Self::new(ActionKind::Prepare, Some(text.into()))
    }

    pub fn begin() -> Self {
        Self::new(ActionKind::BeginTransaction, None)
    }

    pub fn commit() -> Self {
        Self::new(ActionKind::Commit, None)
    }

    pub fn rollback() -> Self {
        Self::new(ActionKind::Rollback, None)
    }

    pub fn with_parameters(mut self, parameters: Vec<BindValue>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn at(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }
}

#[derive(Debug)]
struct SessionState {
    log: EventLog,
    trigger: FlushTrigger,
}

/// One instrumented connection's worth of profiling state.
///
/// Every transport call, append and reconciliation runs under a single
/// mutex, so the log order matches the order the server numbers statements
/// in. Call [`close`](Self::close) when the connection is done to flush the
/// final partial batch.
///
/// While a transaction is open (see
/// [`transaction_opened`](Self::transaction_opened)) no samples are fetched:
/// automatic flushes are held and explicit ones fail with
/// [`ProfilerError::TransactionOpen`].
pub struct ProfilingSession<S> {
    source: S,
    config: ProfilerConfig,
    reconciler: Reconciler,
    state: Mutex<SessionState>,
    open_transactions: AtomicUsize,
    /// Actions the server ran without a call to wrap, appended before the
    /// next recorded action.
    detached: SyncMutex<Vec<Call>>,
}

impl<S: ProfilingSource> ProfilingSession<S> {
    pub fn new(source: S, config: ProfilerConfig) -> Result<Self> {
        config.validate()?;

        tracing::debug!(
            flush_threshold = config.flush_threshold,
            bookkeeping_offset = config.bookkeeping_offset(),
            "Starting profiling session"
        );

        Ok(Self {
            source,
            reconciler: Reconciler::from_config(&config),
            state: Mutex::new(SessionState {
                log: EventLog::new(),
                trigger: FlushTrigger::new(config.flush_threshold),
            }),
            open_transactions: AtomicUsize::new(0),
            detached: SyncMutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run `op` as the transport call described by `call` and record it.
    ///
    /// The transport result is returned unchanged. Failed calls are recorded
    /// too, since the server numbers a statement that reached it whether or
    /// not it succeeded. A failing automatic reconciliation is logged, not
    /// returned.
    pub async fn instrument<F, T, E>(&self, call: Call, op: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        self.record(call, op, false, |_: &E| true).await
    }

    /// Like [`instrument`](Self::instrument), but a failed call is only
    /// recorded when `reached_server` says the statement got to the server.
    pub async fn instrument_filtered<F, T, E, R>(
        &self,
        call: Call,
        op: F,
        reached_server: R,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        R: FnOnce(&E) -> bool,
    {
        self.record(call, op, false, reached_server).await
    }

    /// Like [`instrument`](Self::instrument), but a flush falling due is
    /// held until a later call. Used while a transaction owns the
    /// connection the samples would be fetched over.
    pub async fn instrument_holding_flush<F, T, E>(
        &self,
        call: Call,
        op: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        self.record(call, op, true, |_: &E| true).await
    }

    /// Run `call` through `transport` and record it.
    pub async fn execute<T: Transport>(
        &self,
        transport: &T,
        call: Call,
    ) -> std::result::Result<T::Output, T::Error> {
        let op = transport.execute(call.kind, call.text.as_deref(), call.parameters.as_deref());
        self.record(call.clone(), op, false, |_: &T::Error| true).await
    }

    /// Mark a transaction as open. Until the matching
    /// [`transaction_closed`](Self::transaction_closed), no samples are
    /// fetched over the connection the transaction owns.
    pub fn transaction_opened(&self) {
        self.open_transactions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn transaction_closed(&self) {
        let _ = self
            .open_transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn has_open_transaction(&self) -> bool {
        self.open_transactions.load(Ordering::SeqCst) > 0
    }

    /// Queue an action the server ran on its own, such as the ROLLBACK of a
    /// transaction dropped while still open. It is appended ahead of the
    /// next recorded action or fetch.
    pub fn record_detached(&self, call: Call) {
        self.detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    async fn record<F, T, E, R>(
        &self,
        call: Call,
        op: F,
        hold_flush: bool,
        reached_server: R,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        R: FnOnce(&E) -> bool,
    {
        let mut state = self.state.lock().await;

        if state.trigger.is_closed() {
            tracing::debug!(action = %call.kind, "Profiling session closed; action not recorded");
            return op.await;
        }
        self.append_detached(&mut state);

        let result = op.await;
        if let Err(e) = &result {
            if !reached_server(e) {
                tracing::debug!(action = %call.kind, "Action never reached the server; not recorded");
                return result;
            }
        }

        let kind = call.kind;
        Self::append(&mut state, call);

        if !hold_flush && !self.has_open_transaction() && state.trigger.take() {
            if let Err(e) = self.flush_locked(&mut state).await {
                tracing::warn!(error = %e, "Automatic reconciliation failed");
            }
        } else if state.trigger.is_pending() {
            tracing::trace!(action = %kind, "Flush held while a transaction is open");
        }

        result
    }

    fn append(state: &mut SessionState, call: Call) {
        let kind = call.kind;
        let sequence_index =
            state
                .log
                .append(kind, call.text.as_deref(), call.parameters, call.origin);
        let count = state.log.reconcilable_count();
        state.trigger.record_append(kind.is_reconcilable(), count);

        tracing::trace!(
            db.sequence_index = sequence_index,
            action = %kind,
            "Recorded action"
        );
    }

    fn append_detached(&self, state: &mut SessionState) {
        let detached = std::mem::take(
            &mut *self
                .detached
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for call in detached {
            Self::append(state, call);
        }
    }

    async fn flush_locked(&self, state: &mut SessionState) -> Result<ReconcileSummary> {
        self.append_detached(state);
        let samples = self.source.fetch_samples().await?;
        Ok(state.log.reconcile(&self.reconciler, samples))
    }

    /// An explicit fetch would wait for the connection an open transaction
    /// holds, while the transaction's own statements wait for this session.
    fn ensure_no_transaction(&self) -> Result<()> {
        if self.has_open_transaction() {
            return Err(ProfilerError::TransactionOpen);
        }
        Ok(())
    }

    /// Fetch the current samples and apply them.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let mut state = self.state.lock().await;
        if state.trigger.is_closed() {
            return Err(ProfilerError::SessionClosed);
        }
        self.ensure_no_transaction()?;
        state.trigger.take();
        self.flush_locked(&mut state).await
    }

    /// Reconcile, then return the log. A closed session returns its final
    /// log as is.
    pub async fn get_log(&self) -> Result<Vec<QueryEvent>> {
        let mut state = self.state.lock().await;
        if !state.trigger.is_closed() {
            self.ensure_no_transaction()?;
            state.trigger.take();
            self.flush_locked(&mut state).await?;
        }
        Ok(state.log.to_vec())
    }

    /// Reconcile, then render the log.
    pub async fn render_report(&self, formatter: &dyn StatementFormatter) -> Result<Report> {
        let mut state = self.state.lock().await;
        if !state.trigger.is_closed() {
            self.ensure_no_transaction()?;
            state.trigger.take();
            self.flush_locked(&mut state).await?;
        }
        Ok(Report::build(
            &state.log,
            formatter,
            self.config.omit_pending_prepares,
        ))
    }

    /// The log as it stands, without reconciling.
    pub async fn snapshot(&self) -> EventLog {
        self.state.lock().await.log.clone()
    }

    /// Run the final reconciliation and freeze the log.
    ///
    /// Never fails: a failed final fetch leaves the affected durations unset,
    /// and so does closing while a transaction is still open.
    /// Only the first call reconciles; later calls return the frozen log.
    pub async fn close(&self) -> EventLog {
        let mut state = self.state.lock().await;

        if !state.trigger.begin_teardown() {
            return state.log.clone();
        }

        if self.has_open_transaction() {
            self.append_detached(&mut state);
            tracing::warn!(
                pending = state.log.pending_count(),
                "Profiling session closed with a transaction open; final batch not reconciled"
            );
        } else {
            match self.flush_locked(&mut state).await {
                Ok(summary) => tracing::debug!(
                    events = state.log.len(),
                    pending = state.log.pending_count(),
                    applied = summary.applied,
                    "Profiling session closed"
                ),
                Err(e) => tracing::warn!(
                    error = %e,
                    pending = state.log.pending_count(),
                    "Final reconciliation failed"
                ),
            }
        }

        state.log.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.trigger.is_closed()
    }
}

impl<S> Drop for ProfilingSession<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.trigger.is_closed() && !state.log.is_empty() {
            tracing::warn!(
                events = state.log.len(),
                "Profiling session dropped without close(); final batch not reconciled"
            );
        }
    }
}

impl<S> std::fmt::Debug for ProfilingSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilingSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
