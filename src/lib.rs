//! # sea-orm-profiler
//!
//! Per-statement query log for SeaORM with server-measured durations.
//!
//! Every statement run through a [`ProfiledConnection`] is appended to an
//! ordered event log together with its bind parameters and call site. Every
//! `flush_threshold` statements, and once more when the session closes, the
//! durations MySQL recorded in `SHOW PROFILES` are written back onto the
//! matching events.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sea_orm::{ConnectOptions, Database};
//! use sea_orm_profiler::prelude::*;
//!
//! // profiling is per server session: one connection only
//! let mut options = ConnectOptions::new("mysql://localhost/mydb");
//! options.max_connections(1);
//!
//! let db = Database::connect(options).await?.with_profiling().await?;
//!
//! let users = Users::find().all(&db.at(Origin::caller())).await?;
//!
//! let report = db.render_report(&ClauseFormatter).await?;
//! println!("{report}");
//! db.close().await;
//! ```
//!
//! ## How durations are matched
//!
//! The server numbers each profiled statement, starting with the bookkeeping
//! statements issued while enabling profiling. A sample numbered `n` belongs
//! to the `(n - offset)`-th reconcilable event, `offset` being the number of
//! bookkeeping statements. PREPARE events are logged but never matched.
//! Statement text is never used to match, so repeated identical statements
//! are timed correctly.
//!
//! ## Core without SeaORM
//!
//! [`ProfilingSession`] works with any [`ProfilingSource`] and wraps any
//! transport future through [`ProfilingSession::instrument`] or a
//! [`Transport`] implementation.

mod config;
mod connection;
mod duration;
mod error;
mod event;
mod flush;
mod log;
mod mysql;
mod parser;
mod reconcile;
mod report;
mod session;

pub use config::ProfilerConfig;
pub use connection::{ProfiledConnection, ProfiledTransaction, ProfilingExt};
pub use duration::{format_micros, DurationUnit, FormattedDuration};
pub use error::{ProfilerError, Result};
pub use event::{ActionKind, BindValue, Origin, QueryEvent};
pub use flush::FlushTrigger;
pub use log::EventLog;
pub use mysql::{enable_profiling, ShowProfiles, ENABLE_PROFILING, SHOW_PROFILES};
pub use parser::normalize_statement;
pub use reconcile::{ProfilingSample, RawSample, ReconcileSummary, Reconciler};
pub use report::{
    ClauseFormatter, PlainFormatter, Report, ReportRow, StatementFormatter, NO_PARAMETERS,
};
pub use session::{Call, ProfilingSession, ProfilingSource, Transport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ClauseFormatter, Origin, PlainFormatter, ProfiledConnection, ProfilerConfig,
        ProfilingExt,
    };
}
