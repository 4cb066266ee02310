//! Basic example showing how to use sea-orm-profiler.
//!
//! Run with: DATABASE_URL=mysql://root@localhost/test cargo run --example basic

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DbBackend, Statement, Value};
use sea_orm_profiler::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sea_orm_profiler=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "mysql://root@localhost/test".into());

    // SHOW PROFILES is per server session, so the pool must hold one connection
    let mut options = ConnectOptions::new(database_url);
    options.max_connections(1).min_connections(1);

    tracing::info!("Connecting to database...");
    let db = Database::connect(options)
        .await?
        .with_profiling_config(ProfilerConfig::development().with_flush_threshold(50))
        .await?;

    for id in 1i32..=3 {
        db.at(Origin::caller())
            .query_all(Statement::from_sql_and_values(
                DbBackend::MySql,
                "SELECT ? AS id,\n       SLEEP(0.01) AS slept",
                [Value::from(id)],
            ))
            .await?;
    }

    let txn = db.begin().await?;
    txn.execute_unprepared("DO 1").await?;
    txn.commit().await?;

    let report = db.render_report(&ClauseFormatter).await?;
    println!("{report}");

    db.close().await;
    Ok(())
}
