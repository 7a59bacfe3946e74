use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod notify;

use crate::config::Config;
use crate::core::orchestrator::Pipeline;
use crate::core::scheduler::{self, EtlLoop, TickOutcome};

/// `RUST_LOG` filter, `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the pipeline once, or hand it to the cron scheduler and park forever.
///
/// In run-once mode a failed run is returned as an error so the process exits
/// non-zero.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(&config).await?;
    let etl = Arc::new(EtlLoop::new(pipeline));

    if config.schedule.run_once {
        info!("running ETL once");
        return match etl.tick().await {
            TickOutcome::Failed(e) => Err(anyhow::anyhow!("ETL run failed: {}", e)),
            _ => Ok(()),
        };
    }

    let _sched = scheduler::init(etl, &config.schedule.cron).await?;
    std::future::pending::<()>().await;
    Ok(())
}
