use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::core::orchestrator::{Pipeline, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Ran(RunOutcome),
    /// The run aborted; the error has already been logged.
    Failed(String),
    /// A previous run was still in flight.
    Skipped,
}

/// Wraps a pipeline so at most one run is in flight. A failed run never
/// stops the loop.
pub struct EtlLoop {
    pipeline: Pipeline,
    running: Mutex<()>,
}

impl EtlLoop {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            running: Mutex::new(()),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn state(&self) -> LoopState {
        match self.running.try_lock() {
            Ok(_) => LoopState::Idle,
            Err(_) => LoopState::Running,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("previous ETL run still in progress, skipping tick");
            return TickOutcome::Skipped;
        };

        match self.pipeline.run().await {
            Ok(outcome) => TickOutcome::Ran(outcome),
            Err(e) => {
                error!(error = %e, "ETL run failed");
                TickOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Register the loop on `cron` (six-field, seconds first) and start the
/// scheduler.
pub async fn init(etl: Arc<EtlLoop>, cron: &str) -> Result<JobScheduler, anyhow::Error> {
    let sched = JobScheduler::new().await?;

    sched
        .add(Job::new_async(cron, move |_uuid, _l| {
            let etl = etl.clone();
            Box::pin(async move {
                info!("running scheduled ETL job");
                etl.tick().await;
            })
        })?)
        .await?;

    sched.start().await?;
    info!(schedule = cron, "scheduler started");
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveWindow;
    use crate::core::alerts::AlertEvaluator;
    use crate::core::merge::GapPolicy;
    use crate::core::orchestrator::{PipelineOptions, Sources};
    use crate::db::{LoadReport, Warehouse};
    use crate::error::EtlError;
    use crate::fetcher::alpha_vantage::{CLOSE, SYMBOL};
    use crate::fetcher::DataSource;
    use crate::models::{ColumnValue, MergedRecord, RawRecord, RawTable, SourceKind};
    use crate::notify::Notifier;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Static(RawTable);

    #[async_trait]
    impl DataSource for Static {
        fn name(&self) -> &str {
            "static"
        }

        async fn extract(&self) -> Result<RawTable, EtlError> {
            Ok(self.0.clone())
        }
    }

    struct Down;

    #[async_trait]
    impl DataSource for Down {
        fn name(&self) -> &str {
            "down"
        }

        async fn extract(&self) -> Result<RawTable, EtlError> {
            Err(EtlError::Connection("connection refused".into()))
        }
    }

    /// Blocks inside `load` until released.
    #[derive(Default)]
    struct GatedWarehouse {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Warehouse for GatedWarehouse {
        async fn load(&self, records: &[MergedRecord]) -> Result<LoadReport, EtlError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(LoadReport { inserted: records.len(), replaced: 0 })
        }
    }

    struct Silent;

    #[async_trait]
    impl Notifier for Silent {
        async fn send(&self, _subject: &str, _body: &str) -> Result<(), EtlError> {
            Ok(())
        }
    }

    fn stock_table() -> RawTable {
        let at = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
        RawTable::new(
            SourceKind::Stock,
            vec![RawRecord::new(at)
                .with(SYMBOL, ColumnValue::Text("AAPL".into()))
                .with(CLOSE, ColumnValue::Float(150.0))],
        )
    }

    fn etl(database: Box<dyn DataSource>, warehouse: Arc<dyn Warehouse>) -> EtlLoop {
        let sources = Sources {
            database,
            weather: Box::new(Static(RawTable::empty(SourceKind::Weather))),
            stock: Box::new(Static(stock_table())),
        };
        let options = PipelineOptions {
            gap_policy: GapPolicy::NullFill,
            live_window: LiveWindow::LatestDays(1),
        };
        EtlLoop::new(Pipeline::new(
            sources,
            warehouse,
            AlertEvaluator::new(30.0, Arc::new(Silent)),
            options,
        ))
    }

    #[tokio::test]
    async fn test_tick_skipped_while_running() {
        let warehouse = Arc::new(GatedWarehouse::default());
        let etl = Arc::new(etl(
            Box::new(Static(RawTable::empty(SourceKind::Database))),
            warehouse.clone(),
        ));

        let first = tokio::spawn({
            let etl = etl.clone();
            async move { etl.tick().await }
        });

        warehouse.entered.notified().await;
        assert_eq!(etl.state(), LoopState::Running);
        assert_eq!(etl.tick().await, TickOutcome::Skipped);

        warehouse.release.notify_one();
        let outcome = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Ran(RunOutcome::Completed { rows_written: 1, .. })
        ));
        assert_eq!(etl.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_failed_run_returns_to_idle() {
        let warehouse = Arc::new(GatedWarehouse::default());
        let etl = etl(Box::new(Down), warehouse);

        assert!(matches!(etl.tick().await, TickOutcome::Failed(_)));
        assert_eq!(etl.state(), LoopState::Idle);
    }
}
