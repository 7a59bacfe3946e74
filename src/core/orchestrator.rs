use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{Config, LiveWindow};
use crate::core::alerts::AlertEvaluator;
use crate::core::merge::{merge, GapPolicy};
use crate::db::{SqliteWarehouse, Warehouse};
use crate::error::EtlError;
use crate::fetcher::alpha_vantage::{AlphaVantageFetcher, OutputSize};
use crate::fetcher::database::DatabaseFetcher;
use crate::fetcher::weather::WeatherFetcher;
use crate::fetcher::DataSource;
use crate::models::{AlertEvent, MergedRecord};
use crate::notify::SmtpNotifier;

/// The three extraction adapters, called in this order.
pub struct Sources {
    pub database: Box<dyn DataSource>,
    pub weather: Box<dyn DataSource>,
    pub stock: Box<dyn DataSource>,
}

impl Sources {
    /// `output_size` picks how much stock history each extraction pulls.
    pub fn from_config(config: &Config, output_size: OutputSize) -> Result<Self, EtlError> {
        Ok(Self {
            database: Box::new(DatabaseFetcher::connect_lazy(&config.source_db, &config.http)?),
            weather: Box::new(WeatherFetcher::new(&config.weather, &config.http)?),
            stock: Box::new(AlphaVantageFetcher::new(&config.stock, &config.http, output_size)?),
        })
    }

    /// Pull all three sources and join them. Any adapter error aborts.
    pub async fn extract_and_merge(&self, gap_policy: GapPolicy) -> Result<Extraction, EtlError> {
        let db = self.database.extract().await?;
        let weather = self.weather.extract().await?;
        let stocks = self.stock.extract().await?;

        if stocks.is_empty() {
            return Ok(Extraction::NoStockData);
        }

        let merged = merge(&weather, &stocks, &db, gap_policy)?;
        Ok(Extraction::Merged(merged))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub gap_policy: GapPolicy,
    pub live_window: LiveWindow,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            gap_policy: GapPolicy::NullFill,
            live_window: LiveWindow::LatestDays(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        rows_written: usize,
        alert: Option<AlertEvent>,
    },
    /// The stock provider returned no series; nothing was written or alerted.
    SkippedNoStockData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Merged(Vec<MergedRecord>),
    NoStockData,
}

/// Extract → merge → load → alert, one pass per call.
pub struct Pipeline {
    sources: Sources,
    warehouse: Arc<dyn Warehouse>,
    alerts: AlertEvaluator,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        sources: Sources,
        warehouse: Arc<dyn Warehouse>,
        alerts: AlertEvaluator,
        options: PipelineOptions,
    ) -> Self {
        Self { sources, warehouse, alerts, options }
    }

    /// Production wiring for the live loop.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let (smtp, recipient) = config.mail()?;
        let sources = Sources::from_config(config, OutputSize::Compact)?;

        let warehouse = SqliteWarehouse::init(&config.warehouse.url, config.warehouse.write_mode).await?;
        let notifier = SmtpNotifier::new(smtp, recipient, config.http.timeout)?;

        Ok(Self::new(
            sources,
            Arc::new(warehouse),
            AlertEvaluator::new(config.alert.temperature_limit, Arc::new(notifier)),
            PipelineOptions {
                gap_policy: config.gap_policy,
                live_window: config.schedule.live_window,
            },
        ))
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.warehouse.as_ref()
    }

    pub async fn extract_and_merge(&self) -> Result<Extraction, EtlError> {
        self.sources.extract_and_merge(self.options.gap_policy).await
    }

    pub async fn run(&self) -> Result<RunOutcome, EtlError> {
        let started = Instant::now();

        let merged = match self.extract_and_merge().await? {
            Extraction::Merged(records) => records,
            Extraction::NoStockData => {
                warn!("no stock data available, skipping this run");
                return Ok(RunOutcome::SkippedNoStockData);
            }
        };

        let records = select_live_window(merged, self.options.live_window);
        let report = self.warehouse.load(&records).await?;
        let alert = self.alerts.evaluate(&records).await;

        info!(
            rows_written = report.inserted,
            replaced = report.replaced,
            alerted = alert.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ETL run complete"
        );

        Ok(RunOutcome::Completed {
            rows_written: report.inserted,
            alert,
        })
    }
}

/// Keep the records of the latest `n` generation dates. Expects the
/// ascending, one-per-date order `merge` produces.
pub fn select_live_window(records: Vec<MergedRecord>, window: LiveWindow) -> Vec<MergedRecord> {
    match window {
        LiveWindow::All => records,
        LiveWindow::LatestDays(n) => {
            let skip = records.len().saturating_sub(n);
            records.into_iter().skip(skip).collect()
        }
    }
}
