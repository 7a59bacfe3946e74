use anyhow::Context;
use chrono::NaiveDate;
use weather_stock_etl::config::Config;
use weather_stock_etl::core::backfill::backfill_from_sources;
use weather_stock_etl::core::orchestrator::Sources;
use weather_stock_etl::db::SqliteWarehouse;
use weather_stock_etl::fetcher::alpha_vantage::OutputSize;

fn date_var(key: &str) -> anyhow::Result<NaiveDate> {
    let raw = std::env::var(key).with_context(|| format!("{} is not set", key))?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("{}='{}' is not a YYYY-MM-DD date", key, raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    weather_stock_etl::init_tracing();

    let config = Config::from_env()?;
    let start = date_var("BACKFILL_START")?;
    let end = date_var("BACKFILL_END")?;

    // No notifier: a backfill never alerts.
    let sources = Sources::from_config(&config, OutputSize::Full)?;
    let warehouse = SqliteWarehouse::init(&config.warehouse.url, config.warehouse.write_mode).await?;

    let report = backfill_from_sources(&sources, &warehouse, config.gap_policy, start, end).await?;
    println!(
        "Backfilled {} records between {} and {} ({} replaced)",
        report.load.inserted, report.start, report.end, report.load.replaced
    );
    Ok(())
}
