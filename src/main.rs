use weather_stock_etl::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    weather_stock_etl::init_tracing();

    let config = Config::from_env()?;
    weather_stock_etl::run(config).await
}
