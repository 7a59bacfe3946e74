use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use anyhow::Result;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::EtlError;
use crate::models::{MergedRecord, WarehouseRow};

/// How the writer treats rows whose natural key
/// `(fecha_generacion, stock_symbol)` is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Insert only; repeated loads duplicate natural keys.
    Append,
    /// Replace existing rows with the same natural key.
    #[default]
    Upsert,
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(WriteMode::Append),
            "upsert" => Ok(WriteMode::Upsert),
            other => Err(format!("unknown write mode '{}', expected append or upsert", other)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: usize,
    /// Rows removed because a loaded record carried the same natural key
    pub replaced: u64,
}

/// Persistent sink for merged records.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn load(&self, records: &[MergedRecord]) -> Result<LoadReport, EtlError>;
}

/// `datos_ingestados` in a SQLite warehouse.
pub struct SqliteWarehouse {
    pool: SqlitePool,
    mode: WriteMode,
}

impl SqliteWarehouse {
    pub async fn init(database_url: &str, mode: WriteMode) -> Result<Self> {
        info!(url = database_url, ?mode, "connecting to warehouse");

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // One writer connection: loads are sequential and an in-memory
        // database lives only as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, mode).await
    }

    pub async fn from_pool(pool: SqlitePool, mode: WriteMode) -> Result<Self> {
        debug!("running warehouse migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, mode })
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// All rows in natural-key order.
    pub async fn rows(&self) -> Result<Vec<WarehouseRow>, EtlError> {
        sqlx::query_as::<_, WarehouseRow>(
            r#"
            SELECT id, fecha_extraccion, fecha_generacion, temperatura, stock_symbol,
                   stock_close, stock_volume, clima_descripcion, clima_humedad,
                   rendimiento_acciones, comentarios
            FROM datos_ingestados
            ORDER BY fecha_generacion, stock_symbol, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(EtlError::read)
    }

    pub async fn count(&self) -> Result<i64, EtlError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM datos_ingestados")
            .fetch_one(&self.pool)
            .await
            .map_err(EtlError::read)
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn load(&self, records: &[MergedRecord]) -> Result<LoadReport, EtlError> {
        if records.is_empty() {
            return Ok(LoadReport::default());
        }

        let extracted_at = chrono::Utc::now();
        let mut report = LoadReport::default();

        // One transaction per load: all rows land or none do.
        let mut tx = self.pool.begin().await.map_err(EtlError::write)?;

        for record in records {
            let mut weather = (
                record.temperature,
                record.weather_description.clone(),
                record.humidity,
            );

            if self.mode == WriteMode::Upsert {
                // A reload without an observation keeps the one already stored.
                if record.temperature.is_none() {
                    let previous: Option<(Option<f64>, Option<String>, Option<i64>)> = sqlx::query_as(
                        "SELECT temperatura, clima_descripcion, clima_humedad FROM datos_ingestados
                         WHERE fecha_generacion = $1 AND stock_symbol = $2
                         ORDER BY id DESC LIMIT 1",
                    )
                    .bind(record.generation_date)
                    .bind(&record.stock_symbol)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(EtlError::write)?;

                    if let Some(previous) = previous {
                        weather = previous;
                    }
                }

                let deleted = sqlx::query(
                    "DELETE FROM datos_ingestados WHERE fecha_generacion = $1 AND stock_symbol = $2",
                )
                .bind(record.generation_date)
                .bind(&record.stock_symbol)
                .execute(&mut *tx)
                .await
                .map_err(EtlError::write)?;
                report.replaced += deleted.rows_affected();
            }

            let (temperature, description, humidity) = weather;

            sqlx::query(
                "INSERT INTO datos_ingestados (
                    fecha_extraccion, fecha_generacion, temperatura, stock_symbol, stock_close,
                    stock_volume, clima_descripcion, clima_humedad, rendimiento_acciones, comentarios
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(extracted_at)
            .bind(record.generation_date)
            .bind(temperature)
            .bind(&record.stock_symbol)
            .bind(record.stock_close)
            .bind(record.stock_volume)
            .bind(description)
            .bind(humidity)
            .bind(record.stock_return)
            .bind(&record.comments)
            .execute(&mut *tx)
            .await
            .map_err(EtlError::write)?;

            report.inserted += 1;
        }

        tx.commit().await.map_err(EtlError::write)?;

        info!(
            inserted = report.inserted,
            replaced = report.replaced,
            mode = ?self.mode,
            "loaded records into warehouse"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn record(day: u32, close: f64) -> MergedRecord {
        MergedRecord {
            generation_date: NaiveDate::from_ymd_opt(2023, 10, day).unwrap(),
            stock_symbol: "AAPL".to_string(),
            stock_open: Some(close - 1.0),
            stock_high: Some(close + 1.0),
            stock_low: Some(close - 2.0),
            stock_close: close,
            stock_volume: Some(1_000),
            temperature: Some(22.5),
            weather_description: Some("Overcast".to_string()),
            humidity: Some(60),
            stock_return: None,
            comments: Some("seed".to_string()),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_write_mode_from_str() {
        assert_eq!("append".parse::<WriteMode>(), Ok(WriteMode::Append));
        assert_eq!("UPSERT".parse::<WriteMode>(), Ok(WriteMode::Upsert));
        assert!("merge".parse::<WriteMode>().is_err());
    }

    #[tokio::test]
    async fn test_load_persists_columns() {
        let warehouse = SqliteWarehouse::init("sqlite::memory:", WriteMode::Append).await.unwrap();
        let report = warehouse.load(&[record(17, 177.15)]).await.unwrap();
        assert_eq!(report, LoadReport { inserted: 1, replaced: 0 });

        let rows = warehouse.rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.fecha_generacion, NaiveDate::from_ymd_opt(2023, 10, 17).unwrap());
        assert_eq!(row.stock_symbol.as_deref(), Some("AAPL"));
        assert_eq!(row.stock_close, Some(177.15));
        assert_eq!(row.stock_volume, Some(1_000));
        assert_eq!(row.temperatura, Some(22.5));
        assert_eq!(row.clima_descripcion.as_deref(), Some("Overcast"));
        assert_eq!(row.clima_humedad, Some(60));
        assert_eq!(row.rendimiento_acciones, None);
        assert_eq!(row.comentarios.as_deref(), Some("seed"));
    }

    #[tokio::test]
    async fn test_empty_load_is_noop() {
        let warehouse = SqliteWarehouse::init("sqlite::memory:", WriteMode::Append).await.unwrap();
        let report = warehouse.load(&[]).await.unwrap();
        assert_eq!(report, LoadReport::default());
        assert_eq!(warehouse.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_duplicates_natural_key() {
        let warehouse = SqliteWarehouse::init("sqlite::memory:", WriteMode::Append).await.unwrap();
        warehouse.load(&[record(17, 100.0)]).await.unwrap();
        warehouse.load(&[record(17, 100.0)]).await.unwrap();
        assert_eq!(warehouse.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_natural_key() {
        let warehouse = SqliteWarehouse::init("sqlite::memory:", WriteMode::Upsert).await.unwrap();
        warehouse.load(&[record(17, 100.0), record(18, 101.0)]).await.unwrap();
        let report = warehouse.load(&[record(18, 105.0)]).await.unwrap();
        assert_eq!(report, LoadReport { inserted: 1, replaced: 1 });

        let rows = warehouse.rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].stock_close, Some(105.0));
        // surrogate ids keep growing
        assert!(rows[1].id > rows[0].id);
    }

    #[tokio::test]
    async fn test_upsert_without_observation_keeps_stored_weather() {
        let warehouse = SqliteWarehouse::init("sqlite::memory:", WriteMode::Upsert).await.unwrap();
        warehouse.load(&[record(17, 100.0)]).await.unwrap();

        let mut reload = record(17, 102.0);
        reload.temperature = None;
        reload.weather_description = None;
        reload.humidity = None;
        warehouse.load(&[reload]).await.unwrap();

        let rows = warehouse.rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stock_close, Some(102.0));
        assert_eq!(rows[0].temperatura, Some(22.5));
        assert_eq!(rows[0].clima_descripcion.as_deref(), Some("Overcast"));
        assert_eq!(rows[0].clima_humedad, Some(60));
    }

    #[tokio::test]
    async fn test_read_failures_are_query_errors() {
        let warehouse = SqliteWarehouse::init("sqlite::memory:", WriteMode::Append).await.unwrap();
        warehouse.pool.close().await;

        assert!(matches!(warehouse.count().await, Err(EtlError::Query(_))));
        assert!(matches!(warehouse.rows().await, Err(EtlError::Query(_))));
    }
}
