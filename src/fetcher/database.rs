use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{parse_generation_timestamp, DataSource};
use crate::config::{HttpConfig, SourceDbConfig};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::error::{ConfigError, EtlError};
use crate::models::{ColumnValue, RawRecord, RawTable, SourceKind};

const SOURCE: &str = "database";

/// Column every source row must carry to be joined by date.
pub const GENERATION_DATE: &str = "fecha_generacion";

/// Runs a fixed selection query against the primary relational store.
pub struct DatabaseFetcher {
    pool: SqlitePool,
    query: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl DatabaseFetcher {
    /// The pool connects on first use, so an unreachable store fails the run
    /// instead of startup.
    pub fn connect_lazy(config: &SourceDbConfig, http: &HttpConfig) -> Result<Self, EtlError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| ConfigError::Invalid {
                key: "SOURCE_DATABASE_URL",
                value: config.url.clone(),
                reason: e.to_string(),
            })?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(http.timeout)
            .connect_lazy_with(options);

        Ok(Self::from_pool(pool, config.query.clone(), http.timeout, http.retry.clone()))
    }

    pub fn from_pool(pool: SqlitePool, query: String, timeout: Duration, retry: RetryPolicy) -> Self {
        Self { pool, query, timeout, retry }
    }

    async fn fetch_once(&self) -> Result<RawTable, EtlError> {
        let rows = tokio::time::timeout(self.timeout, sqlx::query(&self.query).fetch_all(&self.pool))
            .await
            .map_err(|_| EtlError::timeout(self.timeout))?
            .map_err(EtlError::from_source_db)?;

        let records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RawTable::new(SourceKind::Database, records))
    }
}

fn row_to_record(row: &SqliteRow) -> Result<RawRecord, EtlError> {
    let mut columns = BTreeMap::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx).map_err(EtlError::from_source_db)?;
        // Runtime storage class, not the declared column type.
        let storage = if raw.is_null() {
            None
        } else {
            Some(raw.type_info().name().to_string())
        };

        let value = match storage.as_deref() {
            None => ColumnValue::Null,
            Some("INTEGER") => ColumnValue::Integer(row.try_get(idx).map_err(EtlError::from_source_db)?),
            Some("REAL") => ColumnValue::Float(row.try_get(idx).map_err(EtlError::from_source_db)?),
            Some("TEXT") => ColumnValue::Text(row.try_get(idx).map_err(EtlError::from_source_db)?),
            Some(other) => {
                debug!(column = column.name(), storage = other, "dropping unsupported column value");
                ColumnValue::Null
            }
        };
        columns.insert(column.name().to_string(), value);
    }

    let generated_at = match columns.remove(GENERATION_DATE) {
        Some(ColumnValue::Text(raw)) => parse_generation_timestamp(&raw).ok_or_else(|| {
            EtlError::Query(format!("unparseable {} value {:?}", GENERATION_DATE, raw))
        })?,
        Some(other) => {
            return Err(EtlError::Query(format!(
                "{} must be a date string, got {:?}",
                GENERATION_DATE, other
            )))
        }
        None => {
            return Err(EtlError::Query(format!(
                "source query result has no {} column",
                GENERATION_DATE
            )))
        }
    };

    Ok(RawRecord { generated_at, columns })
}

#[async_trait]
impl DataSource for DatabaseFetcher {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn extract(&self) -> Result<RawTable, EtlError> {
        let table = with_retry(&self.retry, SOURCE, || self.fetch_once()).await?;
        info!(rows = table.len(), "extracted source database rows");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn fetcher(pool: SqlitePool, query: &str) -> DatabaseFetcher {
        DatabaseFetcher::from_pool(pool, query.to_string(), Duration::from_secs(5), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_extract_typed_columns() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE source_records (
                fecha_generacion TEXT NOT NULL,
                stock_symbol TEXT,
                comentarios TEXT,
                visits INTEGER,
                score REAL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO source_records VALUES
                ('2023-10-17', 'AAPL', 'quiet day', 12, 0.5),
                ('2023-10-18', 'AAPL', NULL, 7, 1.25)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let table = fetcher(pool, "SELECT * FROM source_records ORDER BY fecha_generacion")
            .extract()
            .await
            .unwrap();

        assert_eq!(table.source, SourceKind::Database);
        assert_eq!(table.len(), 2);

        let first = &table.records[0];
        assert_eq!(first.generation_date(), NaiveDate::from_ymd_opt(2023, 10, 17).unwrap());
        assert_eq!(first.text("comentarios"), Some("quiet day"));
        assert_eq!(first.integer("visits"), Some(12));
        assert_eq!(first.float("score"), Some(0.5));
        assert!(first.get(GENERATION_DATE).is_none());

        assert_eq!(table.records[1].get("comentarios"), Some(&ColumnValue::Null));
    }

    #[tokio::test]
    async fn test_missing_generation_date_is_query_error() {
        let pool = memory_pool().await;
        let result = fetcher(pool, "SELECT 1 AS visits").extract().await;
        assert!(matches!(result, Err(EtlError::Query(_))));
    }

    #[tokio::test]
    async fn test_unknown_table_is_query_error() {
        let pool = memory_pool().await;
        let result = fetcher(pool, "SELECT * FROM missing_table").extract().await;
        assert!(matches!(result, Err(EtlError::Query(_))));
    }

    #[tokio::test]
    async fn test_closed_pool_is_connection_error() {
        let pool = memory_pool().await;
        pool.close().await;
        let result = fetcher(pool, "SELECT '2023-10-17' AS fecha_generacion").extract().await;
        assert!(matches!(result, Err(EtlError::Connection(_))));
    }
}
