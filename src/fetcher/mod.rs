use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::error::EtlError;
use crate::models::RawTable;

pub mod alpha_vantage;
pub mod database;
pub mod weather;

/// One extraction source of the pipeline.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self) -> Result<RawTable, EtlError>;
}

/// Shared HTTP client: bounded by `timeout`, identified by a fixed user agent.
pub(crate) fn http_client(source_name: &'static str, timeout: Duration) -> Result<Client, EtlError> {
    Client::builder()
        .user_agent(concat!("weather-stock-etl/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| EtlError::unavailable(source_name, format!("failed to build HTTP client: {}", e)))
}

/// Non-2xx answer. 5xx and 429 may clear up on their own, any other status
/// is returned to the caller without retry.
pub(crate) fn status_error(source_name: &'static str, status: StatusCode, body: &str) -> EtlError {
    let message = format!("HTTP {} - Body: {}", status, body.chars().take(200).collect::<String>());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        EtlError::unavailable(source_name, message)
    } else {
        EtlError::rejected(source_name, message)
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM` (treated as
/// UTC) or a bare date (midnight UTC).
pub fn parse_generation_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    let date_part = raw.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
