use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use super::{http_client, status_error, DataSource};
use crate::config::{HttpConfig, StockConfig};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::error::EtlError;
use crate::models::{ColumnValue, RawRecord, RawTable, SourceKind};

const SOURCE: &str = "stock";
const SERIES_KEY: &str = "Time Series (Daily)";

pub const SYMBOL: &str = "symbol";
pub const OPEN: &str = "open";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
pub const CLOSE: &str = "close";
pub const VOLUME: &str = "volume";

/// `compact` returns the latest 100 sessions, `full` the whole history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSize {
    Compact,
    Full,
}

impl OutputSize {
    fn as_str(&self) -> &'static str {
        match self {
            OutputSize::Compact => "compact",
            OutputSize::Full => "full",
        }
    }
}

/// Daily OHLCV series for one symbol from Alpha Vantage `TIME_SERIES_DAILY`.
pub struct AlphaVantageFetcher {
    client: Client,
    api_url: String,
    api_key: String,
    symbol: String,
    output_size: OutputSize,
    retry: RetryPolicy,
}

impl AlphaVantageFetcher {
    pub fn new(config: &StockConfig, http: &HttpConfig, output_size: OutputSize) -> Result<Self, EtlError> {
        Ok(Self {
            client: http_client(SOURCE, http.timeout)?,
            api_url: config.api_url.clone(),
            api_key: config.api_key.trim().to_string(),
            symbol: config.symbol.clone(),
            output_size,
            retry: http.retry.clone(),
        })
    }

    async fn fetch_once(&self) -> Result<RawTable, EtlError> {
        let params = [
            ("function", "TIME_SERIES_DAILY"),
            ("symbol", self.symbol.as_str()),
            ("outputsize", self.output_size.as_str()),
            ("apikey", self.api_key.as_str()),
        ];

        let resp = self
            .client
            .get(&self.api_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| EtlError::unavailable(SOURCE, e.without_url().to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(status_error(SOURCE, status, &error_text));
        }

        // Rate-limit and bad-symbol answers come back as 200 with a different
        // JSON shape, so only transport failures are errors here.
        let json: Value = resp
            .json()
            .await
            .map_err(|e| EtlError::unavailable(SOURCE, e.without_url().to_string()))?;

        Ok(Self::parse_daily_series(&json, &self.symbol))
    }

    /// Returns an empty table when the payload has no daily series.
    fn parse_daily_series(json: &Value, symbol: &str) -> RawTable {
        let Some(series) = json.get(SERIES_KEY).and_then(Value::as_object) else {
            let provider_message = ["Note", "Information", "Error Message"]
                .iter()
                .find_map(|key| json.get(*key).and_then(Value::as_str))
                .unwrap_or("unexpected payload shape");
            warn!(symbol, provider_message, "no daily series in stock response");
            return RawTable::empty(SourceKind::Stock);
        };

        let mut records = Vec::with_capacity(series.len());

        for (date_str, fields) in series {
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                warn!(symbol, date = %date_str, "skipping entry with unparseable date");
                continue;
            };

            let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
                field_f64(fields, OPEN),
                field_f64(fields, HIGH),
                field_f64(fields, LOW),
                field_f64(fields, CLOSE),
                field_i64(fields, VOLUME),
            ) else {
                warn!(symbol, %date, "skipping entry with missing or non-numeric fields");
                continue;
            };

            let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
                continue;
            };

            records.push(
                RawRecord::new(midnight.and_utc())
                    .with(SYMBOL, ColumnValue::Text(symbol.to_string()))
                    .with(OPEN, ColumnValue::Float(open))
                    .with(HIGH, ColumnValue::Float(high))
                    .with(LOW, ColumnValue::Float(low))
                    .with(CLOSE, ColumnValue::Float(close))
                    .with(VOLUME, ColumnValue::Integer(volume)),
            );
        }

        records.sort_by_key(|r| r.generated_at);
        RawTable::new(SourceKind::Stock, records)
    }
}

/// Look up `name` among keys like `"4. close"` or plain `"close"`.
fn field<'a>(fields: &'a Value, name: &str) -> Option<&'a Value> {
    fields.as_object()?.iter().find_map(|(key, value)| {
        let bare = key.split_once(". ").map(|(_, rest)| rest).unwrap_or(key.as_str());
        (bare == name).then_some(value)
    })
}

fn field_f64(fields: &Value, name: &str) -> Option<f64> {
    match field(fields, name)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn field_i64(fields: &Value, name: &str) -> Option<i64> {
    match field(fields, name)? {
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|v| v as i64))
        }
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        _ => None,
    }
}

#[async_trait]
impl DataSource for AlphaVantageFetcher {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn extract(&self) -> Result<RawTable, EtlError> {
        let table = with_retry(&self.retry, SOURCE, || self.fetch_once()).await?;
        info!(symbol = %self.symbol, rows = table.len(), "fetched daily stock series");
        Ok(table)
    }
}
